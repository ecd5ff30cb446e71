//! Wires a real `std::net::UdpSocket` to `dns::DnsResponder`, the concrete
//! counterpart of the `RecordingSocket` test double in `dns`'s own test
//! suite.

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::SystemTime;

use dns::{DnsResponder, DnsZone, KvpReceiver, UdpSocket};
use trc::{event, DnsEvent, EventType};
use utils::BufferPool;

struct RealUdpSocket(StdUdpSocket);

impl UdpSocket for RealUdpSocket {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> trc::Result<()> {
        self.0.send_to(buf, addr).map(|_| ()).map_err(trc::Error::from)
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Runs forever on the calling thread; `main` spawns this as its own thread.
pub fn run(
    listen: SocketAddr,
    zone: Arc<DnsZone>,
    account_store: Arc<dyn directory::AccountStore>,
    kvp: Arc<KvpReceiver>,
    nmembufs: usize,
    buf_size: usize,
) -> trc::Result<()> {
    let sock = StdUdpSocket::bind(listen).map_err(trc::Error::from)?;
    let pool = BufferPool::new(nmembufs, buf_size);
    let mut responder = DnsResponder::new(pool, zone, account_store, kvp, RealUdpSocket(sock.try_clone().map_err(trc::Error::from)?));

    let mut recv_buf = vec![0u8; buf_size];
    loop {
        let (n, src) = match sock.recv_from(&mut recv_buf) {
            Ok(v) => v,
            Err(e) => {
                event!(EventType::Dns(DnsEvent::SendError), "error" = e.to_string());
                continue;
            }
        };
        match responder.on_datagram(&recv_buf[..n], src, now_ns()) {
            Ok(_) => {}
            Err(e) => {
                event!(EventType::Dns(DnsEvent::SendError), "error" = e.to_string());
                if responder.closed {
                    return Err(e);
                }
            }
        }
    }
}

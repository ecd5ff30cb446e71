//! Peer-facing side of kvpsync: binds one UDP socket, sends each configured
//! peer its boot ACK, then answers every inbound `Update` with the ACK
//! `KvpReceiver::apply` computes. Peer identity is the source address
//! matching the configured peer list, in config order (see DESIGN.md).

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use dns::{read_update, write_ack, KvpReceiver};
use trc::{event, EventType, KvpSyncEvent};

pub fn run(listen: SocketAddr, peers: Vec<SocketAddr>, kvp: Arc<KvpReceiver>) -> trc::Result<()> {
    let sock = UdpSocket::bind(listen).map_err(trc::Error::from)?;

    for (ack, peer_addr) in kvp.boot_acks().into_iter().zip(peers.iter()) {
        let mut buf = Vec::new();
        write_ack(&ack, &mut buf);
        let _ = sock.send_to(&buf, peer_addr);
    }

    let mut recv_buf = vec![0u8; 2048];
    loop {
        let (n, src) = match sock.recv_from(&mut recv_buf) {
            Ok(v) => v,
            Err(e) => {
                event!(EventType::KvpSync(KvpSyncEvent::Expired), "error" = e.to_string());
                continue;
            }
        };

        let Some(peer_idx) = peers.iter().position(|p| *p == src) else {
            continue;
        };
        let Some(update) = read_update(&recv_buf[..n]) else {
            continue;
        };

        let ack = kvp.apply(peer_idx, update);
        let mut out = Vec::new();
        write_ack(&ack, &mut out);
        let _ = sock.send_to(&out, src);
    }
}

//! Entry point: loads configuration, installs logging, wires the device-key
//! store, DNS responder and kvpsync peers, and drives the DN accept loop
//! onto the worker pool.

mod alert;
mod config;
mod dns_task;
mod kvpsync_task;
mod tls;

use std::net::TcpListener;
use std::sync::Arc;

use clap::Parser;
use directory::{AccountStore, DeviceKeyStore, SqliteStore};
use dns::{DnsZone, KvpReceiver};
use imap::{CitmSession, Handle, Transport, WorkerPool};
use rustls::{ClientConnection, ServerConnection};
use trc::{event, Collector, EventType, Level, ServerEvent, TextSubscriber};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "citmd", about = "Splintermail CITM proxy")]
struct Args {
    #[arg(long, default_value = "/etc/splintermail/citm.toml")]
    config: std::path::PathBuf,
}

type DnWriter = tls::TlsWriter<ServerConnection>;
type UpWriter = tls::TlsWriter<ClientConnection>;
type Citm = CitmSession<DnWriter, UpWriter>;

fn main() {
    let args = Args::parse();

    Collector::init(vec![
        Box::new(TextSubscriber { min_level: Level::Info }),
        Box::new(alert::BugAlertSubscriber),
    ]);

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg) {
        event!(EventType::Server(ServerEvent::Bug), "error" = e.to_string());
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

fn run(cfg: Config) -> trc::Result<()> {
    tls::install_crypto_provider();
    event!(EventType::Server(ServerEvent::Startup));

    let store: Arc<SqliteStore> = Arc::new(if cfg.database.sqlite_path == ":memory:" {
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(std::path::Path::new(&cfg.database.sqlite_path))?
    });
    let account_store: Arc<dyn AccountStore> = store.clone();
    let device_store: Arc<dyn DeviceKeyStore> = store.clone();

    let mut zone = DnsZone::new(&cfg.dns_zone.apex, cfg.dns_zone.server_v4, cfg.dns_zone.server_v6);
    zone = zone.with_root_records(cfg.dns_zone.root_records.iter().map(|r| r.to_rdata()).collect());
    let zone = Arc::new(zone);

    let peer_recv_ids: Vec<u64> = cfg.kvpsync.peers.iter().map(|_| utils::rand_u32() as u64).collect();
    let kvp = Arc::new(KvpReceiver::new(peer_recv_ids));

    let worker_threads = config::resolve_worker_threads(&cfg.network);
    event!(EventType::Server(ServerEvent::ConfigLoaded), "worker_threads" = worker_threads as u64);

    {
        let zone = zone.clone();
        let account_store = account_store.clone();
        let kvp = kvp.clone();
        let dns_listen = cfg.network.dns_listen;
        let nmembufs = cfg.buffers.nmembufs;
        let buf_size = cfg.buffers.buf_size;
        std::thread::Builder::new()
            .name("dns-responder".into())
            .spawn(move || {
                if let Err(e) = dns_task::run(dns_listen, zone, account_store, kvp, nmembufs, buf_size) {
                    event!(EventType::Server(ServerEvent::Bug), "error" = e.to_string());
                }
            })
            .expect("spawn dns responder thread");
    }

    {
        let kvp = kvp.clone();
        let listen = cfg.kvpsync.listen;
        let peers = cfg.kvpsync.peers.clone();
        std::thread::Builder::new()
            .name("kvpsync".into())
            .spawn(move || {
                if let Err(e) = kvpsync_task::run(listen, peers, kvp) {
                    event!(EventType::Server(ServerEvent::Bug), "error" = e.to_string());
                }
            })
            .expect("spawn kvpsync thread");
    }

    let dn_tls_cfg = tls::build_server_tls_config(&cfg.tls.dn_cert, &cfg.tls.dn_key)?;
    let up_tls_cfg = tls::build_client_tls_config(cfg.tls.upstream_ca.as_deref())?;

    let pool: WorkerPool<Citm> = WorkerPool::new(worker_threads);
    let listener = TcpListener::bind(cfg.network.dn_listen).map_err(trc::Error::from)?;

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                event!(EventType::Network(trc::NetworkEvent::AcceptError), "error" = e.to_string());
                continue;
            }
        };

        let account_store = account_store.clone();
        let device_store = device_store.clone();
        let dn_tls_cfg = dn_tls_cfg.clone();
        let up_tls_cfg = up_tls_cfg.clone();
        let upstream_addr = cfg.network.upstream_addr;
        let upstream_name = cfg.network.upstream_name.clone();
        let device_cap = cfg.devicekey.cap_default;
        let keepalive_base_ms = cfg.devicekey.keepalive_base_ms;
        let pool_handle_src = &pool;
        let handle = spawn_connection(
            stream,
            dn_tls_cfg,
            up_tls_cfg,
            upstream_addr,
            &upstream_name,
            account_store,
            device_store,
            device_cap,
            keepalive_base_ms,
            pool_handle_src,
        );
        if let Err(e) = handle {
            event!(EventType::Network(trc::NetworkEvent::AcceptError), "error" = e.to_string());
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection(
    dn_stream: std::net::TcpStream,
    dn_tls_cfg: Arc<rustls::ServerConfig>,
    up_tls_cfg: Arc<rustls::ClientConfig>,
    upstream_addr: std::net::SocketAddr,
    upstream_name: &str,
    account_store: Arc<dyn AccountStore>,
    device_store: Arc<dyn DeviceKeyStore>,
    device_cap: usize,
    keepalive_base_ms: u64,
    pool: &WorkerPool<Citm>,
) -> trc::Result<()> {
    event!(EventType::Network(trc::NetworkEvent::ConnectionStart));

    let client_ip = dn_stream.peer_addr().map(|a| a.ip()).unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let (dn_reader, dn_writer) = tls::accept_dn(dn_stream, dn_tls_cfg)?;
    let (up_reader, up_writer) = tls::connect_up(upstream_addr, upstream_name, up_tls_cfg)?;

    let session = CitmSession::new(dn_writer, up_writer, account_store, device_store)
        .with_device_cap(device_cap)
        .with_client_ip(client_ip)
        .with_keepalive_base_ms(keepalive_base_ms);
    let handle = pool.register(session);

    spawn_reader(handle.clone(), true, move |buf| dn_reader.read_plaintext(buf));
    spawn_reader(handle.clone(), false, move |buf| up_reader.read_plaintext(buf));
    spawn_ticker(handle);

    Ok(())
}

/// Periodically re-drives a CITM so its XKEYSYNC poll/keep-alive timers fire
/// even while the client sends nothing; exits once the CITM closes.
fn spawn_ticker(handle: Handle<Citm>) {
    std::thread::spawn(move || {
        let tick = std::time::Duration::from_millis(250);
        loop {
            std::thread::sleep(tick);
            if handle.with(|citm| citm.closed) {
                return;
            }
            handle.wake();
        }
    });
}

/// One reactor thread per connection side: it owns the raw read, feeds
/// parsed bytes into the CITM core under the pool's mutex, and posts a
/// wakeup so a worker drains whatever the feed produced.
fn spawn_reader<F>(handle: Handle<Citm>, is_dn: bool, mut read_plaintext: F)
where
    F: FnMut(&mut [u8]) -> trc::Result<usize> + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = vec![0u8; 8192];
        loop {
            match read_plaintext(&mut buf) {
                Ok(0) => {
                    handle.with(|citm| citm.closed = true);
                    handle.wake();
                    event!(EventType::Imap(trc::ImapEvent::SessionClosed));
                    return;
                }
                Ok(n) => {
                    let res = handle.with(|citm| if is_dn { citm.on_dn_bytes(&buf[..n]) } else { citm.on_up_bytes(&buf[..n]) });
                    handle.wake();
                    if res.is_err() {
                        return;
                    }
                }
                Err(_) => {
                    handle.with(|citm| citm.closed = true);
                    handle.wake();
                    return;
                }
            }
        }
    });
}

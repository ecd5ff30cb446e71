//! TLS-terminated transports for the DN (server-side) and UP (client-side)
//! connections, satisfying `imap::Transport`. Generic over `TcpStream` the
//! way `imap`'s session types are generic over `Transport` itself: the
//! handshake and record layer live only here, so `DnSession`/`UpSession`
//! never see anything TLS-specific.
//!
//! Reads happen on a dedicated reactor thread per connection, while the
//! CITM core is only ever driven from inside the worker pool's mutex, so
//! the underlying `StreamOwned` is shared behind a `Mutex` between the
//! writer half handed to the session and the reader half the reactor thread
//! polls; a plain owned `StreamOwned` can't be split between the two without
//! this.

use std::io::Write as _;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;

use imap::Transport;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use trc::{Error, ErrorKind};

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(path: &Path) -> trc::Result<Vec<CertificateDer<'static>>> {
    let f = std::fs::File::open(path).map_err(|e| Error::new(ErrorKind::Open, format!("opening {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(f);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::new(ErrorKind::Value, format!("parsing certs {}: {e}", path.display())))
}

fn load_key(path: &Path) -> trc::Result<PrivateKeyDer<'static>> {
    let f = std::fs::File::open(path).map_err(|e| Error::new(ErrorKind::Open, format!("opening {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(f);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::new(ErrorKind::Value, format!("parsing key {}: {e}", path.display())))?
        .ok_or_else(|| Error::new(ErrorKind::Value, format!("no private key found in {}", path.display())))
}

pub fn build_server_tls_config(cert_path: &Path, key_path: &Path) -> trc::Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let cfg = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::new(ErrorKind::Value, format!("building server tls config: {e}")))?;
    Ok(Arc::new(cfg))
}

pub fn build_client_tls_config(custom_ca: Option<&Path>) -> trc::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    match custom_ca {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::new(ErrorKind::Value, format!("adding CA cert: {e}")))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    let cfg = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(cfg))
}

type Shared<C> = Arc<Mutex<StreamOwned<C, TcpStream>>>;

/// The writer half handed to `CitmSession`; the mutex also happens to
/// serialize encrypted writes against the reader thread's handshake/record
/// processing, which rustls requires anyway.
pub struct TlsWriter<C>(Shared<C>);

impl<C> Clone for TlsWriter<C> {
    fn clone(&self) -> Self {
        TlsWriter(self.0.clone())
    }
}

impl Transport for TlsWriter<ServerConnection> {
    fn write_all(&mut self, buf: &[u8]) -> trc::Result<()> {
        let mut s = self.0.lock();
        s.write_all(buf).map_err(Error::from)?;
        s.flush().map_err(Error::from)
    }

    fn shutdown(&mut self) -> trc::Result<()> {
        let mut s = self.0.lock();
        let _ = s.conn.send_close_notify();
        let _ = s.flush();
        s.sock.shutdown(std::net::Shutdown::Both).map_err(Error::from)
    }
}

impl Transport for TlsWriter<ClientConnection> {
    fn write_all(&mut self, buf: &[u8]) -> trc::Result<()> {
        let mut s = self.0.lock();
        s.write_all(buf).map_err(Error::from)?;
        s.flush().map_err(Error::from)
    }

    fn shutdown(&mut self) -> trc::Result<()> {
        let mut s = self.0.lock();
        let _ = s.conn.send_close_notify();
        let _ = s.flush();
        s.sock.shutdown(std::net::Shutdown::Both).map_err(Error::from)
    }
}

/// The reader half the reactor thread polls; never touched by the worker
/// pool.
pub struct TlsReader<C>(Shared<C>);

impl<C> TlsReader<C> {
    pub fn read_plaintext(&self, buf: &mut [u8]) -> trc::Result<usize> {
        use std::io::Read;
        self.0.lock().read(buf).map_err(Error::from)
    }
}

pub fn accept_dn(stream: TcpStream, cfg: Arc<ServerConfig>) -> trc::Result<(TlsReader<ServerConnection>, TlsWriter<ServerConnection>)> {
    let conn = ServerConnection::new(cfg).map_err(|e| Error::new(ErrorKind::Conn, format!("tls accept: {e}")))?;
    let shared = Arc::new(Mutex::new(StreamOwned::new(conn, stream)));
    Ok((TlsReader(shared.clone()), TlsWriter(shared)))
}

pub fn connect_up(addr: SocketAddr, server_name: &str, cfg: Arc<ClientConfig>) -> trc::Result<(TlsReader<ClientConnection>, TlsWriter<ClientConnection>)> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::new(ErrorKind::Param, format!("invalid upstream server name {server_name}: {e}")))?;
    let conn = ClientConnection::new(cfg, name).map_err(|e| Error::new(ErrorKind::Conn, format!("tls connect setup: {e}")))?;
    let sock = TcpStream::connect(addr).map_err(Error::from)?;
    let shared = Arc::new(Mutex::new(StreamOwned::new(conn, sock)));
    Ok((TlsReader(shared.clone()), TlsWriter(shared)))
}

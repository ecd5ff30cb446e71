/// I/O boundary for a session's underlying connection. Keeping this a trait
/// (rather than a concrete `TcpStream`) is what lets the DN/UP state
/// machines and the CITM core be driven deterministically in tests, decoupled
/// from the actual socket via a generic stream parameter.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> trc::Result<()>;
    fn shutdown(&mut self) -> trc::Result<()>;
}

/// Test/in-process transport: retains every write so assertions can inspect
/// exactly what was sent to the peer.
#[derive(Default)]
pub struct MemTransport {
    pub written: Vec<u8>,
    pub shutdown: bool,
}

impl Transport for MemTransport {
    fn write_all(&mut self, buf: &[u8]) -> trc::Result<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn shutdown(&mut self) -> trc::Result<()> {
        self.shutdown = true;
        Ok(())
    }
}

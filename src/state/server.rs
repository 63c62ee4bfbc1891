//! TCP state server
//!
//! In in-memory state mode each node serves its own state to peers over a
//! small framed protocol: a one-byte request kind, then a length-prefixed
//! key, then a length-prefixed value (empty for reads).
//!
//! Request kinds: 1 = size, 2 = get, 3 = set. Responses: size returns a
//! u64; get returns a length-prefixed value (length 0 when the key is
//! missing); set returns a one-byte ack. All integers little-endian.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::StateStore;

const REQUEST_SIZE: u8 = 1;
const REQUEST_GET: u8 = 2;
const REQUEST_SET: u8 = 3;

/// How long one `poll()` waits for a connection before returning
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Serves this node's state store over TCP
pub struct StateServer {
    listener: TcpListener,
    store: Arc<dyn StateStore>,
}

impl StateServer {
    /// Bind to `addr` and serve `store`
    pub fn bind(addr: &str, store: Arc<dyn StateStore>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("state server listening on {}", addr);
        Ok(Self { listener, store })
    }

    /// Address the server actually bound to
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve at most one pending connection, or sleep one poll interval.
    /// The caller loops on this until shutdown.
    pub fn poll(&self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!("state connection from {}", peer);
                if let Err(e) = self.serve_connection(stream) {
                    warn!("state connection from {} failed: {}", peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("state server accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    /// Handle requests on one connection until the peer hangs up
    fn serve_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        loop {
            let mut kind = [0u8; 1];
            match stream.read_exact(&mut kind) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }

            let key = read_frame(&mut stream)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let value = read_frame(&mut stream)?;

            match kind[0] {
                REQUEST_SIZE => {
                    let len = self
                        .store
                        .get_bytes(&key)
                        .ok()
                        .flatten()
                        .map(|v| v.len())
                        .unwrap_or(0);
                    stream.write_all(&(len as u64).to_le_bytes())?;
                }
                REQUEST_GET => {
                    let bytes = self.store.get_bytes(&key).ok().flatten().unwrap_or_default();
                    stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
                    stream.write_all(&bytes)?;
                }
                REQUEST_SET => {
                    let ack: u8 = match self.store.set_bytes(&key, &value) {
                        Ok(()) => 1,
                        Err(e) => {
                            warn!("state set '{}' failed: {}", key, e);
                            0
                        }
                    };
                    stream.write_all(&[ack])?;
                }
                other => {
                    warn!("unknown state request kind {}", other);
                    return Ok(());
                }
            }
        }
    }

    /// Stop serving. The listener closes when the server drops.
    pub fn close(self) {
        info!("state server closing");
    }
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

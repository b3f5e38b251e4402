use crate::config::ServerConfig;
use crate::credential::Credential;
use crate::error::{ServerError, ServerResult};
use crate::hooks::HookChain;
use crate::lifecycle::Lifecycle;
use crate::pump::Token;
use crate::server::Server;
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(not(unix))]
type RawFd = i32;

/// Stable identifier for one accepted connection. Doubles as the pump token
/// for the connection's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub(crate) u64);

impl ClientId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn as_token(&self) -> Token {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Observer invoked when a connection's stream reports closed
pub type CloseHook = Box<dyn FnMut(&mut Server, ClientId)>;

/// What the stream reported after a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEvent {
    Open,
    Closed,
}

/// One accepted peer: the underlying byte stream, an optional TLS session
/// over it, and the liveness accounting that makes it safe to hand the
/// object to user callbacks that may synchronously close it.
pub(crate) struct Client {
    // Dropped before the socket so close_notify state is torn down first.
    tls: Option<rustls::ServerConnection>,
    socket: TcpStream,
    valid: bool,
    peer_addr: SocketAddr,
    id: ClientId,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) close_chain: HookChain<CloseHook>,
    pub(crate) membership: bool,
    pub(crate) connect_handler_invoked: bool,
    pub(crate) close_dispatched: bool,
    pub(crate) armed: bool,
    read_chunk: Vec<u8>,
    pending_out: BytesMut,
}

impl Client {
    /// Construct from a freshly accepted socket. The TLS session is created
    /// here iff a credential is loaded, and never later.
    pub(crate) fn new(
        socket: socket2::Socket,
        peer_addr: SocketAddr,
        id: ClientId,
        credential: Option<&Credential>,
        config: &ServerConfig,
    ) -> ServerResult<Self> {
        let stream: TcpStream = socket.into();
        stream.set_nonblocking(true)?;
        stream.set_nodelay(config.nodelay)?;

        let tls = match credential {
            Some(credential) => Some(credential.new_session()?),
            None => None,
        };

        let mut client = Self {
            tls,
            socket: stream,
            valid: true,
            peer_addr,
            id,
            lifecycle: Lifecycle::new(),
            close_chain: HookChain::new(),
            membership: false,
            connect_handler_invoked: false,
            close_dispatched: false,
            armed: false,
            read_chunk: vec![0; config.read_buffer_size],
            pending_out: BytesMut::new(),
        };

        // The lifecycle's own close handling must run after every observer
        // the connection accumulates, so the finalizer slot is claimed at
        // construction time.
        client
            .close_chain
            .set_finalizer(Box::new(|server, id| server.finalize_close(id)));

        Ok(client)
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    #[cfg(not(unix))]
    pub(crate) fn raw_fd(&self) -> RawFd {
        -1
    }

    /// Drain the socket until it would block, appending plaintext to `out`.
    /// Read errors surface as an unexpected close.
    pub(crate) fn pull(&mut self, out: &mut Vec<u8>) -> StreamEvent {
        if !self.valid {
            return StreamEvent::Closed;
        }

        // Flush anything parked from an earlier partial write first.
        self.flush();

        if self.tls.is_some() {
            self.pull_tls(out)
        } else {
            self.pull_plain(out)
        }
    }

    fn pull_plain(&mut self, out: &mut Vec<u8>) -> StreamEvent {
        loop {
            match self.socket.read(&mut self.read_chunk) {
                Ok(0) => return StreamEvent::Closed,
                Ok(n) => out.extend_from_slice(&self.read_chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return StreamEvent::Open,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{}: read error, treating as close: {}", self.id, e);
                    return StreamEvent::Closed;
                }
            }
        }
    }

    fn pull_tls(&mut self, out: &mut Vec<u8>) -> StreamEvent {
        let tls = self.tls.as_mut().expect("tls session present");

        loop {
            match tls.read_tls(&mut self.socket) {
                Ok(0) => return StreamEvent::Closed,
                Ok(_) => {
                    let state = match tls.process_new_packets() {
                        Ok(state) => state,
                        Err(e) => {
                            log::debug!("{}: TLS error, closing: {}", self.id, e);
                            // Best effort: let the alert reach the peer.
                            let _ = tls.write_tls(&mut self.socket);
                            return StreamEvent::Closed;
                        }
                    };

                    // Handshake responses and queued records
                    while tls.wants_write() {
                        match tls.write_tls(&mut self.socket) {
                            Ok(_) => {}
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                log::debug!("{}: TLS write error, closing: {}", self.id, e);
                                return StreamEvent::Closed;
                            }
                        }
                    }

                    let plaintext = state.plaintext_bytes_to_read();
                    if plaintext > 0 {
                        let start = out.len();
                        out.resize(start + plaintext, 0);
                        if tls.reader().read_exact(&mut out[start..]).is_err() {
                            out.truncate(start);
                            return StreamEvent::Closed;
                        }
                    }

                    if state.peer_has_closed() {
                        return StreamEvent::Closed;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return StreamEvent::Open,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{}: read error, treating as close: {}", self.id, e);
                    return StreamEvent::Closed;
                }
            }
        }
    }

    /// Queue bytes for the peer; partial writes are parked and flushed
    /// opportunistically on later stream activity.
    pub(crate) fn write(&mut self, data: &[u8]) -> ServerResult<()> {
        if !self.valid {
            return Err(ServerError::Lifecycle(format!(
                "{}: write on a closed connection",
                self.id
            )));
        }

        match self.tls.as_mut() {
            Some(tls) => {
                tls.writer().write_all(data)?;
            }
            None => {
                self.pending_out.extend_from_slice(data);
            }
        }

        self.flush();
        Ok(())
    }

    /// Push parked output toward the socket without blocking
    pub(crate) fn flush(&mut self) {
        if !self.valid {
            return;
        }

        if let Some(tls) = self.tls.as_mut() {
            while tls.wants_write() {
                match tls.write_tls(&mut self.socket) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
            return;
        }

        while !self.pending_out.is_empty() {
            match self.socket.write(&self.pending_out) {
                Ok(0) => break,
                Ok(n) => self.pending_out.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Shut the transport down both ways. The object stays valid until
    /// terminated so close observers can still inspect it.
    pub(crate) fn shutdown_transport(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
            let _ = tls.write_tls(&mut self.socket);
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Mark the socket handle unusable. First step of termination; no
    /// further I/O can be issued afterwards.
    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

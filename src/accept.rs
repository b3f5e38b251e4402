use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::filter::Filter;
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(not(unix))]
type RawFd = i32;

/// Steady-state number of accept operations kept posted against the
/// listening socket. Bounds worst-case accept latency under burst load
/// without unbounded growth.
pub const ACCEPT_POOL_TARGET: usize = 16;

/// Result of fulfilling one posted accept operation
pub(crate) enum AcceptOutcome {
    /// A peer was accepted; one posted operation was consumed.
    Peer(Socket, SocketAddr),
    /// Nothing ready yet; the posted operation remains outstanding.
    WouldBlock,
    /// Not hosting, or no operations are posted.
    Idle,
    /// The operation failed and was discarded; replenishment compensates.
    Failed(io::Error),
}

/// Owns the listening socket and the pool of outstanding accept operations.
///
/// An accept operation is a reserved slot counted by `posted`: `post_accept`
/// reserves one, and a readiness report against the listening socket fulfils
/// one via `try_accept`. The count is atomic because the OS may deliver
/// completions for the same server from multiple worker threads.
pub(crate) struct AcceptEngine {
    listener: Option<Socket>,
    posted: AtomicUsize,
}

impl AcceptEngine {
    pub(crate) fn new() -> Self {
        Self {
            listener: None,
            posted: AtomicUsize::new(0),
        }
    }

    /// Open the listening socket described by the filter. Any previous
    /// listener must already be gone; failure leaves the engine unbound.
    pub(crate) fn bind(&mut self, filter: &Filter, config: &ServerConfig) -> ServerResult<()> {
        debug_assert!(self.listener.is_none(), "bind over a live listener");
        let socket = filter.create_listener(config.backlog)?;
        self.listener = Some(socket);
        Ok(())
    }

    /// Close the listening socket. Outstanding accept operations complete
    /// with an error and are discarded.
    pub(crate) fn unbind(&mut self) {
        if self.listener.take().is_some() {
            let cancelled = self.posted.swap(0, Ordering::AcqRel);
            if cancelled > 0 {
                log::debug!("{} outstanding accept operations cancelled", cancelled);
            }
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        let listener = self.listener.as_ref()?;
        listener.local_addr().ok()?.as_socket()
    }

    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    #[cfg(not(unix))]
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|_| -1)
    }

    pub(crate) fn posted(&self) -> usize {
        self.posted.load(Ordering::Acquire)
    }

    /// Post one accept operation. Returns false without side effects when
    /// not hosting.
    pub(crate) fn post_accept(&self) -> bool {
        if self.listener.is_none() {
            return false;
        }
        self.posted.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Top the pool back up to the target. Called on hosting and after each
    /// successful completion, always before any user code runs.
    pub(crate) fn replenish(&self) {
        while self.posted() < ACCEPT_POOL_TARGET {
            if !self.post_accept() {
                break;
            }
        }
    }

    /// Fulfil one posted accept operation against the listening socket
    pub(crate) fn try_accept(&self) -> AcceptOutcome {
        let Some(listener) = self.listener.as_ref() else {
            return AcceptOutcome::Idle;
        };
        if self.posted() == 0 {
            return AcceptOutcome::Idle;
        }

        match listener.accept() {
            Ok((socket, addr)) => {
                self.posted.fetch_sub(1, Ordering::AcqRel);
                match addr.as_socket() {
                    Some(peer) => AcceptOutcome::Peer(socket, peer),
                    None => AcceptOutcome::Failed(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "accepted peer has no inet address",
                    )),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => AcceptOutcome::WouldBlock,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => AcceptOutcome::WouldBlock,
            Err(e) => {
                self.posted.fetch_sub(1, Ordering::AcqRel);
                AcceptOutcome::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::time::Duration;

    fn local_filter() -> Filter {
        Filter::new().with_local_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn post_accept_fails_when_not_hosting() {
        let engine = AcceptEngine::new();
        assert!(!engine.post_accept());
        assert_eq!(engine.posted(), 0);
    }

    #[test]
    fn pool_never_exceeds_target() {
        let mut engine = AcceptEngine::new();
        engine.bind(&local_filter(), &ServerConfig::new()).unwrap();

        engine.replenish();
        assert_eq!(engine.posted(), ACCEPT_POOL_TARGET);

        // Replenishing a full pool is a no-op.
        engine.replenish();
        assert_eq!(engine.posted(), ACCEPT_POOL_TARGET);
    }

    #[test]
    fn failed_posts_interleaved_with_successes_keep_the_count_bounded() {
        let mut engine = AcceptEngine::new();

        // Failures while unbound do not go negative.
        for _ in 0..4 {
            assert!(!engine.post_accept());
        }
        assert_eq!(engine.posted(), 0);

        engine.bind(&local_filter(), &ServerConfig::new()).unwrap();
        engine.replenish();
        assert_eq!(engine.posted(), ACCEPT_POOL_TARGET);

        // Cancellation resets to zero, further failures stay at zero.
        engine.unbind();
        assert_eq!(engine.posted(), 0);
        assert!(!engine.post_accept());
        assert_eq!(engine.posted(), 0);
    }

    #[test]
    fn with_nothing_pending_try_accept_would_block() {
        let mut engine = AcceptEngine::new();
        engine.bind(&local_filter(), &ServerConfig::new()).unwrap();
        engine.replenish();

        assert!(matches!(engine.try_accept(), AcceptOutcome::WouldBlock));
        assert_eq!(engine.posted(), ACCEPT_POOL_TARGET);
    }

    #[test]
    fn accepting_a_peer_consumes_one_operation() {
        let mut engine = AcceptEngine::new();
        engine.bind(&local_filter(), &ServerConfig::new()).unwrap();
        engine.replenish();

        let addr = engine.local_addr().unwrap();
        let _remote = TcpStream::connect(addr).unwrap();

        let mut accepted = false;
        for _ in 0..200 {
            match engine.try_accept() {
                AcceptOutcome::Peer(_, peer) => {
                    assert_eq!(peer.ip(), addr.ip());
                    accepted = true;
                    break;
                }
                AcceptOutcome::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                _ => panic!("unexpected accept outcome"),
            }
        }
        assert!(accepted);
        assert_eq!(engine.posted(), ACCEPT_POOL_TARGET - 1);

        engine.replenish();
        assert_eq!(engine.posted(), ACCEPT_POOL_TARGET);
    }

    #[test]
    fn unbound_engine_is_idle() {
        let engine = AcceptEngine::new();
        assert!(matches!(engine.try_accept(), AcceptOutcome::Idle));
    }
}

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Liveness of a connection object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// The connection is live and may issue I/O.
    Active,
    /// Close has been observed or requested while a reference was still
    /// held; the object must be destroyed when the last reference drops.
    PendingClose,
    /// The single destruction transition has fired.
    Destroyed,
}

const ACTIVE: u8 = 0;
const PENDING_CLOSE: u8 = 1;
const DESTROYED: u8 = 2;

/// Reference counting and liveness for one connection.
///
/// The reference count tracks in-flight reasons the object must outlive the
/// current synchronous call, typically the accept-completion routine while
/// it is inside the user's connect handler. Atomics keep the accounting
/// correct even when the OS delivers completions for different operations
/// on the same server from multiple worker threads.
#[derive(Debug)]
pub struct Lifecycle {
    refs: AtomicU32,
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            refs: AtomicU32::new(0),
            state: AtomicU8::new(ACTIVE),
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => LifecycleState::Active,
            PENDING_CLOSE => LifecycleState::PendingClose,
            _ => LifecycleState::Destroyed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Claim the object for the duration of a call into user code.
    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a claim. Returns true when the caller must destroy the
    /// object now: close was observed while this reference was held and
    /// this was the last reference.
    #[must_use]
    pub fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "lifecycle release without acquire");
        prev == 1 && self.state.load(Ordering::Acquire) == PENDING_CLOSE
    }

    /// The underlying stream reported closed (or close was requested).
    ///
    /// Returns true when the object must be destroyed immediately. When a
    /// reference is still held the destruction is deferred: the state moves
    /// to PendingClose and the releasing caller picks it up via `release`.
    #[must_use]
    pub fn on_closed(&self) -> bool {
        // Already pending or destroyed: nothing further to decide.
        if self
            .state
            .compare_exchange(ACTIVE, PENDING_CLOSE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.refs.load(Ordering::Acquire) == 0
    }

    /// The single destruction transition. Returns true exactly once; any
    /// later caller sees false and must not touch the object again.
    #[must_use]
    pub fn begin_destroy(&self) -> bool {
        self.state.swap(DESTROYED, Ordering::AcqRel) != DESTROYED
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_with_no_references_destroys_immediately() {
        let lc = Lifecycle::new();
        assert!(lc.on_closed());
        assert_eq!(lc.state(), LifecycleState::PendingClose);
        assert!(lc.begin_destroy());
        assert_eq!(lc.state(), LifecycleState::Destroyed);
    }

    #[test]
    fn close_while_referenced_defers_to_releaser() {
        let lc = Lifecycle::new();
        lc.acquire();

        // Closed under an outstanding claim: deferred.
        assert!(!lc.on_closed());
        assert_eq!(lc.state(), LifecycleState::PendingClose);

        // The releasing caller is told to destroy.
        assert!(lc.release());
        assert!(lc.begin_destroy());
    }

    #[test]
    fn release_without_pending_close_does_not_destroy() {
        let lc = Lifecycle::new();
        lc.acquire();
        assert!(!lc.release());
        assert!(lc.is_active());
    }

    #[test]
    fn destroy_fires_exactly_once() {
        let lc = Lifecycle::new();
        assert!(lc.on_closed());
        assert!(lc.begin_destroy());
        assert!(!lc.begin_destroy());
        assert!(!lc.begin_destroy());
    }

    #[test]
    fn double_close_is_ignored() {
        let lc = Lifecycle::new();
        lc.acquire();
        assert!(!lc.on_closed());
        // A second close report must not re-trigger anything.
        assert!(!lc.on_closed());
        assert!(lc.release());
    }

    #[test]
    fn nested_references_destroy_on_last_release() {
        let lc = Lifecycle::new();
        lc.acquire();
        lc.acquire();
        assert!(!lc.on_closed());
        assert!(!lc.release());
        assert!(lc.release());
    }
}

pub mod accept;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod lifecycle;
pub mod pump;
pub mod server;

/// Re-exports of common components for easier access
pub use accept::ACCEPT_POOL_TARGET;
pub use client::ClientId;
pub use config::ServerConfig;
pub use credential::{Credential, StoreLocation};
pub use error::{ServerError, ServerResult};
pub use filter::{AddressFamily, Filter};
pub use hooks::HookChain;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use pump::{Event, Pump, Token};
pub use server::{ConnectHandler, DataHandler, DisconnectHandler, ErrorHandler, Server};

use parking_lot::Once;

static INIT: Once = Once::new();

/// Process-wide one-time initialization.
///
/// Installs the default TLS crypto provider. Idempotent; embedding
/// applications may call it explicitly at startup, and credential loading
/// calls it lazily otherwise.
pub fn init() {
    INIT.call_once(|| {
        // Another component may already have installed a provider; that is
        // fine, ours is only the fallback.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

use crate::accept::{AcceptEngine, AcceptOutcome};
use crate::client::{Client, ClientId, CloseHook, StreamEvent};
use crate::config::ServerConfig;
use crate::credential::Credential;
use crate::error::{ServerError, ServerResult};
use crate::filter::Filter;
use crate::pump::{Pump, Token};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::Path;
use std::rc::Rc;

const LISTENER_TOKEN: Token = 0;

pub type ConnectHandler = Box<dyn FnMut(&mut Server, ClientId)>;
pub type DisconnectHandler = Box<dyn FnMut(&mut Server, ClientId)>;
pub type DataHandler = Box<dyn FnMut(&mut Server, ClientId, &[u8])>;
pub type ErrorHandler = Box<dyn FnMut(&mut Server, &ServerError)>;

type Slot<H> = Option<Rc<RefCell<H>>>;

/// Callback-driven TCP server.
///
/// Owns the listening socket, the live-connection collection, the registered
/// event handlers and the optional TLS credential. All handlers run
/// synchronously on the thread that calls `tick`; handler code must not
/// block. A handler is free to close the very connection it was handed —
/// the lifecycle accounting defers destruction until the engine is done
/// with the object.
pub struct Server {
    pump: Pump,
    engine: AcceptEngine,
    config: ServerConfig,
    clients: BTreeMap<ClientId, Client>,
    next_id: u64,
    credential: Option<Credential>,
    connect_handler: Slot<ConnectHandler>,
    disconnect_handler: Slot<DisconnectHandler>,
    data_handler: Slot<DataHandler>,
    error_handler: Slot<ErrorHandler>,
    tag: Option<Box<dyn Any>>,
}

impl Server {
    /// Create a server driven by the given pump
    pub fn new(pump: Pump) -> Self {
        Self::with_config(pump, ServerConfig::default())
    }

    pub fn with_config(pump: Pump, config: ServerConfig) -> Self {
        Self {
            pump,
            engine: AcceptEngine::new(),
            config,
            clients: BTreeMap::new(),
            next_id: 1, // token 0 belongs to the listener
            credential: None,
            connect_handler: None,
            disconnect_handler: None,
            data_handler: None,
            error_handler: None,
            tag: None,
        }
    }

    // ---- hosting ---------------------------------------------------------

    /// Host on the given local port (0 for ephemeral) on the wildcard
    /// IPv4 address
    pub fn host(&mut self, port: u16) -> ServerResult<()> {
        self.host_filter(&Filter::new().with_local_port(port))
    }

    /// Host on the bind target described by the filter. Any prior listener
    /// is torn down first. On failure the error is reported through the
    /// error handler and the server is left not-hosting.
    pub fn host_filter(&mut self, filter: &Filter) -> ServerResult<()> {
        self.unhost();

        if let Err(e) = self.engine.bind(filter, &self.config) {
            self.report(&e);
            return Err(e);
        }

        let fd = self
            .engine
            .raw_fd()
            .expect("bound listener has a descriptor");

        if let Err(e) = self.pump.add(fd, LISTENER_TOKEN) {
            self.engine.unbind();
            self.report(&e);
            return Err(e);
        }

        // Prime the accept pool before anything else can run.
        self.engine.replenish();

        if let Some(addr) = self.engine.local_addr() {
            log::info!("hosting on {}", addr);
        }

        Ok(())
    }

    /// Stop listening. Idempotent; existing connections are untouched.
    pub fn unhost(&mut self) {
        if !self.is_hosting() {
            return;
        }

        if let Some(fd) = self.engine.raw_fd() {
            let _ = self.pump.remove(fd);
        }
        self.engine.unbind();
        log::info!("stopped hosting");
    }

    pub fn is_hosting(&self) -> bool {
        self.engine.is_bound()
    }

    /// The locally bound port while hosting
    pub fn port(&self) -> Option<u16> {
        self.engine.local_addr().map(|addr| addr.port())
    }

    // ---- handlers --------------------------------------------------------

    pub fn on_connect<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Server, ClientId) + 'static,
    {
        self.connect_handler = Some(Rc::new(RefCell::new(Box::new(handler))));
    }

    pub fn on_disconnect<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Server, ClientId) + 'static,
    {
        self.disconnect_handler = Some(Rc::new(RefCell::new(Box::new(handler))));
    }

    pub fn on_error<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Server, &ServerError) + 'static,
    {
        self.error_handler = Some(Rc::new(RefCell::new(Box::new(handler))));
    }

    /// Register the data handler. Transitioning from "no handler" arms
    /// continuous reads on every live connection; connections accepted later
    /// pick up the handler state current at their accept time.
    pub fn on_data<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Server, ClientId, &[u8]) + 'static,
    {
        let was_set = self.data_handler.is_some();
        self.data_handler = Some(Rc::new(RefCell::new(Box::new(handler))));

        if !was_set {
            let ids: Vec<ClientId> = self
                .clients
                .iter()
                .filter(|(_, c)| c.membership)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                self.arm_client(id);
            }
        }
    }

    /// Remove the data handler and stop reading on every live connection
    pub fn clear_on_data(&mut self) {
        if self.data_handler.take().is_none() {
            return;
        }

        let ids: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.armed)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.disarm_client(id);
        }
    }

    // ---- TLS credential --------------------------------------------------

    /// Load a TLS credential from a combined PEM file. Rejected while
    /// hosting or while a credential is already loaded.
    pub fn load_credential_from_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        subject: &str,
    ) -> ServerResult<()> {
        if let Err(e) = self.credential_preconditions() {
            self.report(&e);
            return Err(e);
        }

        match Credential::from_pem_file(path, subject) {
            Ok(credential) => {
                self.credential = Some(credential);
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Look a TLS credential up in a directory-backed store. Rejected while
    /// hosting or while a credential is already loaded.
    pub fn load_credential_from_store<P: AsRef<Path>>(
        &mut self,
        store: P,
        subject: &str,
        location: &str,
    ) -> ServerResult<()> {
        if let Err(e) = self.credential_preconditions() {
            self.report(&e);
            return Err(e);
        }

        match Credential::from_store(store, subject, location) {
            Ok(credential) => {
                self.credential = Some(credential);
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    pub fn credential_loaded(&self) -> bool {
        self.credential.is_some()
    }

    fn credential_preconditions(&self) -> ServerResult<()> {
        if self.is_hosting() || self.credential.is_some() {
            return Err(ServerError::Lifecycle(
                "either the server is already hosting, or a credential has already been loaded"
                    .to_string(),
            ));
        }
        Ok(())
    }

    // ---- connections -----------------------------------------------------

    /// Number of live connections (connect handler completed, not yet
    /// disconnected)
    pub fn client_count(&self) -> usize {
        self.clients.values().filter(|c| c.membership).count()
    }

    pub fn peer_addr(&self, id: ClientId) -> Option<SocketAddr> {
        self.clients.get(&id).map(|c| c.peer_addr())
    }

    /// First live connection in insertion order. No snapshot guarantee is
    /// made - do not close or accept connections while iterating.
    pub fn first_client(&self) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, c)| c.membership)
            .map(|(id, _)| *id)
    }

    /// Live connection following `id` in insertion order
    pub fn next_client(&self, id: ClientId) -> Option<ClientId> {
        self.clients
            .range((Excluded(id), Unbounded))
            .find(|(_, c)| c.membership)
            .map(|(id, _)| *id)
    }

    /// Queue bytes for the peer
    pub fn write(&mut self, id: ClientId, data: &[u8]) -> ServerResult<()> {
        match self.clients.get_mut(&id) {
            Some(client) => client.write(data),
            None => Err(ServerError::Lifecycle(format!("unknown client {}", id))),
        }
    }

    /// Close a connection. Safe to call from any handler, including the
    /// connect handler for the connection itself; destruction is deferred
    /// until the engine releases its claim.
    pub fn close(&mut self, id: ClientId) {
        {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            if client.close_dispatched {
                return;
            }
            client.shutdown_transport();
        }
        self.dispatch_closed(id);
    }

    /// Attach a close observer to a connection. Observers run in
    /// registration order, always before the engine's own teardown, so they
    /// see a still-valid connection.
    pub fn add_close_hook<F>(&mut self, id: ClientId, hook: F) -> bool
    where
        F: FnMut(&mut Server, ClientId) + 'static,
    {
        match self.clients.get_mut(&id) {
            Some(client) => {
                client.close_chain.add(Box::new(hook));
                true
            }
            None => false,
        }
    }

    // ---- user tag --------------------------------------------------------

    pub fn set_tag(&mut self, tag: Box<dyn Any>) {
        self.tag = Some(tag);
    }

    pub fn tag(&self) -> Option<&dyn Any> {
        self.tag.as_deref()
    }

    pub fn tag_mut(&mut self) -> Option<&mut (dyn Any + 'static)> {
        self.tag.as_deref_mut()
    }

    // ---- dispatch --------------------------------------------------------

    /// Poll the pump once and dispatch completions. Returns the number of
    /// completions processed. The embedding application's event loop.
    pub fn tick(&mut self, timeout_ms: i32) -> ServerResult<usize> {
        let events = self.pump.poll(timeout_ms)?;
        let count = events.len();

        for event in events {
            if event.token == LISTENER_TOKEN {
                self.on_listener_ready();
            } else {
                self.on_client_ready(ClientId(event.token));
            }
        }

        Ok(count)
    }

    fn on_listener_ready(&mut self) {
        loop {
            match self.engine.try_accept() {
                AcceptOutcome::Idle | AcceptOutcome::WouldBlock => break,
                AcceptOutcome::Failed(e) => {
                    // Transient; pool replenishment is the recovery path.
                    log::debug!("accept operation failed: {}", e);
                    continue;
                }
                AcceptOutcome::Peer(socket, peer) => {
                    // Top the pool up before any user code can run.
                    self.engine.replenish();
                    self.accept_one(socket, peer);
                }
            }
        }
    }

    fn accept_one(&mut self, socket: socket2::Socket, peer: SocketAddr) {
        let id = ClientId(self.next_id);
        self.next_id += 1;

        let client = match Client::new(socket, peer, id, self.credential.as_ref(), &self.config) {
            Ok(client) => client,
            Err(e) => {
                // Candidate resources are released with the socket.
                log::debug!("connection construction failed: {}", e);
                return;
            }
        };

        self.clients.insert(id, client);

        // Claim the object for the duration of the connect handler.
        if let Some(client) = self.clients.get(&id) {
            client.lifecycle.acquire();
        }

        if let Some(handler) = self.connect_handler.clone() {
            (&mut *handler.borrow_mut())(self, id);
        }

        let survived = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            if client.lifecycle.is_active() {
                // Joins the live collection only now, after the connect
                // handler returned without closing it.
                client.membership = true;
                client.connect_handler_invoked = true;
                true
            } else {
                let _ = client.lifecycle.release();
                false
            }
        };

        if !survived {
            // Closed synchronously inside the connect handler: destroyed
            // before control returns, never a collection member, no
            // disconnect handler owed.
            self.terminate(id);
            return;
        }

        let destroy = {
            let client = self
                .clients
                .get_mut(&id)
                .expect("surviving client is present");
            client.lifecycle.release()
        };
        if destroy {
            self.terminate(id);
            return;
        }

        log::debug!("{} connected from {}", id, peer);

        if self.data_handler.is_some() {
            self.arm_client(id);
        }
    }

    fn on_client_ready(&mut self, id: ClientId) {
        let mut out = Vec::new();
        let event = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            if client.close_dispatched {
                return;
            }
            client.pull(&mut out)
        };

        if !out.is_empty() {
            if let Some(handler) = self.data_handler.clone() {
                (&mut *handler.borrow_mut())(self, id, &out);
            }
        }

        if event == StreamEvent::Closed {
            self.dispatch_closed(id);
        }
    }

    /// Run the close chain for a connection: user observers in registration
    /// order, the lifecycle finalizer last.
    fn dispatch_closed(&mut self, id: ClientId) {
        let hooks: Vec<CloseHook> = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            if client.close_dispatched {
                return;
            }
            client.close_dispatched = true;
            client.close_chain.drain().collect()
        };

        for mut hook in hooks {
            hook(self, id);
            if !self.clients.contains_key(&id) {
                return;
            }
        }
    }

    /// The finalizer installed on every connection's close chain
    pub(crate) fn finalize_close(&mut self, id: ClientId) {
        let destroy_now = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            client.lifecycle.on_closed()
        };

        if destroy_now {
            self.terminate(id);
        }
        // Otherwise an outer caller still holds a claim; it destroys the
        // object when it releases.
    }

    /// The single destruction path for a connection. Fires at most once.
    fn terminate(&mut self, id: ClientId) {
        let (fd, was_armed, owed) = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            if !client.lifecycle.begin_destroy() {
                return;
            }
            // The handle goes invalid before anything else happens.
            client.invalidate();
            let fd = client.raw_fd();
            let was_armed = client.armed;
            client.armed = false;
            let owed = client.connect_handler_invoked;
            client.membership = false;
            (fd, was_armed, owed)
        };

        if was_armed {
            let _ = self.pump.remove(fd);
        }

        if owed {
            if let Some(handler) = self.disconnect_handler.clone() {
                (&mut *handler.borrow_mut())(self, id);
            }
        }

        self.clients.remove(&id);
        log::trace!("{} terminated", id);
    }

    fn report(&mut self, err: &ServerError) {
        if let Some(handler) = self.error_handler.clone() {
            (&mut *handler.borrow_mut())(self, err);
        } else {
            log::warn!("unhandled server error: {}", err);
        }
    }

    fn arm_client(&mut self, id: ClientId) {
        let fd = {
            let Some(client) = self.clients.get(&id) else {
                return;
            };
            if client.armed || !client.is_valid() {
                return;
            }
            client.raw_fd()
        };

        match self.pump.add(fd, id.as_token()) {
            Ok(()) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.armed = true;
                }
            }
            Err(e) => log::warn!("{}: failed to arm reads: {}", id, e),
        }
    }

    fn disarm_client(&mut self, id: ClientId) {
        let fd = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            if !client.armed {
                return;
            }
            client.armed = false;
            client.raw_fd()
        };

        if let Err(e) = self.pump.remove(fd) {
            log::warn!("{}: failed to disarm reads: {}", id, e);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Live connections are left to the embedding shutdown sequence.
        self.unhost();
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "macos")))]
mod tests {
    use super::*;

    fn new_server() -> Server {
        Server::new(Pump::new(64).unwrap())
    }

    #[test]
    fn host_and_unhost_lifecycle() {
        let mut server = new_server();
        assert!(!server.is_hosting());
        assert!(server.port().is_none());

        server.host(0).unwrap();
        assert!(server.is_hosting());
        let port = server.port().unwrap();
        assert_ne!(port, 0);

        server.unhost();
        assert!(!server.is_hosting());

        // Idempotent the second time.
        server.unhost();
        assert!(!server.is_hosting());
    }

    #[test]
    fn rehosting_replaces_the_listener() {
        let mut server = new_server();
        server.host(0).unwrap();
        let first = server.port().unwrap();
        server.host(0).unwrap();
        let second = server.port().unwrap();
        assert!(server.is_hosting());
        // Ports may or may not differ, but hosting state must be coherent.
        let _ = (first, second);
    }

    #[test]
    fn credential_load_rejected_while_hosting() {
        let mut server = new_server();
        server.host(0).unwrap();

        let err = server
            .load_credential_from_file("/tmp/never-read.pem", "x")
            .unwrap_err();
        assert!(err.is_lifecycle_violation());
        assert!(!server.credential_loaded());
    }

    #[test]
    fn traversal_is_empty_without_connections() {
        let server = new_server();
        assert_eq!(server.client_count(), 0);
        assert!(server.first_client().is_none());
    }
}

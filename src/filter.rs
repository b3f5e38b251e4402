use crate::error::{ServerError, ServerResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family for a bind target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// A bind-target specification for `host_filter`
///
/// Port 0 requests an ephemeral port; the bound port is reported by
/// `Server::port` once hosting.
#[derive(Debug, Clone)]
pub struct Filter {
    pub family: AddressFamily,
    pub local_address: Option<IpAddr>,
    pub local_port: u16,
    pub reuse_address: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self {
            family: AddressFamily::Ipv4,
            local_address: None,
            local_port: 0,
            reuse_address: true,
        }
    }

    /// Set the local port to bind
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Set an explicit local address; also fixes the family
    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.family = match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        };
        self.local_address = Some(addr);
        self
    }

    /// Set the address family (ignored if a local address was given)
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        if self.local_address.is_none() {
            self.family = family;
        }
        self
    }

    /// Enable or disable SO_REUSEADDR on the listening socket
    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// The socket address this filter resolves to
    pub fn socket_addr(&self) -> SocketAddr {
        let addr = self.local_address.unwrap_or(match self.family {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        SocketAddr::new(addr, self.local_port)
    }

    /// Create a configured, non-blocking listening socket for this filter
    pub fn create_listener(&self, backlog: u32) -> ServerResult<Socket> {
        let addr = self.socket_addr();

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::Listen(format!("socket creation failed: {}", e)))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::Listen(format!("set_nonblocking failed: {}", e)))?;

        if self.reuse_address {
            socket
                .set_reuse_address(true)
                .map_err(|e| ServerError::Listen(format!("set_reuse_address failed: {}", e)))?;
        }

        // Accept both v4 and v6 peers on a v6 listener.
        if addr.is_ipv6() {
            socket
                .set_only_v6(false)
                .map_err(|e| ServerError::Listen(format!("set_only_v6 failed: {}", e)))?;
        }

        let sock_addr = socket2::SockAddr::from(addr);
        socket
            .bind(&sock_addr)
            .map_err(|e| ServerError::Listen(format!("bind to {} failed: {}", addr, e)))?;

        socket
            .listen(backlog as i32)
            .map_err(|e| ServerError::Listen(format!("listen on {} failed: {}", addr, e)))?;

        Ok(socket)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

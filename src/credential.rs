use crate::error::{ServerError, ServerResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Recognized credential-store locations.
///
/// The store is a directory tree with one subdirectory per location, each
/// holding `<subject>.pem` files (certificate chain plus private key). An
/// unrecognized location name is a setup error, not a lookup miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLocation {
    CurrentService,
    CurrentUser,
    CurrentUserGroupPolicy,
    LocalMachine,
    LocalMachineEnterprise,
    LocalMachineGroupPolicy,
    Services,
    Users,
}

impl StoreLocation {
    /// Parse a location name; empty defaults to `CurrentUser`
    pub fn parse(location: &str) -> ServerResult<Self> {
        if location.is_empty() {
            return Ok(StoreLocation::CurrentUser);
        }

        match location.to_ascii_lowercase().as_str() {
            "currentservice" => Ok(StoreLocation::CurrentService),
            "currentuser" => Ok(StoreLocation::CurrentUser),
            "currentusergrouppolicy" => Ok(StoreLocation::CurrentUserGroupPolicy),
            "localmachine" => Ok(StoreLocation::LocalMachine),
            "localmachineenterprise" => Ok(StoreLocation::LocalMachineEnterprise),
            "localmachinegrouppolicy" => Ok(StoreLocation::LocalMachineGroupPolicy),
            "services" => Ok(StoreLocation::Services),
            "users" => Ok(StoreLocation::Users),
            _ => Err(ServerError::Credential(format!(
                "unknown certificate location: {}",
                location
            ))),
        }
    }

    /// Directory name inside the store root
    pub fn store_dir(&self) -> &'static str {
        match self {
            StoreLocation::CurrentService => "current-service",
            StoreLocation::CurrentUser => "current-user",
            StoreLocation::CurrentUserGroupPolicy => "current-user-group-policy",
            StoreLocation::LocalMachine => "local-machine",
            StoreLocation::LocalMachineEnterprise => "local-machine-enterprise",
            StoreLocation::LocalMachineGroupPolicy => "local-machine-group-policy",
            StoreLocation::Services => "services",
            StoreLocation::Users => "users",
        }
    }
}

/// Opaque TLS server credential, ready for handshake use.
///
/// Cheap to clone; every connection accepted while the credential is loaded
/// shares the same underlying key material read-only.
#[derive(Clone)]
pub struct Credential {
    config: Arc<rustls::ServerConfig>,
}

impl Credential {
    /// Load a credential from a combined PEM file (certificate chain
    /// followed by the private key). The subject is an advisory label.
    pub fn from_pem_file<P: AsRef<Path>>(path: P, subject: &str) -> ServerResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ServerError::Credential(format!(
                "file not found: {}",
                path.display()
            )));
        }

        log::debug!(
            "loading credential for {:?} from {}",
            subject,
            path.display()
        );

        let data = fs::read(path)?;
        Self::from_pem_bytes(&data, path)
    }

    /// Look up `<store>/<location>/<subject>.pem` and load it
    pub fn from_store<P: AsRef<Path>>(
        store: P,
        subject: &str,
        location: &str,
    ) -> ServerResult<Self> {
        if subject.is_empty() {
            return Err(ServerError::Credential("empty certificate subject".to_string()));
        }

        let location = StoreLocation::parse(location)?;
        let path = store
            .as_ref()
            .join(location.store_dir())
            .join(format!("{}.pem", subject));

        if !path.exists() {
            return Err(ServerError::Credential(format!(
                "certificate not found in store: {}",
                path.display()
            )));
        }

        let data = fs::read(&path)?;
        Self::from_pem_bytes(&data, &path)
    }

    fn from_pem_bytes(data: &[u8], origin: &Path) -> ServerResult<Self> {
        crate::init();

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &data[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                ServerError::Credential(format!(
                    "unreadable certificate in {}: {}",
                    origin.display(),
                    e
                ))
            })?;

        if certs.is_empty() {
            return Err(ServerError::Credential(format!(
                "no certificates found in {}",
                origin.display()
            )));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &data[..])
            .map_err(|e| {
                ServerError::Credential(format!(
                    "unreadable private key in {}: {}",
                    origin.display(),
                    e
                ))
            })?
            .ok_or_else(|| {
                ServerError::Credential(format!("no private key found in {}", origin.display()))
            })?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Start a server-side TLS session backed by this credential
    pub fn new_session(&self) -> ServerResult<rustls::ServerConnection> {
        let session = rustls::ServerConnection::new(Arc::clone(&self.config))?;
        Ok(session)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").finish_non_exhaustive()
    }
}

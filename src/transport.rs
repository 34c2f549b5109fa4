//! Collaborators that reach the server once it has an address.
//!
//! The orchestrator does not speak SSH or WinRM. It resolves an [`Endpoint`]
//! and asks a [`SessionTransport`] whether the endpoint accepts connections,
//! then hands the same endpoint to the external [`Provisioner`].

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cloud::CloudFuture;
use crate::secret::SecretString;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Protocol and login settings used to reach the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Communicator {
    /// SSH using the build's keypair.
    Ssh {
        /// Login user.
        username: String,
        /// TCP port.
        port: u16,
    },
    /// WinRM using a password.
    WinRm {
        /// Login user.
        username: String,
        /// Login password.
        password: SecretString,
        /// TCP port.
        port: u16,
    },
}

impl Communicator {
    /// Returns the TCP port the communicator connects to.
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Ssh { port, .. } | Self::WinRm { port, .. } => *port,
        }
    }
}

/// Authentication material handed to the transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Credentials {
    /// Private key authentication.
    SshKey {
        /// Login user.
        username: String,
        /// Private key in OpenSSH format.
        private_key: SecretString,
    },
    /// Password authentication.
    Password {
        /// Login user.
        username: String,
        /// Login password.
        password: SecretString,
    },
}

/// Resolved connection tuple for the temporary server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Address of the server.
    pub address: IpAddr,
    /// TCP port of the communicator.
    pub port: u16,
    /// Authentication material.
    pub credentials: Credentials,
    /// Root password of the rescue system when the server booted into rescue.
    pub rescue_password: Option<SecretString>,
}

impl Endpoint {
    /// Returns the socket address of the endpoint.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Error reported by a transport probe.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct TransportError {
    /// Description of why the endpoint is unreachable.
    pub message: String,
}

impl TransportError {
    /// Creates an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Remote session transport consulted while waiting for connectivity.
pub trait SessionTransport {
    /// Returns `Ok` once the endpoint accepts connections.
    fn probe<'a>(&'a self, endpoint: &'a Endpoint) -> CloudFuture<'a, (), TransportError>;
}

/// Transport probe that only checks the communicator port accepts TCP
/// connections.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    /// Creates a probe using the default connect timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the timeout applied to each connection attempt.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTransport for TcpProbe {
    fn probe<'a>(&'a self, endpoint: &'a Endpoint) -> CloudFuture<'a, (), TransportError> {
        Box::pin(async move {
            let addr = endpoint.socket_addr();
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(TransportError::new(format!("connect to {addr}: {err}"))),
                Err(_) => Err(TransportError::new(format!(
                    "connect to {addr} timed out after {}s",
                    self.connect_timeout.as_secs()
                ))),
            }
        })
    }
}

/// Result of the external provisioning phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisionOutcome {
    /// Continue towards shutdown and snapshot.
    Completed,
    /// Stop the build here without capturing an image.
    Halt,
}

/// Error reported by the external provisioning phase.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ProvisionError {
    /// Description of the provisioning failure.
    pub message: String,
}

impl ProvisionError {
    /// Creates an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// External provisioning engine invoked once the server is reachable.
pub trait Provisioner {
    /// Configures the server reachable at `endpoint`.
    fn provision<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> CloudFuture<'a, ProvisionOutcome, ProvisionError>;
}

/// Provisioner that leaves the server untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProvisioner;

impl Provisioner for NoopProvisioner {
    fn provision<'a>(
        &'a self,
        _endpoint: &'a Endpoint,
    ) -> CloudFuture<'a, ProvisionOutcome, ProvisionError> {
        Box::pin(async { Ok(ProvisionOutcome::Completed) })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::net::TcpListener;

    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            credentials: Credentials::SshKey {
                username: String::from("root"),
                private_key: SecretString::new("key"),
            },
            rescue_password: None,
        }
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listening_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();

        let result = TcpProbe::new().probe(&endpoint(port)).await;

        assert!(result.is_ok(), "probe failed: {result:?}");
    }

    #[tokio::test]
    async fn tcp_probe_reports_refused_connections() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let result = TcpProbe::new()
            .with_connect_timeout(Duration::from_millis(200))
            .probe(&endpoint(port))
            .await;

        let err = result.expect_err("closed port should not be reachable");
        assert!(err.message.contains("127.0.0.1"), "message: {err}");
    }

    #[test]
    fn communicator_port_covers_both_protocols() {
        let ssh = Communicator::Ssh {
            username: String::from("root"),
            port: 22,
        };
        let winrm = Communicator::WinRm {
            username: String::from("Administrator"),
            password: SecretString::new("pw"),
            port: 5986,
        };
        assert_eq!(ssh.port(), 22);
        assert_eq!(winrm.port(), 5986);
    }
}

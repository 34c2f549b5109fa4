//! Cloud control-plane abstraction consumed by the build orchestrator.
//!
//! The orchestrator never speaks the provider's wire protocol. It drives a
//! [`CloudApi`] implementation that creates servers, uploads keys, lists
//! images, changes power state and captures snapshots. Long-running provider
//! operations return an [`ActionHandle`] that must be polled to completion.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ids::{ActionId, ImageId, KeypairId, ServerId};
use crate::secret::SecretString;

/// Future returned by cloud and transport operations.
pub type CloudFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Label map attached to servers, keys and snapshots.
pub type Labels = BTreeMap<String, String>;

/// Lifecycle state of the temporary server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// The provider is still building the server.
    Creating,
    /// The server is powered on.
    Running,
    /// The server is between power states (starting, stopping, rebooting).
    Transitioning,
    /// The server is powered off.
    Stopped,
    /// The server no longer exists, or never finished being created.
    Deleted,
}

impl ServerState {
    /// Returns the snake case name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Transitioning => "transitioning",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }
}

/// Representation of the temporary remote machine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ServerRecord {
    /// Provider identifier.
    pub id: ServerId,
    /// Server name as submitted.
    pub name: String,
    /// Public IPv4 address, once assigned.
    pub public_ipv4: Option<Ipv4Addr>,
    /// Public IPv6 address, once assigned.
    pub public_ipv6: Option<Ipv6Addr>,
    /// Addresses on attached private networks.
    pub private_ips: Vec<IpAddr>,
    /// Current lifecycle state.
    pub state: ServerState,
}

impl ServerRecord {
    /// Returns the address a transport should use to reach the server.
    ///
    /// Public IPv4 is preferred, then public IPv6, then the first private
    /// network address.
    #[must_use]
    pub fn preferred_address(&self) -> Option<IpAddr> {
        self.public_ipv4
            .map(IpAddr::V4)
            .or_else(|| self.public_ipv6.map(IpAddr::V6))
            .or_else(|| self.private_ips.first().copied())
    }
}

/// Handle on a provider-side asynchronous operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionHandle {
    /// Provider identifier of the action.
    pub id: ActionId,
    /// Command the action performs (for example `create_server`).
    pub command: String,
}

impl ActionHandle {
    /// Builds a handle from its identifier and command name.
    #[must_use]
    pub fn new(id: impl Into<ActionId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
        }
    }
}

/// Status reported when polling an [`ActionHandle`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActionStatus {
    /// The operation has not finished yet.
    InProgress,
    /// The operation completed successfully.
    Succeeded,
    /// The operation failed with a provider supplied message.
    Failed {
        /// Error message reported by the provider.
        message: String,
    },
}

/// Result of submitting a create-server request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedServer {
    /// Server as reported immediately after submission.
    pub server: ServerRecord,
    /// Action tracking the creation.
    pub action: ActionHandle,
}

/// Request to upload a public key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeypairRequest {
    /// Name of the key at the provider.
    pub name: String,
    /// Public key in OpenSSH format.
    pub public_key: String,
    /// Labels attached to the key.
    pub labels: Labels,
}

/// Key registered with the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeypairRecord {
    /// Provider identifier.
    pub id: KeypairId,
    /// Key name.
    pub name: String,
}

/// Image or snapshot known to the provider.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ImageRecord {
    /// Provider identifier.
    pub id: ImageId,
    /// Image name or description.
    pub description: String,
    /// Creation time, normalised to UTC.
    pub created: DateTime<Utc>,
    /// Labels attached to the image.
    pub labels: Labels,
}

/// Filter used when listing images.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageQuery {
    /// Label selector expression (for example `os=ubuntu,release=22.04`).
    pub label_selector: String,
}

/// Parameters for capturing an image of a stopped server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotSpec {
    /// Description (name) of the resulting image.
    pub description: String,
    /// Labels attached to the resulting image.
    pub labels: Labels,
}

/// Result of requesting a snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedImage {
    /// Image record, typically still being written.
    pub image: ImageRecord,
    /// Action tracking the snapshot.
    pub action: ActionHandle,
}

/// Boot mode requested when rebooting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BootMode {
    /// Regular reboot from the server's disk.
    Normal,
    /// Reboot into the provider's rescue system.
    Rescue {
        /// Rescue system flavour (for example `linux64`).
        rescue_type: String,
        /// Keys authorised inside the rescue system.
        ssh_keys: Vec<KeypairId>,
    },
}

/// Result of a reboot request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reboot {
    /// Action tracking the reboot.
    pub action: ActionHandle,
    /// Root password issued for the rescue system, when applicable.
    pub root_password: Option<SecretString>,
}

/// Public networking options for a new server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicNet {
    /// Whether a public IPv4 address is attached.
    pub enable_ipv4: bool,
    /// Whether a public IPv6 network is attached.
    pub enable_ipv6: bool,
    /// Existing primary IPv4 to reuse instead of allocating one.
    pub ipv4: Option<String>,
    /// Existing primary IPv6 to reuse instead of allocating one.
    pub ipv6: Option<String>,
}

impl Default for PublicNet {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: true,
            ipv4: None,
            ipv6: None,
        }
    }
}

/// Errors raised when a server request is incomplete.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// Raised when a required field is empty.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Parameters required to create the temporary server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSpec {
    /// Server name.
    pub name: String,
    /// Server type (for example `cx11`).
    pub server_type: String,
    /// Location (for example `nbg1`).
    pub location: String,
    /// Image identifier or name to boot from.
    pub image: String,
    /// Labels attached to the server.
    pub labels: Labels,
    /// Cloud-init user data.
    pub user_data: Option<String>,
    /// SSH key identifiers or names authorised for the root user.
    pub ssh_keys: Vec<String>,
    /// Private networks to attach.
    pub networks: Vec<u64>,
    /// Firewalls to apply.
    pub firewalls: Vec<String>,
    /// Volumes to attach.
    pub volumes: Vec<String>,
    /// Public networking options.
    pub public_net: PublicNet,
}

impl ServerSpec {
    /// Starts a builder for a [`ServerSpec`].
    #[must_use]
    pub fn builder() -> ServerSpecBuilder {
        ServerSpecBuilder::default()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] when any required string is empty.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::Validation("name".to_owned()));
        }
        if self.server_type.is_empty() {
            return Err(SpecError::Validation("server_type".to_owned()));
        }
        if self.location.is_empty() {
            return Err(SpecError::Validation("location".to_owned()));
        }
        if self.image.is_empty() {
            return Err(SpecError::Validation("image".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`ServerSpec`] that trims and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerSpecBuilder {
    name: String,
    server_type: String,
    location: String,
    image: String,
    labels: Labels,
    user_data: Option<String>,
    ssh_keys: Vec<String>,
    networks: Vec<u64>,
    firewalls: Vec<String>,
    volumes: Vec<String>,
    public_net: PublicNet,
}

impl ServerSpecBuilder {
    /// Sets the server name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the server type.
    #[must_use]
    pub fn server_type(mut self, value: impl Into<String>) -> Self {
        self.server_type = value.into();
        self
    }

    /// Sets the location.
    #[must_use]
    pub fn location(mut self, value: impl Into<String>) -> Self {
        self.location = value.into();
        self
    }

    /// Sets the image to boot from.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the server labels.
    #[must_use]
    pub fn labels(mut self, value: Labels) -> Self {
        self.labels = value;
        self
    }

    /// Sets the optional user data.
    #[must_use]
    pub fn user_data(mut self, value: Option<String>) -> Self {
        self.user_data = value;
        self
    }

    /// Sets the authorised SSH keys.
    #[must_use]
    pub fn ssh_keys(mut self, value: Vec<String>) -> Self {
        self.ssh_keys = value;
        self
    }

    /// Sets the private networks.
    #[must_use]
    pub fn networks(mut self, value: Vec<u64>) -> Self {
        self.networks = value;
        self
    }

    /// Sets the firewalls.
    #[must_use]
    pub fn firewalls(mut self, value: Vec<String>) -> Self {
        self.firewalls = value;
        self
    }

    /// Sets the volumes.
    #[must_use]
    pub fn volumes(mut self, value: Vec<String>) -> Self {
        self.volumes = value;
        self
    }

    /// Sets the public networking options.
    #[must_use]
    pub fn public_net(mut self, value: PublicNet) -> Self {
        self.public_net = value;
        self
    }

    /// Builds and validates the [`ServerSpec`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<ServerSpec, SpecError> {
        let spec = ServerSpec {
            name: self.name.trim().to_owned(),
            server_type: self.server_type.trim().to_owned(),
            location: self.location.trim().to_owned(),
            image: self.image.trim().to_owned(),
            labels: self.labels,
            user_data: self.user_data,
            ssh_keys: self.ssh_keys,
            networks: self.networks,
            firewalls: self.firewalls,
            volumes: self.volumes,
            public_net: self.public_net,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Interface implemented by cloud control-plane clients.
///
/// Implementations hold no build-scoped state, so one client may serve
/// several concurrent builds.
pub trait CloudApi {
    /// Provider specific error type returned by the client.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Submits a create-server request.
    fn create_server<'a>(
        &'a self,
        spec: &'a ServerSpec,
    ) -> CloudFuture<'a, CreatedServer, Self::Error>;

    /// Fetches the current server record, or `None` when it does not exist.
    fn get_server<'a>(
        &'a self,
        id: &'a ServerId,
    ) -> CloudFuture<'a, Option<ServerRecord>, Self::Error>;

    /// Deletes a server.
    fn delete_server<'a>(&'a self, id: &'a ServerId) -> CloudFuture<'a, (), Self::Error>;

    /// Uploads a public key.
    fn create_keypair<'a>(
        &'a self,
        request: &'a KeypairRequest,
    ) -> CloudFuture<'a, KeypairRecord, Self::Error>;

    /// Deletes an uploaded key.
    fn delete_keypair<'a>(&'a self, id: &'a KeypairId) -> CloudFuture<'a, (), Self::Error>;

    /// Lists images matching a label selector.
    fn list_images<'a>(
        &'a self,
        query: &'a ImageQuery,
    ) -> CloudFuture<'a, Vec<ImageRecord>, Self::Error>;

    /// Requests a graceful (ACPI) shutdown.
    fn shutdown<'a>(&'a self, id: &'a ServerId) -> CloudFuture<'a, ActionHandle, Self::Error>;

    /// Cuts power to the server.
    fn power_off<'a>(&'a self, id: &'a ServerId) -> CloudFuture<'a, ActionHandle, Self::Error>;

    /// Powers the server on.
    fn power_on<'a>(&'a self, id: &'a ServerId) -> CloudFuture<'a, ActionHandle, Self::Error>;

    /// Changes the server type of a stopped server.
    fn change_server_type<'a>(
        &'a self,
        id: &'a ServerId,
        server_type: &'a str,
        upgrade_disk: bool,
    ) -> CloudFuture<'a, ActionHandle, Self::Error>;

    /// Reboots the server in the requested mode.
    fn reboot<'a>(
        &'a self,
        id: &'a ServerId,
        mode: &'a BootMode,
    ) -> CloudFuture<'a, Reboot, Self::Error>;

    /// Captures an image of the server.
    fn create_image<'a>(
        &'a self,
        id: &'a ServerId,
        spec: &'a SnapshotSpec,
    ) -> CloudFuture<'a, CreatedImage, Self::Error>;

    /// Queries the status of an asynchronous action.
    fn action_status<'a>(
        &'a self,
        action: &'a ActionHandle,
    ) -> CloudFuture<'a, ActionStatus, Self::Error>;
}

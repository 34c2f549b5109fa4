//! Typed state shared between build steps.
//!
//! Each cross-step datum has its own optional slot. Readers go through getters
//! that fail with [`MissingStateError`] instead of proceeding with defaults,
//! and every step declares the [`ContextField`]s it reads and writes so the
//! pipeline can check the ordering before anything runs.

use std::fmt;

use thiserror::Error;
use tokio::time::Instant;

use crate::cloud::{ActionHandle, ImageRecord, KeypairRecord, ServerRecord};
use crate::ids::KeypairId;
use crate::secret::SecretString;
use crate::transport::Endpoint;

/// Named slot in the [`BuildContext`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ContextField {
    /// SSH key used to reach the server.
    Keypair,
    /// Image the server boots from.
    SourceImage,
    /// Temporary server record.
    Server,
    /// Action tracking server creation.
    CreateAction,
    /// Deadline for the server to come up after creation.
    ServerDeadline,
    /// Rescue system root password.
    RescuePassword,
    /// Resolved connection endpoint.
    Endpoint,
    /// Captured image.
    Snapshot,
}

impl ContextField {
    /// Returns the snake case name used in messages and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keypair => "keypair",
            Self::SourceImage => "source_image",
            Self::Server => "server",
            Self::CreateAction => "create_action",
            Self::ServerDeadline => "server_deadline",
            Self::RescuePassword => "rescue_password",
            Self::Endpoint => "endpoint",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Raised when a step reads a slot no earlier step has filled.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("build state is missing {field}")]
pub struct MissingStateError {
    /// Slot that was empty.
    pub field: ContextField,
}

/// SSH key available to the build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildKeypair {
    /// Key identifier or name referenced in server requests.
    pub reference: String,
    /// Private key handed to the transport.
    pub private_key: SecretString,
    /// Public key in OpenSSH format, when known.
    pub public_key: Option<String>,
    /// Provider record when this build uploaded the key.
    pub uploaded: Option<KeypairRecord>,
}

impl BuildKeypair {
    /// Returns the provider key id to delete during cleanup, if this build
    /// created the key.
    #[must_use]
    pub fn owned_id(&self) -> Option<&KeypairId> {
        self.uploaded.as_ref().map(|record| &record.id)
    }
}

/// Per-build state written and read by steps.
#[derive(Clone, Debug, Default)]
pub struct BuildContext {
    keypair: Option<BuildKeypair>,
    source_image: Option<String>,
    server: Option<ServerRecord>,
    create_action: Option<ActionHandle>,
    server_deadline: Option<Instant>,
    rescue_password: Option<SecretString>,
    endpoint: Option<Endpoint>,
    snapshot: Option<ImageRecord>,
}

macro_rules! slot {
    ($field:ident, $set:ident, $get:ident, $opt:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("Stores the `", stringify!($field), "` slot, replacing any previous value.")]
        pub fn $set(&mut self, value: $ty) {
            self.$field = Some(value);
        }

        #[doc = concat!("Returns the `", stringify!($field), "` slot.")]
        ///
        /// # Errors
        ///
        /// Returns [`MissingStateError`] when no step has stored the value.
        pub fn $get(&self) -> Result<&$ty, MissingStateError> {
            self.$field.as_ref().ok_or(MissingStateError {
                field: ContextField::$variant,
            })
        }

        #[doc = concat!("Returns the `", stringify!($field), "` slot when present.")]
        #[must_use]
        pub const fn $opt(&self) -> Option<&$ty> {
            self.$field.as_ref()
        }
    };
}

impl BuildContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    slot!(keypair, set_keypair, keypair, keypair_opt, Keypair, BuildKeypair);
    slot!(
        source_image,
        set_source_image,
        source_image,
        source_image_opt,
        SourceImage,
        String
    );
    slot!(server, set_server, server, server_opt, Server, ServerRecord);
    slot!(
        create_action,
        set_create_action,
        create_action,
        create_action_opt,
        CreateAction,
        ActionHandle
    );
    slot!(
        server_deadline,
        set_server_deadline,
        server_deadline,
        server_deadline_opt,
        ServerDeadline,
        Instant
    );
    slot!(
        rescue_password,
        set_rescue_password,
        rescue_password,
        rescue_password_opt,
        RescuePassword,
        SecretString
    );
    slot!(endpoint, set_endpoint, endpoint, endpoint_opt, Endpoint, Endpoint);
    slot!(snapshot, set_snapshot, snapshot, snapshot_opt, Snapshot, ImageRecord);

    /// Returns a mutable reference to the server record.
    ///
    /// # Errors
    ///
    /// Returns [`MissingStateError`] when no server has been stored.
    pub fn server_mut(&mut self) -> Result<&mut ServerRecord, MissingStateError> {
        self.server.as_mut().ok_or(MissingStateError {
            field: ContextField::Server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ServerState;
    use crate::ids::ServerId;

    #[test]
    fn getters_fail_fast_on_empty_slots() {
        let ctx = BuildContext::new();
        assert_eq!(
            ctx.server().expect_err("server slot is empty"),
            MissingStateError {
                field: ContextField::Server
            }
        );
        assert!(ctx.snapshot_opt().is_none());
    }

    #[test]
    fn setters_replace_previous_values() {
        let mut ctx = BuildContext::new();
        ctx.set_source_image(String::from("ubuntu-20.04"));
        ctx.set_source_image(String::from("ubuntu-22.04"));
        assert_eq!(
            ctx.source_image().map(String::as_str),
            Ok("ubuntu-22.04")
        );
    }

    #[test]
    fn server_mut_updates_in_place() {
        let mut ctx = BuildContext::new();
        ctx.set_server(ServerRecord {
            id: ServerId::from("7"),
            name: String::from("kiln"),
            public_ipv4: None,
            public_ipv6: None,
            private_ips: Vec::new(),
            state: ServerState::Creating,
        });
        ctx.server_mut().expect("server present").state = ServerState::Running;
        assert_eq!(
            ctx.server().map(|server| server.state),
            Ok(ServerState::Running)
        );
    }

    #[test]
    fn missing_state_message_names_the_field() {
        let err = MissingStateError {
            field: ContextField::Endpoint,
        };
        assert_eq!(err.to_string(), "build state is missing endpoint");
    }
}

//! Validated build settings consumed by the orchestrator.
//!
//! [`BuildSettings`] is what remains after configuration loading and
//! validation. Everything here is already checked, so steps can use the
//! values directly.

use std::time::Duration;

use crate::cloud::Labels;
use crate::secret::SecretString;
use crate::transport::Communicator;

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default budget for a single provider action.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(600);
/// Default budget for a graceful shutdown before powering off.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);
/// Default budget for the server to accept connections.
pub const DEFAULT_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default SSH login user.
pub const DEFAULT_SSH_USERNAME: &str = "root";

/// Label filter used to pick a source image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageFilter {
    /// Label selector expression.
    pub with_selector: String,
    /// Picks the newest match instead of failing when several images match.
    pub most_recent: bool,
}

/// How the source image is chosen.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageSelection {
    /// Boot from this image name or identifier.
    Direct(String),
    /// Resolve the image by label selector at build time.
    Filter(ImageFilter),
}

/// Key material supplied by the operator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperatorKey {
    /// Private key used by the transport.
    pub private_key: SecretString,
    /// Name or id of the matching key already registered with the provider.
    pub provider_key: String,
}

/// Where the build's SSH key comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeySource {
    /// Generate and upload a key for this build; deleted afterwards.
    Generate,
    /// Use an operator key that is never deleted.
    Operator(OperatorKey),
}

/// Deadline budget used when waiting for the rescue system.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RescueWait {
    /// Each rescue wait gets a fresh action timeout.
    #[default]
    Fresh,
    /// Rescue waits share the deadline of server creation.
    Shared,
}

/// Timing budgets for polling and waiting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Interval between status polls.
    pub poll_interval: Duration,
    /// Budget for each provider action.
    pub action_timeout: Duration,
    /// Budget for a graceful shutdown before falling back to power off.
    pub shutdown_timeout: Duration,
    /// Budget for the server to accept connections.
    pub connectivity_timeout: Duration,
    /// Optional budget for the whole build.
    pub build_timeout: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            connectivity_timeout: DEFAULT_CONNECTIVITY_TIMEOUT,
            build_timeout: None,
        }
    }
}

/// Networking attached to the temporary server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Networking {
    /// Private network ids.
    pub networks: Vec<u64>,
    /// Firewall ids.
    pub firewalls: Vec<String>,
    /// Volume ids.
    pub volumes: Vec<String>,
    /// Attach a public IPv4 address.
    pub public_ipv4: bool,
    /// Attach a public IPv6 network.
    pub public_ipv6: bool,
    /// Existing primary IPv4 to reuse.
    pub primary_ipv4: Option<String>,
    /// Existing primary IPv6 to reuse.
    pub primary_ipv6: Option<String>,
}

impl Default for Networking {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            firewalls: Vec::new(),
            volumes: Vec::new(),
            public_ipv4: true,
            public_ipv6: true,
            primary_ipv4: None,
            primary_ipv6: None,
        }
    }
}

/// Fully validated inputs for one build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSettings {
    /// Name of the temporary server.
    pub server_name: String,
    /// Location of the temporary server.
    pub location: String,
    /// Server type used at creation.
    pub server_type: String,
    /// Larger server type switched to before provisioning, keeping the disk.
    pub upgrade_server_type: Option<String>,
    /// Source image.
    pub image: ImageSelection,
    /// Labels for the temporary server.
    pub server_labels: Labels,
    /// Labels for the resulting snapshot.
    pub snapshot_labels: Labels,
    /// Labels for the generated key.
    pub key_labels: Labels,
    /// Networking options.
    pub networking: Networking,
    /// Rescue system to boot before connecting, if any.
    pub rescue: Option<String>,
    /// User data passed at creation.
    pub user_data: Option<String>,
    /// Description of the resulting snapshot.
    pub snapshot_name: String,
    /// Keep the temporary server after the build.
    pub keep_server: bool,
    /// Do not capture a snapshot.
    pub skip_snapshot: bool,
    /// Timing budgets.
    pub timing: Timing,
    /// Rescue wait budget.
    pub rescue_wait: RescueWait,
    /// Transport protocol and login.
    pub communicator: Communicator,
    /// Source of the SSH key.
    pub key_source: KeySource,
    /// Extra provider key names authorised on the server.
    pub extra_ssh_keys: Vec<String>,
}

impl BuildSettings {
    /// Creates settings with defaults for everything except the required
    /// placement and image.
    #[must_use]
    pub fn new(
        location: impl Into<String>,
        server_type: impl Into<String>,
        image: ImageSelection,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            server_name: format!("kiln-{id}"),
            location: location.into(),
            server_type: server_type.into(),
            upgrade_server_type: None,
            image,
            server_labels: Labels::new(),
            snapshot_labels: Labels::new(),
            key_labels: Labels::new(),
            networking: Networking::default(),
            rescue: None,
            user_data: None,
            snapshot_name: default_snapshot_name(),
            keep_server: false,
            skip_snapshot: false,
            timing: Timing::default(),
            rescue_wait: RescueWait::default(),
            communicator: Communicator::Ssh {
                username: DEFAULT_SSH_USERNAME.to_owned(),
                port: DEFAULT_SSH_PORT,
            },
            key_source: KeySource::Generate,
            extra_ssh_keys: Vec::new(),
        }
    }

    /// Returns `true` when the server must be powered off before the build
    /// ends.
    #[must_use]
    pub const fn needs_power_off(&self) -> bool {
        !(self.skip_snapshot && self.keep_server)
    }
}

/// Returns `kiln-<unix timestamp>`.
#[must_use]
pub fn default_snapshot_name() -> String {
    let seconds = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    format!("kiln-{seconds}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_settings_use_documented_defaults() {
        let settings = BuildSettings::new(
            "nbg1",
            "cx11",
            ImageSelection::Direct(String::from("ubuntu-22.04")),
        );
        assert!(settings.server_name.starts_with("kiln-"));
        assert!(settings.snapshot_name.starts_with("kiln-"));
        assert_eq!(settings.timing.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.key_source, KeySource::Generate);
        assert_eq!(settings.communicator.port(), 22);
        assert!(settings.needs_power_off());
    }

    #[test]
    fn kept_server_without_snapshot_skips_power_off() {
        let mut settings = BuildSettings::new(
            "nbg1",
            "cx11",
            ImageSelection::Direct(String::from("ubuntu-22.04")),
        );
        settings.skip_snapshot = true;
        assert!(settings.needs_power_off());
        settings.keep_server = true;
        assert!(!settings.needs_power_off());
    }
}

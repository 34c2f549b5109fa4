//! Build configuration loaded via `ortho-config`.
//!
//! [`BuildConfig`] merges defaults, `kiln.toml` and `KILN_*` environment
//! variables. [`BuildConfig::validate`] turns the raw values into
//! [`BuildSettings`], reporting problems with the environment variable and
//! TOML key that would fix them.

use std::collections::BTreeMap;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::cloud::Labels;
use crate::secret::SecretString;
use crate::settings::{
    BuildSettings, DEFAULT_SSH_PORT, DEFAULT_SSH_USERNAME, ImageFilter, ImageSelection, KeySource,
    Networking, OperatorKey, RescueWait, Timing, default_snapshot_name,
};
use crate::transport::Communicator;
use crate::user_data::{UserDataError, expand_tilde, read_local_file, resolve_user_data};

/// Default WinRM port.
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Raw build configuration layered from files and the environment.
///
/// Lists are TOML arrays (`networks = [7, 8]`) or comma separated
/// environment values (`KILN_NETWORKS=7,8`). Label maps are TOML tables or
/// environment dicts (`KILN_SERVER_LABELS={role=base,os=ubuntu}`) and are not
/// exposed as CLI flags. Every flag carries an explicit short name so that
/// adding a field never reshuffles the others.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggles that are naturally booleans"
)]
pub struct BuildConfig {
    /// Location of the temporary server, for example `nbg1`.
    #[ortho_config(cli_short = 'l')]
    pub location: Option<String>,
    /// Server type used at creation, for example `cx11`.
    #[ortho_config(cli_short = 't')]
    pub server_type: Option<String>,
    /// Larger server type to switch to before provisioning.
    #[ortho_config(cli_short = 'T')]
    pub upgrade_server_type: Option<String>,
    /// Source image name or id. Conflicts with `image_filter`.
    #[ortho_config(cli_short = 'i')]
    pub image: Option<String>,
    /// Label selector used to find the source image. Quote it in the
    /// environment (`KILN_IMAGE_FILTER='"a=b,c=d"'`) when it holds commas.
    #[ortho_config(cli_short = 'f')]
    pub image_filter: Option<String>,
    /// Picks the newest image when several match the filter.
    #[ortho_config(default = false, cli_short = 'm')]
    pub image_most_recent: bool,
    /// Name of the temporary server; generated when absent.
    #[ortho_config(cli_short = 'n')]
    pub server_name: Option<String>,
    /// Description of the resulting snapshot; timestamped when absent.
    #[ortho_config(cli_short = 's')]
    pub snapshot_name: Option<String>,
    /// Labels applied to the temporary server.
    #[ortho_config(skip_cli)]
    #[serde(default, deserialize_with = "label_map")]
    pub server_labels: Option<Labels>,
    /// Labels applied to the resulting snapshot.
    #[ortho_config(skip_cli)]
    #[serde(default, deserialize_with = "label_map")]
    pub snapshot_labels: Option<Labels>,
    /// Labels applied to the generated key.
    #[ortho_config(skip_cli)]
    #[serde(default, deserialize_with = "label_map")]
    pub key_labels: Option<Labels>,
    /// Private network ids to attach.
    #[ortho_config(cli_short = 'N')]
    #[serde(default, deserialize_with = "string_list")]
    pub networks: Option<Vec<String>>,
    /// Firewall ids to attach.
    #[ortho_config(cli_short = 'F')]
    #[serde(default, deserialize_with = "string_list")]
    pub firewalls: Option<Vec<String>>,
    /// Volume ids to attach.
    #[ortho_config(cli_short = 'v')]
    #[serde(default, deserialize_with = "string_list")]
    pub volumes: Option<Vec<String>>,
    /// Attach a public IPv4 address.
    #[ortho_config(default = true, cli_short = '4')]
    pub public_ipv4: bool,
    /// Attach a public IPv6 network.
    #[ortho_config(default = true, cli_short = '6')]
    pub public_ipv6: bool,
    /// Existing primary IPv4 to reuse.
    #[ortho_config(cli_short = 'p')]
    pub primary_ipv4: Option<String>,
    /// Existing primary IPv6 to reuse.
    #[ortho_config(cli_short = 'P')]
    pub primary_ipv6: Option<String>,
    /// Rescue system booted before connecting, for example `linux64`.
    #[ortho_config(cli_short = 'r')]
    pub rescue: Option<String>,
    /// Wait budget for the rescue boot: `fresh` or `shared`.
    #[ortho_config(default = "fresh".to_owned(), cli_short = 'R')]
    pub rescue_wait: String,
    /// Inline user data.
    #[ortho_config(cli_short = 'u')]
    pub user_data: Option<String>,
    /// Path to a user-data file. Conflicts with `user_data`.
    #[ortho_config(cli_short = 'U')]
    pub user_data_file: Option<String>,
    /// Keep the temporary server after the build.
    #[ortho_config(default = false, cli_short = 'k')]
    pub keep_server: bool,
    /// Skip capturing a snapshot.
    #[ortho_config(default = false, cli_short = 'S')]
    pub skip_snapshot: bool,
    /// Interval between status polls, in milliseconds.
    #[ortho_config(default = 500, cli_short = 'I')]
    pub poll_interval_ms: u64,
    /// Budget for each provider action, in seconds.
    #[ortho_config(default = 600, cli_short = 'a')]
    pub action_timeout_secs: u64,
    /// Budget for a graceful shutdown, in seconds.
    #[ortho_config(default = 120, cli_short = 'd')]
    pub shutdown_timeout_secs: u64,
    /// Budget for the server to accept connections, in seconds.
    #[ortho_config(default = 300, cli_short = 'c')]
    pub connectivity_timeout_secs: u64,
    /// Optional budget for the whole build, in seconds.
    #[ortho_config(cli_short = 'b')]
    pub build_timeout_secs: Option<u64>,
    /// Transport protocol: `ssh` or `winrm`.
    #[ortho_config(default = "ssh".to_owned(), cli_short = 'C')]
    pub communicator: String,
    /// SSH login user.
    #[ortho_config(default = DEFAULT_SSH_USERNAME.to_owned(), cli_short = 'L')]
    pub ssh_username: String,
    /// SSH port.
    #[ortho_config(default = DEFAULT_SSH_PORT, cli_short = 'o')]
    pub ssh_port: u16,
    /// Name of a key already registered with the provider.
    #[ortho_config(cli_short = 'K')]
    pub ssh_keypair_name: Option<String>,
    /// Private key matching `ssh_keypair_name`. Supports `~/`.
    #[ortho_config(cli_short = 'y')]
    pub ssh_private_key_file: Option<String>,
    /// Further provider key names authorised on the server.
    #[ortho_config(cli_short = 'A')]
    #[serde(default, deserialize_with = "string_list")]
    pub ssh_keys: Option<Vec<String>>,
    /// WinRM login user.
    #[ortho_config(cli_short = 'w')]
    pub winrm_username: Option<String>,
    /// WinRM password.
    #[ortho_config(cli_short = 'W')]
    pub winrm_password: Option<String>,
    /// WinRM port.
    #[ortho_config(default = DEFAULT_WINRM_PORT, cli_short = 'O')]
    pub winrm_port: u16,
}

/// Scalar found where text is expected. Environment values are parsed
/// before deserialisation, so `7` arrives as a number and `true` as a bool.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Integer(number) => number.to_string(),
            Self::Boolean(flag) => flag.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Scalar>),
    One(Scalar),
}

fn string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = Option::<OneOrMany>::deserialize(deserializer)?;
    Ok(parsed.map(|value| match value {
        OneOrMany::Many(items) => items.into_iter().map(Scalar::into_text).collect(),
        OneOrMany::One(item) => vec![item.into_text()],
    }))
}

fn label_map<'de, D>(deserializer: D) -> Result<Option<Labels>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = Option::<BTreeMap<String, Scalar>>::deserialize(deserializer)?;
    Ok(parsed.map(|labels| {
        labels
            .into_iter()
            .map(|(key, value)| (key, value.into_text()))
            .collect()
    }))
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Two fields that exclude each other are both set.
    #[error("conflicting configuration: {0}")]
    Conflict(String),
    /// A field holds a value that cannot be used.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// TOML key of the offending field.
        field: &'static str,
        /// What is wrong with the value.
        message: String,
    },
    /// User data could not be resolved.
    #[error(transparent)]
    UserData(#[from] UserDataError),
    /// The private key file could not be read.
    #[error("failed to read private key `{path}`: {message}")]
    KeyFile {
        /// Expanded path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to kiln.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const LOCATION: FieldMetadata = FieldMetadata::new("server location", "KILN_LOCATION", "location");
const SERVER_TYPE: FieldMetadata =
    FieldMetadata::new("server type", "KILN_SERVER_TYPE", "server_type");
const IMAGE: FieldMetadata =
    FieldMetadata::new("source image (or image_filter)", "KILN_IMAGE", "image");
const SSH_USERNAME: FieldMetadata =
    FieldMetadata::new("SSH user", "KILN_SSH_USERNAME", "ssh_username");
const WINRM_USERNAME: FieldMetadata =
    FieldMetadata::new("WinRM user", "KILN_WINRM_USERNAME", "winrm_username");
const WINRM_PASSWORD: FieldMetadata =
    FieldMetadata::new("WinRM password", "KILN_WINRM_PASSWORD", "winrm_password");

impl BuildConfig {
    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates the configuration and produces build settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the field to fix when a value is
    /// missing, conflicting or malformed, or when a referenced file cannot
    /// be read.
    pub fn validate(&self) -> Result<BuildSettings, ConfigError> {
        let location = require(self.location.as_deref(), &LOCATION)?;
        let server_type = require(self.server_type.as_deref(), &SERVER_TYPE)?;
        let image = self.image_selection()?;

        let mut settings = BuildSettings::new(location, server_type, image);
        if let Some(name) = non_blank(self.server_name.as_deref()) {
            settings.server_name = name.to_owned();
        }
        settings.snapshot_name = non_blank(self.snapshot_name.as_deref())
            .map_or_else(default_snapshot_name, str::to_owned);
        settings.upgrade_server_type =
            non_blank(self.upgrade_server_type.as_deref()).map(str::to_owned);
        settings.rescue = non_blank(self.rescue.as_deref()).map(str::to_owned);
        settings.rescue_wait = parse_rescue_wait(&self.rescue_wait)?;
        settings.server_labels = checked_labels("server_labels", self.server_labels.as_ref())?;
        settings.snapshot_labels =
            checked_labels("snapshot_labels", self.snapshot_labels.as_ref())?;
        settings.key_labels = checked_labels("key_labels", self.key_labels.as_ref())?;
        settings.networking = self.networking()?;
        settings.user_data =
            resolve_user_data(self.user_data.as_deref(), self.user_data_file.as_deref())?;
        settings.keep_server = self.keep_server;
        settings.skip_snapshot = self.skip_snapshot;
        settings.timing = self.timing()?;
        settings.communicator = self.communicator()?;
        settings.key_source = self.key_source()?;
        settings.extra_ssh_keys = list_items(self.ssh_keys.as_deref())
            .map(str::to_owned)
            .collect();
        Ok(settings)
    }

    fn image_selection(&self) -> Result<ImageSelection, ConfigError> {
        let image = non_blank(self.image.as_deref());
        let filter = non_blank(self.image_filter.as_deref());
        match (image, filter) {
            (Some(_), Some(_)) => Err(ConfigError::Conflict(String::from(
                "set either image (KILN_IMAGE) or image_filter (KILN_IMAGE_FILTER), not both",
            ))),
            (Some(name), None) => Ok(ImageSelection::Direct(name.to_owned())),
            (None, Some(selector)) => Ok(ImageSelection::Filter(ImageFilter {
                with_selector: selector.to_owned(),
                most_recent: self.image_most_recent,
            })),
            (None, None) if self.image_filter.is_some() => Err(ConfigError::InvalidValue {
                field: "image_filter",
                message: String::from("selector must not be empty"),
            }),
            (None, None) => Err(IMAGE.missing()),
        }
    }

    fn networking(&self) -> Result<Networking, ConfigError> {
        let networks = list_items(self.networks.as_deref())
            .map(|raw| {
                raw.parse::<u64>().map_err(|err| ConfigError::InvalidValue {
                    field: "networks",
                    message: format!("`{raw}` is not a network id: {err}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Networking {
            networks,
            firewalls: list_items(self.firewalls.as_deref())
                .map(str::to_owned)
                .collect(),
            volumes: list_items(self.volumes.as_deref())
                .map(str::to_owned)
                .collect(),
            public_ipv4: self.public_ipv4,
            public_ipv6: self.public_ipv6,
            primary_ipv4: non_blank(self.primary_ipv4.as_deref()).map(str::to_owned),
            primary_ipv6: non_blank(self.primary_ipv6.as_deref()).map(str::to_owned),
        })
    }

    fn timing(&self) -> Result<Timing, ConfigError> {
        Ok(Timing {
            poll_interval: Duration::from_millis(positive(
                "poll_interval_ms",
                self.poll_interval_ms,
            )?),
            action_timeout: Duration::from_secs(positive(
                "action_timeout_secs",
                self.action_timeout_secs,
            )?),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            connectivity_timeout: Duration::from_secs(positive(
                "connectivity_timeout_secs",
                self.connectivity_timeout_secs,
            )?),
            build_timeout: self
                .build_timeout_secs
                .map(|secs| positive("build_timeout_secs", secs).map(Duration::from_secs))
                .transpose()?,
        })
    }

    fn communicator(&self) -> Result<Communicator, ConfigError> {
        match self.communicator.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Communicator::Ssh {
                username: require(Some(self.ssh_username.as_str()), &SSH_USERNAME)?,
                port: self.ssh_port,
            }),
            "winrm" => Ok(Communicator::WinRm {
                username: require(self.winrm_username.as_deref(), &WINRM_USERNAME)?,
                password: SecretString::new(require(
                    self.winrm_password.as_deref(),
                    &WINRM_PASSWORD,
                )?),
                port: self.winrm_port,
            }),
            other => Err(ConfigError::InvalidValue {
                field: "communicator",
                message: format!("`{other}` is not one of ssh, winrm"),
            }),
        }
    }

    fn key_source(&self) -> Result<KeySource, ConfigError> {
        let name = non_blank(self.ssh_keypair_name.as_deref());
        let file = non_blank(self.ssh_private_key_file.as_deref());
        match (name, file) {
            (None, None) => Ok(KeySource::Generate),
            (Some(provider_key), Some(path)) => {
                let expanded = expand_tilde(path);
                let private_key =
                    read_local_file(&expanded).map_err(|message| ConfigError::KeyFile {
                        path: expanded.clone(),
                        message,
                    })?;
                Ok(KeySource::Operator(OperatorKey {
                    private_key: SecretString::new(private_key),
                    provider_key: provider_key.to_owned(),
                }))
            }
            (Some(_), None) => Err(ConfigError::Conflict(String::from(
                "ssh_keypair_name requires ssh_private_key_file (KILN_SSH_PRIVATE_KEY_FILE)",
            ))),
            (None, Some(_)) => Err(ConfigError::Conflict(String::from(
                "ssh_private_key_file requires ssh_keypair_name (KILN_SSH_KEYPAIR_NAME)",
            ))),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|trimmed| !trimmed.is_empty())
}

fn require(value: Option<&str>, metadata: &FieldMetadata) -> Result<String, ConfigError> {
    non_blank(value)
        .map(str::to_owned)
        .ok_or_else(|| metadata.missing())
}

fn positive(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            message: String::from("must be greater than zero"),
        });
    }
    Ok(value)
}

fn list_items(raw: Option<&[String]>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
}

/// Trims label keys and values, rejecting empty keys.
fn checked_labels(field: &'static str, raw: Option<&Labels>) -> Result<Labels, ConfigError> {
    raw.into_iter()
        .flatten()
        .map(|(key, value)| {
            let trimmed_key = key.trim();
            if trimmed_key.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: format!("label `{key}={value}` has an empty key"),
                });
            }
            Ok((trimmed_key.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

fn parse_rescue_wait(raw: &str) -> Result<RescueWait, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "fresh" => Ok(RescueWait::Fresh),
        "shared" => Ok(RescueWait::Shared),
        other => Err(ConfigError::InvalidValue {
            field: "rescue_wait",
            message: format!("`{other}` is not one of fresh, shared"),
        }),
    }
}

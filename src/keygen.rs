//! Ephemeral SSH key generation.
//!
//! Keys are produced by the host `ssh-keygen` binary inside a private
//! temporary directory, read back through `cap-std`, and the directory is
//! removed before returning. The process runs on tokio's blocking pool so a
//! slow `ssh-keygen` never stalls the runtime.

use std::ffi::OsString;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::TempDir;
use thiserror::Error;
use tokio::task::spawn_blocking;

use crate::cloud::CloudFuture;
use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};
use crate::secret::SecretString;

const KEY_FILE: &str = "id_ed25519";
const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

/// Freshly generated key material.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyMaterial {
    /// Private key in OpenSSH format.
    pub private_key: SecretString,
    /// Public key in `authorized_keys` format.
    pub public_key: String,
}

/// Errors raised while generating a keypair.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeygenError {
    /// Raised when the scratch directory cannot be created or opened.
    #[error("failed to prepare key directory: {0}")]
    Workspace(String),
    /// Raised when `ssh-keygen` cannot be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// Raised when `ssh-keygen` exits unsuccessfully.
    #[error("ssh-keygen exited with status {status}: {stderr}")]
    Failed {
        /// Exit status, or `unknown` when terminated by a signal.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when the blocking generation task panics or is cancelled.
    #[error("key generation task failed: {0}")]
    Task(String),
    /// Raised when a generated key file cannot be read.
    #[error("failed to read generated key `{file}`: {message}")]
    Read {
        /// Key file name.
        file: String,
        /// Underlying error message.
        message: String,
    },
}

/// Produces keypairs for builds that bring no key of their own.
pub trait KeyGenerator {
    /// Generates a keypair tagged with `comment`.
    ///
    /// # Errors
    ///
    /// Returns [`KeygenError`] when generation fails.
    fn generate<'a>(&'a self, comment: &'a str) -> CloudFuture<'a, KeyMaterial, KeygenError>;
}

/// Key generator backed by `ssh-keygen`.
#[derive(Clone, Debug, Default)]
pub struct SshKeygen<R: CommandRunner = ProcessCommandRunner> {
    runner: R,
}

impl<R: CommandRunner> SshKeygen<R> {
    /// Creates a generator using the provided command runner.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    fn generate_in(&self, dir_path: &Utf8Path, comment: &str) -> Result<KeyMaterial, KeygenError> {
        let key_path = dir_path.join(KEY_FILE);
        let args: Vec<OsString> = [
            "-q",
            "-t",
            "ed25519",
            "-N",
            "",
            "-C",
            comment,
            "-f",
            key_path.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        let output = self.runner.run("ssh-keygen", &args)?;
        if !output.is_success() {
            return Err(KeygenError::Failed {
                status: output
                    .code
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
            .map_err(|err| KeygenError::Workspace(err.to_string()))?;
        let private_key = read_key(&dir, KEY_FILE)?;
        let public_key = read_key(&dir, PUBLIC_KEY_FILE)?;

        Ok(KeyMaterial {
            private_key: SecretString::from(private_key),
            public_key: public_key.trim().to_owned(),
        })
    }
}

impl<R: CommandRunner> SshKeygen<R> {
    fn generate_blocking(&self, comment: &str) -> Result<KeyMaterial, KeygenError> {
        let scratch = TempDir::new().map_err(|err| KeygenError::Workspace(err.to_string()))?;
        let dir_path = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
            KeygenError::Workspace(format!(
                "temporary directory is not valid UTF-8: {}",
                scratch.path().display()
            ))
        })?;
        self.generate_in(dir_path, comment)
    }
}

impl<R> KeyGenerator for SshKeygen<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    fn generate<'a>(&'a self, comment: &'a str) -> CloudFuture<'a, KeyMaterial, KeygenError> {
        let keygen = self.clone();
        let owned_comment = comment.to_owned();
        Box::pin(async move {
            spawn_blocking(move || keygen.generate_blocking(&owned_comment))
                .await
                .map_err(|err| KeygenError::Task(err.to_string()))?
        })
    }
}

fn read_key(dir: &Dir, file: &str) -> Result<String, KeygenError> {
    dir.read_to_string(file).map_err(|err| KeygenError::Read {
        file: file.to_owned(),
        message: err.to_string(),
    })
}

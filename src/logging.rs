//! Structured logging with secret scrubbing.
//!
//! Secrets discovered during a build (generated private keys, rescue
//! passwords, operator passwords) are registered with a [`Redactions`] handle.
//! The handle is shared with [`RedactingMakeWriter`], which rewrites every
//! formatted log line before it reaches the underlying writer.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::{Arc, PoisonError, RwLock};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::secret::REDACTED;

/// Shared list of secret values to scrub from log output.
#[derive(Clone, Debug, Default)]
pub struct Redactions {
    secrets: Arc<RwLock<BTreeSet<String>>>,
}

impl Redactions {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a secret. Blank values are ignored.
    pub fn add(&self, secret: impl Into<String>) {
        let value = secret.into();
        if value.trim().is_empty() {
            return;
        }
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value);
    }

    /// Returns the number of registered secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when no secret has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces every registered secret in `text` with `[REDACTED]`.
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        let secrets = self.secrets.read().unwrap_or_else(PoisonError::into_inner);
        let mut ordered: Vec<&String> = secrets.iter().collect();
        // Longest first so a secret containing another is replaced whole.
        ordered.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
        ordered
            .into_iter()
            .fold(text.to_owned(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }
}

/// Writer that buffers one formatted event and scrubs it on flush or drop.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
    redactions: Redactions,
}

impl<W: Write> RedactingWriter<W> {
    fn emit(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buffer);
        let scrubbed = self.redactions.scrub(&text);
        self.buffer.clear();
        self.inner.write_all(scrubbed.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        // Nowhere to report a failure to write a log line.
        self.emit().ok();
    }
}

/// [`MakeWriter`] wrapper that scrubs secrets from every event.
#[derive(Clone, Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactions: Redactions,
}

impl<M> RedactingMakeWriter<M> {
    /// Wraps `inner`, scrubbing values registered in `redactions`.
    #[must_use]
    pub const fn new(redactions: Redactions, inner: M) -> Self {
        Self { inner, redactions }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            buffer: Vec::new(),
            redactions: self.redactions.clone(),
        }
    }
}

/// Installs a global `tracing` subscriber writing scrubbed lines to stderr.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to
/// `default_filter`.
///
/// # Errors
///
/// Returns an error when a global subscriber is already installed.
pub fn init(
    default_filter: &str,
    redactions: &Redactions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(RedactingMakeWriter::new(redactions.clone(), io::stderr))
        .try_init()
}

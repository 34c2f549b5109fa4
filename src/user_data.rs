//! User-data resolution for the temporary server.
//!
//! User data reaches the server either inline (for example `#cloud-config`)
//! or from a local file. The two sources are mutually exclusive; file paths
//! may start with `~/`.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while resolving user data.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum UserDataError {
    /// Raised when both inline and file sources are provided.
    #[error("user data cannot be provided both inline and via file")]
    BothProvided,
    /// Raised when an inline payload is empty or only whitespace.
    #[error("user data must not be empty")]
    InlineEmpty,
    /// Raised when a file path is empty or only whitespace.
    #[error("user data file path must not be empty")]
    FilePathEmpty,
    /// Raised when a file resolves to empty or only whitespace.
    #[error("user data file must not be empty")]
    FileEmpty,
    /// Raised when reading the file source fails.
    #[error("failed to read user data file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Resolves user data from either an inline value or a file.
///
/// The returned payload preserves the original content; trimming is only used
/// for the emptiness checks.
///
/// # Errors
///
/// Returns [`UserDataError`] when the inputs are invalid or the file cannot be
/// read.
pub fn resolve_user_data(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, UserDataError> {
    match (inline, file) {
        (Some(_), Some(_)) => Err(UserDataError::BothProvided),
        (Some(payload), None) => {
            if payload.trim().is_empty() {
                return Err(UserDataError::InlineEmpty);
            }
            Ok(Some(payload.to_owned()))
        }
        (None, Some(path)) => {
            if path.trim().is_empty() {
                return Err(UserDataError::FilePathEmpty);
            }
            let expanded = expand_tilde(path);
            let content = read_local_file(&expanded).map_err(|message| UserDataError::FileRead {
                path: expanded.clone(),
                message,
            })?;
            if content.trim().is_empty() {
                return Err(UserDataError::FileEmpty);
            }
            Ok(Some(content))
        }
        (None, None) => Ok(None),
    }
}

/// Expands a leading `~/` using `$HOME`.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Reads a UTF-8 file relative to the working directory or from an absolute
/// path.
pub(crate) fn read_local_file(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

//! Resolution of text inputs that may be given inline or as a file path.
//!
//! The pre-install script and the instance mapping can both arrive either as
//! a literal value (typically a workflow input) or as a path to a file. This
//! module centralises the branching and file loading so both inputs behave
//! the same way.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while resolving an inline-or-file input.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum InputSourceError {
    /// Raised when both inline and file sources are provided.
    #[error("{input} cannot be provided both inline and via file")]
    BothProvided {
        /// Name of the input being resolved.
        input: &'static str,
    },
    /// Raised when a file path is empty or only whitespace.
    #[error("{input} file path must not be empty")]
    FilePathEmpty {
        /// Name of the input being resolved.
        input: &'static str,
    },
    /// Raised when reading the file source fails.
    #[error("failed to read {input} file `{path}`: {message}")]
    FileRead {
        /// Name of the input being resolved.
        input: &'static str,
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Resolves the pre-install script from an inline value or a file.
///
/// Blank inline values count as "no script". The returned content is not
/// trimmed.
///
/// # Errors
///
/// Returns [`InputSourceError`] when both sources are set or the file cannot
/// be read.
pub fn resolve_pre_install_script(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, InputSourceError> {
    resolve_text_input("pre-install script", inline, file)
}

pub(crate) fn resolve_text_input(
    input: &'static str,
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, InputSourceError> {
    let inline_value = inline.filter(|value| !value.trim().is_empty());
    if inline_value.is_some() && file.is_some() {
        return Err(InputSourceError::BothProvided { input });
    }

    if let Some(value) = inline_value {
        return Ok(Some(value.to_owned()));
    }

    let Some(path) = file else {
        return Ok(None);
    };

    if path.trim().is_empty() {
        return Err(InputSourceError::FilePathEmpty { input });
    }

    let expanded = expand_tilde(path.trim());
    let content =
        read_to_string_ambient(&expanded).map_err(|message| InputSourceError::FileRead {
            input,
            path: expanded.clone(),
            message,
        })?;
    Ok(Some(content))
}

/// Expands a leading `~/` using `HOME`.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
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

//! Step outputs published by `start`.
//!
//! GitHub Actions collects step outputs from the file named by
//! `GITHUB_OUTPUT`, one `name=value` line each. Outside a workflow the same
//! lines go to standard output so the mapping can still be captured.

use std::io::{self, Write};

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs::OpenOptions;
use cap_std::fs_utf8::Dir;
use thiserror::Error;

use crate::mapping::{InstanceLabelMapping, MappingError};

/// Environment variable naming the step output file.
pub const GITHUB_OUTPUT_ENV: &str = "GITHUB_OUTPUT";

/// Errors raised while publishing outputs.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum OutputError {
    /// The mapping could not be serialised.
    #[error(transparent)]
    Mapping(#[from] MappingError),
    /// The output destination could not be written.
    #[error("failed to write outputs to {destination}: {message}")]
    Write {
        /// File path, or `stdout`.
        destination: String,
        /// Underlying error message.
        message: String,
    },
}

/// Values `start` publishes for later steps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionOutputs {
    /// Instance to label mapping, as a JSON object.
    pub mapping: String,
    /// Instance identities, as a JSON array.
    pub instances: String,
}

impl ActionOutputs {
    /// Serialises both outputs from a mapping.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Mapping`] when serialisation fails.
    pub fn from_mapping(mapping: &InstanceLabelMapping) -> Result<Self, OutputError> {
        let ids: Vec<&str> = mapping.iter().map(|(id, _)| id.as_str()).collect();
        let instances =
            serde_json::to_string(&ids).map_err(|err| MappingError::Serialise(err.to_string()))?;
        Ok(Self {
            mapping: mapping.to_json()?,
            instances,
        })
    }

    /// Renders the `name=value` lines.
    #[must_use]
    pub fn render(&self) -> String {
        format!("mapping={}\ninstances={}\n", self.mapping, self.instances)
    }
}

/// Where outputs are written.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputTarget {
    /// Append to a step output file.
    File(String),
    /// Print to standard output.
    Stdout,
}

impl OutputTarget {
    /// Uses `GITHUB_OUTPUT` when it names a file, standard output otherwise.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(GITHUB_OUTPUT_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map_or(Self::Stdout, Self::File)
    }

    /// Writes `outputs`, appending when the target is a file.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Write`] when the destination cannot be written.
    pub fn publish(&self, outputs: &ActionOutputs) -> Result<(), OutputError> {
        let rendered = outputs.render();
        match self {
            Self::File(path) => append_to_file(path, &rendered).map_err(|err| OutputError::Write {
                destination: path.clone(),
                message: err.to_string(),
            }),
            Self::Stdout => io::stdout()
                .lock()
                .write_all(rendered.as_bytes())
                .map_err(|err| OutputError::Write {
                    destination: String::from("stdout"),
                    message: err.to_string(),
                }),
        }
    }
}

fn append_to_file(path: &str, content: &str) -> io::Result<()> {
    let file_path = Utf8Path::new(path);
    let parent = file_path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = file_path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    let mut file = dir.open_with(name, OpenOptions::new().append(true).create(true))?;
    file.write_all(content.as_bytes())
}

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading, resolving, or reconciling a
/// container configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// A config document failed to parse in its detected format.
    #[error("unable to parse {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// A config document is missing the top-level version marker.
    #[error("{path:?}: missing \"samba-container-config\" version key")]
    MissingVersion { path: PathBuf },

    /// A config document declares a version this build does not support.
    #[error("{path:?}: unsupported config version {version:?}")]
    UnsupportedVersion { path: PathBuf, version: String },

    /// None of the supplied config file paths could be read.
    #[error("none of the config file paths exist: {paths:?}")]
    NoConfigFiles { paths: Vec<PathBuf> },

    /// The merged document does not fit the typed configuration model.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// No instance with the requested name exists in the document.
    #[error("no instance named {name:?} in configuration")]
    UnknownInstance { name: String },

    /// The caller omitted the instance name but the document defines
    /// more than one instance.
    #[error("config defines {count} instances; an instance name must be given")]
    AmbiguousInstance { count: usize },

    /// A cross-field invariant does not hold for the selected instance.
    #[error("instance {instance:?}: {reason}")]
    Constraint { instance: String, reason: String },

    /// An include or exclude interface pattern is not a valid regex.
    #[error("invalid interface pattern {pattern:?}: {reason}")]
    InterfacePattern { pattern: String, reason: String },

    /// A permission policy carries a mode that is not octal permission bits.
    #[error("invalid permissions mode {value:?} for {path:?}")]
    InvalidMode { path: PathBuf, value: String },

    /// The xattr or chmod backend failed for a share root.
    #[error("permissions backend failure on {path:?}: {reason}")]
    PermissionBackend { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

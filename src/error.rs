//! Error types for Strata
//!
//! All modules use `StrataResult<T>` as their return type.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// Error codes reported by the registry HTTP API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryErrorCode {
    /// Repository does not exist
    NameUnknown,
    /// Manifest referenced by tag or digest does not exist
    ManifestUnknown,
    /// Blob referenced by a manifest does not exist
    BlobUnknown,
    /// Authentication required or rejected
    Unauthorized,
    /// Access to the resource is denied
    Denied,
    /// The operation is not supported by the registry
    Unsupported,
    /// Any other code (or a bare HTTP status)
    Other(String),
}

impl RegistryErrorCode {
    /// Parse a code from the `errors[].code` field of a registry response
    pub fn from_code(code: &str) -> Self {
        match code {
            "NAME_UNKNOWN" => Self::NameUnknown,
            "MANIFEST_UNKNOWN" => Self::ManifestUnknown,
            "BLOB_UNKNOWN" => Self::BlobUnknown,
            "UNAUTHORIZED" => Self::Unauthorized,
            "DENIED" => Self::Denied,
            "UNSUPPORTED" => Self::Unsupported,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RegistryErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameUnknown => write!(f, "NAME_UNKNOWN"),
            Self::ManifestUnknown => write!(f, "MANIFEST_UNKNOWN"),
            Self::BlobUnknown => write!(f, "BLOB_UNKNOWN"),
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::Denied => write!(f, "DENIED"),
            Self::Unsupported => write!(f, "UNSUPPORTED"),
            Self::Other(code) => write!(f, "{}", code),
        }
    }
}

/// A failure recorded for one logical image during a best-effort sweep
#[derive(Debug)]
pub struct ImageFailure {
    /// Logical image name (empty for the nameless image)
    pub image: String,
    /// What went wrong
    pub error: StrataError,
}

impl fmt::Display for ImageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.image.is_empty() {
            "~"
        } else {
            self.image.as_str()
        };
        write!(f, "{}: {}", name, self.error)
    }
}

fn join_failures(failures: &[ImageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// All errors that can occur in Strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid git mapping {add} -> {to}: {reason}")]
    InvalidGitMapping {
        add: String,
        to: String,
        reason: String,
    },

    #[error("Invalid reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    // Registry errors
    #[error("Registry error for {reference}: {code}: {message}")]
    Registry {
        reference: String,
        code: RegistryErrorCode,
        status: u16,
        message: String,
    },

    #[error("Transport error for {reference}: {message}")]
    Transport { reference: String, message: String },

    #[error("Malformed registry response for {reference}: {reason}")]
    MalformedResponse { reference: String, reason: String },

    #[error("Getting credentials for {registry} failed: {reason}")]
    Credentials { registry: String, reason: String },

    // Git errors
    #[error("Git command failed: {command}: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("Commit {from} is not an ancestor of {to}, refusing to patch backwards")]
    CommitNotAncestor { from: String, to: String },

    #[error("Submodule {path} is not checked out")]
    SubmoduleNotCheckedOut { path: String },

    // Build errors
    #[error("Stage {stage} of image {image} failed: {source}")]
    Stage {
        image: String,
        stage: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("Patch {add} -> {to} failed: {reason}")]
    Patch {
        add: String,
        to: String,
        reason: String,
    },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Image {0} is not built yet")]
    ImageNotBuilt(String),

    // Cleanup errors
    #[error("Cleanup failed for {} image(s): {}", .failures.len(), join_failures(.failures))]
    CleanupFailed { failures: Vec<ImageFailure> },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a registry error from an API error code
    pub fn registry(
        reference: impl Into<String>,
        code: RegistryErrorCode,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::Registry {
            reference: reference.into(),
            code,
            status,
            message: message.into(),
        }
    }

    /// Wrap this error with the image and stage being processed
    pub fn in_stage(self, image: impl Into<String>, stage: impl fmt::Display) -> Self {
        Self::Stage {
            image: image.into(),
            stage: stage.to_string(),
            source: Box::new(self),
        }
    }

    /// The registry error code, looking through stage wrappers
    pub fn registry_code(&self) -> Option<&RegistryErrorCode> {
        match self {
            Self::Registry { code, .. } => Some(code),
            Self::Stage { source, .. } => source.registry_code(),
            _ => None,
        }
    }

    /// Repository or tag does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.registry_code(),
            Some(RegistryErrorCode::NameUnknown | RegistryErrorCode::ManifestUnknown)
        )
    }

    /// One registry entry is partially garbage-collected or unreadable
    pub fn is_broken_entry(&self) -> bool {
        matches!(
            self.registry_code(),
            Some(RegistryErrorCode::ManifestUnknown | RegistryErrorCode::BlobUnknown)
        ) || matches!(self, Self::MalformedResponse { .. })
    }

    /// The registry rejected the request as unauthorized
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.registry_code(), Some(RegistryErrorCode::Unauthorized))
    }

    /// Incremental patching failed and a full rebuild may recover
    pub fn is_patch_failure(&self) -> bool {
        match self {
            Self::Patch { .. } | Self::CommitNotAncestor { .. } | Self::GitCommand { .. } => true,
            Self::Stage { source, .. } => source.is_patch_failure(),
            _ => false,
        }
    }

    /// Check if error is retryable by a calling orchestrator
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidConfiguration(_) => {
                Some("Check images_repo in the config file, or pass --images-repo / --images-repo-mode")
            }
            Self::Registry {
                code: RegistryErrorCode::Unauthorized,
                ..
            } => Some("Check registry credentials: STRATA_REGISTRY_USERNAME / STRATA_REGISTRY_PASSWORD"),
            Self::Transport { .. } => {
                Some("Check registry address, or use --insecure-registry / --skip-tls-verify-registry")
            }
            Self::CommitNotAncestor { .. } => Some("Run the build with --patch-failure rebuild"),
            Self::SubmoduleNotCheckedOut { .. } => Some("Run: git submodule update --init --recursive"),
            _ => None,
        }
    }
}

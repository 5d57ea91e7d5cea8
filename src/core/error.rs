//! Error handling for the updater.
//!
//! Two layers, the same way the rest of the crate is built:
//!
//! - [`UpdaterError`] is the strongly typed taxonomy raised by the library
//!   (lookup failures, locked files, transport errors, service postconditions).
//! - [`ErrorContext`] wraps an [`UpdaterError`] with optional details and a
//!   suggestion and knows how to print itself to the terminal.
//!
//! Application code propagates `anyhow::Result` and adds context with
//! `.context()`. At the top of the binary, [`user_friendly_error`] walks the
//! error to recover the typed variant and attach a suggestion.
//!
//! "Version unknown" is not an error: it is a first-class `None` that pushes
//! a dependency towards reinstall.

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// Typed failures raised by the updater.
#[derive(Error, Debug, Clone)]
pub enum UpdaterError {
    /// The release listing could not be fetched or decoded.
    ///
    /// The affected dependency keeps an unknown remote version; sibling
    /// dependencies are still checked.
    #[error("Release lookup failed for {owner}/{repo}: {reason}")]
    LookupFailed {
        /// Repository owner
        owner: String,
        /// Repository name
        repo: String,
        /// Underlying transport or decode failure
        reason: String,
    },

    /// A download was requested before the release was resolved to an asset.
    #[error("No download URL resolved for asset '{asset}'")]
    MissingDownloadUrl {
        /// Configured asset name
        asset: String,
    },

    /// The target file stayed busy after every terminate-and-retry attempt.
    #[error("{path} is still locked after {attempts} attempts")]
    LockedResource {
        /// Path that could not be written or removed
        path: String,
        /// Number of attempts made
        attempts: usize,
    },

    /// The download stream failed.
    #[error("Download of {url} failed: {reason}")]
    TransportFailed {
        /// Download URL
        url: String,
        /// Underlying transport failure
        reason: String,
    },

    /// The downloaded archive could not be read.
    #[error("Cannot extract archive {path}: {reason}")]
    ArchiveFailed {
        /// Archive location
        path: String,
        /// Underlying archive failure
        reason: String,
    },

    /// Permission normalization failed for one or more installed files.
    #[error("Permission normalization failed for: {files}")]
    PermissionNormalization {
        /// Comma separated list of files
        files: String,
    },

    /// The generated unit file is missing after `dump`.
    #[error("Service file {path} does not exist")]
    ServiceFileMissing {
        /// Expected unit file location
        path: String,
    },

    /// The service is not active after `start`.
    #[error("Service {unit} is not started")]
    ServiceNotStarted {
        /// Unit file name
        unit: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration error
        message: String,
    },

    /// A filesystem operation failed.
    #[error("File system error during {operation}: {path}")]
    FileSystemError {
        /// Operation being performed
        operation: String,
        /// Path involved
        path: String,
    },

    /// Anything else.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
    },
}

/// An [`UpdaterError`] with user-facing details and a suggestion.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: UpdaterError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no details or suggestion.
    #[must_use]
    pub const fn new(error: UpdaterError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add details explaining the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error to stderr: error in red, details in yellow,
    /// suggestion in green.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into an [`ErrorContext`] suitable for the terminal.
///
/// Typed [`UpdaterError`]s anywhere in the chain get tailored suggestions,
/// I/O errors get filesystem guidance and everything else is rendered with
/// its full cause chain.
#[must_use]
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(updater_error) = error.chain().find_map(|e| e.downcast_ref::<UpdaterError>()) {
        return create_error_context(updater_error.clone());
    }

    if let Some(io_error) = error.chain().find_map(|e| e.downcast_ref::<std::io::Error>()) {
        match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                return ErrorContext::new(UpdaterError::FileSystemError {
                    operation: "file access".to_string(),
                    path: "unknown".to_string(),
                })
                .with_suggestion("Run vpnmupd as root: it writes to system directories")
                .with_details(error_chain_message(&error));
            }
            std::io::ErrorKind::NotFound => {
                return ErrorContext::new(UpdaterError::FileSystemError {
                    operation: "file access".to_string(),
                    path: "unknown".to_string(),
                })
                .with_suggestion("Check that the configured directories exist")
                .with_details(error_chain_message(&error));
            }
            _ => {}
        }
    }

    if let Some(toml_error) = error.downcast_ref::<toml::de::Error>() {
        return ErrorContext::new(UpdaterError::ConfigError {
            message: toml_error.to_string(),
        })
        .with_suggestion("Check the TOML syntax of the configuration file");
    }

    ErrorContext::new(UpdaterError::Other {
        message: error_chain_message(&error),
    })
}

fn error_chain_message(error: &anyhow::Error) -> String {
    let mut message = error.to_string();
    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();

    if !chain.is_empty() {
        message.push_str("\n\nCaused by:");
        for (i, cause) in chain.iter().enumerate() {
            message.push_str(&format!("\n  {}: {}", i + 1, cause));
        }
    }

    message
}

fn create_error_context(error: UpdaterError) -> ErrorContext {
    match &error {
        UpdaterError::LookupFailed { .. } => ErrorContext::new(error)
            .with_suggestion("Check network connectivity and the API rate limit, then retry")
            .with_details("The release listing is fetched from the configured api_base"),
        UpdaterError::MissingDownloadUrl { .. } => ErrorContext::new(error)
            .with_suggestion("Verify the asset name in the configuration matches a release asset")
            .with_details("The latest release has no asset with the configured name"),
        UpdaterError::LockedResource { .. } => ErrorContext::new(error)
            .with_suggestion("Stop the program using the file and run the update again")
            .with_details("The file was busy and terminating its holder did not release it"),
        UpdaterError::TransportFailed { .. } => ErrorContext::new(error)
            .with_suggestion("Retry the update; increase request_timeout_secs on slow links"),
        UpdaterError::ArchiveFailed { .. } => ErrorContext::new(error)
            .with_suggestion("Remove the staged archive and retry the update")
            .with_details("The downloaded file is not a readable zip archive"),
        UpdaterError::PermissionNormalization { .. } => ErrorContext::new(error)
            .with_suggestion("Run vpnmupd as root so installed files can be made executable"),
        UpdaterError::ServiceFileMissing { .. } => ErrorContext::new(error)
            .with_suggestion("Check that unit_dir exists and is writable"),
        UpdaterError::ServiceNotStarted { unit } => {
            let suggestion = format!("Inspect the service with 'journalctl -u {unit}'");
            ErrorContext::new(error).with_suggestion(suggestion)
        }
        UpdaterError::ConfigError { .. } => ErrorContext::new(error)
            .with_suggestion("Fix the configuration file or remove it to use the defaults"),
        _ => ErrorContext::new(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_context_display() {
        let context = ErrorContext::new(UpdaterError::ServiceNotStarted {
            unit: "vpnmd.service".to_string(),
        })
        .with_details("details here")
        .with_suggestion("do something");

        let rendered = context.to_string();
        assert!(rendered.contains("Service vpnmd.service is not started"));
        assert!(rendered.contains("Details: details here"));
        assert!(rendered.contains("Suggestion: do something"));
    }

    #[test]
    fn test_typed_error_found_through_context() {
        let err: anyhow::Result<()> = Err(UpdaterError::MissingDownloadUrl {
            asset: "vpnm".to_string(),
        }
        .into());
        let err = err.context("Failed to install vpnm").unwrap_err();

        let context = user_friendly_error(err);
        assert!(matches!(context.error, UpdaterError::MissingDownloadUrl { .. }));
        assert!(context.suggestion.is_some());
    }

    #[test]
    fn test_generic_error_keeps_chain() {
        let err = anyhow::anyhow!("root cause").context("outer");
        let context = user_friendly_error(err);

        match context.error {
            UpdaterError::Other { message } => {
                assert!(message.contains("outer"));
                assert!(message.contains("root cause"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_permission_denied_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let context = user_friendly_error(anyhow::Error::from(io));
        assert!(matches!(context.error, UpdaterError::FileSystemError { .. }));
        assert!(context.suggestion.unwrap().contains("root"));
    }
}

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the device directory and cast activation.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No directory entry matched the requested id or name
    #[error("device not found: \"{value}\"")]
    DeviceNotFound {
        /// The id or name that was looked up
        value: String,
    },

    /// A receiver answered with a non-success status
    #[error("{operation} failed: status={status:?} statusString=\"{status_string}\" spotifyError={spotify_error:?}")]
    Protocol {
        /// The protocol operation that failed (getInfo, addUser, transfer, ...)
        operation: String,
        status: Option<i64>,
        status_string: String,
        spotify_error: Option<i64>,
    },

    /// A bounded wait elapsed
    #[error("timed out after {duration:?} waiting for {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// mDNS discovery could not be started or stopped
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The cast application could not be launched
    #[error("cast application launch failed on {device}: {message}")]
    Launch {
        device: String,
        message: String,
    },

    /// Activation was requested for a device that is not a cast receiver
    #[error("device {0} is not a cast device")]
    NotCastDevice(String),

    /// Activation needs discovery, which was disabled in configuration
    #[error("discovery is disabled")]
    DiscoveryDisabled,

    /// Another activation or transfer is already running for the device
    #[error("device {0} is busy with another activation")]
    Busy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// HTTP transport failure (connection refused, DNS, non-2xx, ...)
    #[error("HTTP request to {url} failed: {message}")]
    Http {
        url: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A Web API collaborator call failed
    #[error("Web API error: {0}")]
    WebApi(String),

    /// The directory actor thread is gone
    #[error("device directory is closed")]
    DirectoryClosed,
}

impl DirectoryError {
    pub fn not_found(value: impl Into<String>) -> Self {
        DirectoryError::DeviceNotFound { value: value.into() }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        DirectoryError::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn http(url: impl Into<String>, err: impl ToString) -> Self {
        DirectoryError::Http {
            url: url.into(),
            message: err.to_string(),
        }
    }

    /// True when the underlying HTTP failure was a refused connection
    pub fn is_connection_refused(&self) -> bool {
        match self {
            DirectoryError::Http { message, .. } => {
                message.to_ascii_lowercase().contains("connection refused")
            }
            DirectoryError::Io(err) => err.kind() == io::ErrorKind::ConnectionRefused,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_message_carries_status() {
        let err = DirectoryError::Protocol {
            operation: "addUser".to_string(),
            status: Some(203),
            status_string: "ERROR-INVALID-ARGUMENTS".to_string(),
            spotify_error: Some(0),
        };
        let text = err.to_string();
        assert!(text.contains("addUser"));
        assert!(text.contains("203"));
        assert!(text.contains("ERROR-INVALID-ARGUMENTS"));
    }

    #[test]
    fn test_connection_refused_detection() {
        let err = DirectoryError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(err.is_connection_refused());
        assert!(!DirectoryError::DiscoveryDisabled.is_connection_refused());
    }
}

/*!
 * Error types shared across bondscan crates.
 */
use thiserror::Error;

/// Error type for bondscan operations
#[derive(Error, Debug)]
pub enum Error {
    /// A device observation was rejected before touching any state
    #[error("Invalid device record: {0}")]
    InvalidRecord(String),

    /// The registry lock was poisoned by a panicking writer
    #[error("Registry lock poisoned: {0}")]
    LockPoisoned(String),

    /// The platform has no Bluetooth adapter
    #[error("Bluetooth is not supported on this device")]
    AdapterUnavailable,

    /// The adapter is powered off
    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    /// Required runtime permissions were not granted
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The platform backend failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging setup error
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bondscan operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new invalid record error
    pub fn invalid_record<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidRecord(msg.as_ref().to_string())
    }

    /// Create a new lock poisoned error
    pub fn lock_poisoned<S: AsRef<str>>(msg: S) -> Self {
        Error::LockPoisoned(msg.as_ref().to_string())
    }

    /// Create a new permission denied error
    pub fn permission_denied<S: AsRef<str>>(msg: S) -> Self {
        Error::PermissionDenied(msg.as_ref().to_string())
    }

    /// Create a new backend error
    pub fn backend<S: AsRef<str>>(msg: S) -> Self {
        Error::Backend(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new logging error
    pub fn logging<S: AsRef<str>>(msg: S) -> Self {
        Error::Logging(msg.as_ref().to_string())
    }

    /// Whether the session can carry on after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::InvalidRecord(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_record("address is empty");
        assert_eq!(err.to_string(), "Invalid device record: address is empty");

        let err = Error::AdapterDisabled;
        assert_eq!(err.to_string(), "Bluetooth adapter is disabled");
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::invalid_record("x").is_recoverable());
        assert!(!Error::AdapterUnavailable.is_recoverable());
        assert!(!Error::backend("gone").is_recoverable());
    }

    #[test]
    fn test_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

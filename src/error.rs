use std::fmt::Display;

/// Logpack errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The requested block ID is not known to the block manager.
    NotFound(String),
    /// A block with this ID already exists or is currently being written.
    AlreadyPresent(String),
    /// Irrecoverable on-disk damage, typically a metadata record that fails
    /// its checksum or contradicts earlier records.
    Corruption(String),
    /// An IO error.
    IO(String),
    /// A write was attempted on a container that has been retired to
    /// read-only after a failed commit sync.
    ReadOnly(String),
    /// A data directory has become unusable and is excluded from writes.
    DiskFailure(String),
    /// No data directory can accept more blocks or containers.
    ResourceExhausted(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::AlreadyPresent(msg) => write!(f, "already present: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::ReadOnly(msg) => write!(f, "container is read-only: {msg}"),
            Error::DiskFailure(msg) => write!(f, "disk failure: {msg}"),
            Error::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
        }
    }
}

/// A logpack Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::NotFound("block 7".to_string());
        assert_eq!(err.to_string(), "not found: block 7");

        let err = Error::ReadOnly("container abc".to_string());
        assert_eq!(err.to_string(), "container is read-only: container abc");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::IO(_)));
    }

    #[test]
    fn test_errcorrupt_macro() {
        let err = errcorrupt!("bad record at {}", 42);
        assert_eq!(err, Error::Corruption("bad record at 42".to_string()));
    }
}

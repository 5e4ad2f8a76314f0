use std::fmt;

/// Convenience alias for this crate's `Result` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types produced by the monitor and filter compiler.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A caller-supplied argument was invalid (empty subsystem/tag, unknown group name, ...).
    InvalidArgument(String),
    /// A caller-supplied capacity hint was exhausted while mutating a filter collection.
    OutOfMemory,
    /// The compiled BPF program would exceed the instruction cap.
    TooBig { limit: usize, attempted: usize },
    /// A syscall failed; wraps the OS error text.
    OsError(String),
    /// A received datagram was dropped: malformed, filtered, or inadmissible. Recoverable.
    Again(String),
    /// A send to a multicast destination had no subscribers.
    TransportRefused,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::OsError(format!("{err}"))
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Self::OsError(format!("{err}"))
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(err: std::ffi::NulError) -> Self {
        Self::InvalidArgument(format!("invalid FFI C-String: {err}"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(err) => write!(f, "invalid argument: {err}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::TooBig { limit, attempted } => write!(
                f,
                "filter program too big: attempted {attempted} instructions, limit is {limit}"
            ),
            Self::OsError(err) => write!(f, "OS error: {err}"),
            Self::Again(err) => write!(f, "message dropped: {err}"),
            Self::TransportRefused => write!(f, "transport refused (no subscribers)"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", Error::TooBig {
                limit: 512,
                attempted: 513
            }),
            "filter program too big: attempted 513 instructions, limit is 512"
        );
        assert_eq!(format!("{}", Error::OutOfMemory), "out of memory");
        assert_eq!(
            format!("{}", Error::TransportRefused),
            "transport refused (no subscribers)"
        );
    }
}

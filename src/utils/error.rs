//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for emberstore.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EmberError(pub String);

impl EmberError {
    /// Constructs an error from anything displayable.
    pub fn msg(what: impl fmt::Display) -> Self {
        EmberError(what.to_string())
    }
}

impl fmt::Display for EmberError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for EmberError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `EmberError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for EmberError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                EmberError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EmberError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        EmberError(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for EmberError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        EmberError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = EmberError("unrecoverable segment 88".into());
        assert_eq!(format!("{}", e), String::from("unrecoverable segment 88"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = EmberError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}

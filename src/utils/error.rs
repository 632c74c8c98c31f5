//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for fedloc.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FedError(String);

impl FedError {
    pub fn msg(msg: impl ToString) -> Self {
        FedError(msg.to_string())
    }
}

impl fmt::Display for FedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for FedError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `FedError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for FedError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                FedError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `FedError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for FedError {
            fn from(e: $error) -> FedError {
                FedError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::time::error::Elapsed);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = FedError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = FedError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_decode_error() {
        let garbage = [0xc1u8]; // reserved MessagePack marker
        let res: Result<String, _> = rmp_serde::from_slice(&garbage);
        let e = FedError::from(res.unwrap_err());
        assert!(!e.0.is_empty());
    }
}

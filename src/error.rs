use std::fmt;

use crate::{address::ParseAddressError, uuid::ParseUuidError};

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
///
/// Every operation in this crate is either a call to the Bluetooth daemon or a read of a value it
/// reported earlier, so most errors wrap a D-Bus failure.
#[derive(Debug)]
pub struct Error {
    inner: ErrorKind,
}

impl Error {
    pub(crate) fn from(e: impl Into<ErrorKind>) -> Self {
        Self { inner: e.into() }
    }

    pub(crate) fn missing(property: &str) -> Self {
        Self::from(ErrorKind::MissingProperty(property.to_string()))
    }

    pub(crate) fn mismatch(property: &str) -> Self {
        Self::from(ErrorKind::TypeMismatch(property.to_string()))
    }

    /// Returns `true` if the daemon did not report a value for a property it should have.
    ///
    /// This usually means the remote object has vanished in the meantime.
    pub fn is_missing_property(&self) -> bool {
        matches!(self.inner, ErrorKind::MissingProperty(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorKind::Zbus(e) => e.fmt(f),
            ErrorKind::Fdo(e) => e.fmt(f),
            ErrorKind::ParseAddressError(e) => e.fmt(f),
            ErrorKind::ParseUuidError(e) => e.fmt(f),
            ErrorKind::MissingProperty(name) => {
                write!(f, "daemon did not report property '{}'", name)
            }
            ErrorKind::TypeMismatch(name) => {
                write!(f, "property '{}' has an unexpected type", name)
            }
            ErrorKind::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            ErrorKind::Zbus(e) => Some(e),
            ErrorKind::Fdo(e) => Some(e),
            ErrorKind::ParseAddressError(e) => Some(e),
            ErrorKind::ParseUuidError(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Zbus(zbus::Error),
    Fdo(zbus::fdo::Error),
    ParseAddressError(ParseAddressError),
    ParseUuidError(ParseUuidError),
    MissingProperty(String),
    TypeMismatch(String),
    Other(String),
}

impl From<zbus::Error> for ErrorKind {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::fdo::Error> for ErrorKind {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<ParseAddressError> for ErrorKind {
    fn from(value: ParseAddressError) -> Self {
        Self::ParseAddressError(value)
    }
}

impl From<ParseUuidError> for ErrorKind {
    fn from(value: ParseUuidError) -> Self {
        Self::ParseUuidError(value)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Error::missing("Alias").to_string(),
            "daemon did not report property 'Alias'"
        );
        assert_eq!(
            Error::mismatch("RSSI").to_string(),
            "property 'RSSI' has an unexpected type"
        );
        assert_eq!(Error::from("boom").to_string(), "boom");
    }

    #[test]
    fn missing_property() {
        assert!(Error::missing("Paired").is_missing_property());
        assert!(!Error::mismatch("Paired").is_missing_property());
    }
}

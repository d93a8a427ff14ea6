use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

/// The result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate's error type.
///
/// Configuration errors (`InvalidConfig`, `UnknownBackend`, `UnknownOptimizer`)
/// are fatal by design: they are surfaced once, at construction time, before
/// any training or inference has started.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Json(serde_json::Error),
    InvalidConfig {
        path: String,
    },
    UnknownBackend(String),
    UnknownOptimizer(String),
    UnknownActivation(String),
    NoModel,
    MissingLayer(String),
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Json(e) => write!(f, "json error: {e}"),
            Error::InvalidConfig { path } => {
                write!(f, "Invalid optimizer config file: {path}")
            }
            Error::UnknownBackend(name) => write!(f, "Unsupported optimizer backend: {name}"),
            Error::UnknownOptimizer(name) => write!(f, "Unknown optimizer: {name}"),
            Error::UnknownActivation(name) => write!(f, "Unknown activation: {name}"),
            Error::NoModel => write!(f, "No model handle has been constructed"),
            Error::MissingLayer(name) => write!(f, "The net has no layer named {name}"),
            Error::SizeMismatch {
                what,
                got,
                expected,
            } => {
                write!(
                    f,
                    "There's a size mismatch in {what}, got {got} and expected {expected}"
                )
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

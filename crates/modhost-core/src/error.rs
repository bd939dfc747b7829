//! Unified error handling for modhost.
//!
//! Loader, registry and configuration failures all surface as [`Error`].
//! Registration calls made by an extension report the narrower
//! [`ModuleError`] code, which is also stored on the extension record.

use std::fmt;
use std::path::PathBuf;

/// Unified error type for the extension runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The extension was built for a different module system.
    #[error("{path}: extension was compiled for '{found}', we were configured for '{expected}'. Rebuild the extension")]
    VersionMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// The extension was built with an incompatible toolchain.
    #[error("{path}: extension was built with toolchain {found}, core was built with {expected}. Rebuild the core and all extensions")]
    AbiMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Header or tag validation failed.
    #[error("{path}: {message}")]
    Validation { path: PathBuf, message: String },

    /// The declared module-system version is not on the allow-list.
    #[error("{path}: unsupported module system version '{version}'")]
    UnsupportedModuleSystem { path: PathBuf, version: String },

    /// A required lifecycle entry point is missing.
    #[error("{path}: unable to locate {symbol}")]
    MissingEntryPoint { path: PathBuf, symbol: String },

    /// A declared symbol dependency could not be resolved.
    #[error("{extension}: dependency problem, cannot resolve symbol {symbol}")]
    UnresolvedSymbol { extension: String, symbol: String },

    /// Resolving a symbol would make an extension depend on its own dependent.
    #[error("{extension}: circular dependency on {provider} via symbol {symbol}")]
    CircularDependency {
        extension: String,
        provider: String,
        symbol: String,
    },

    /// The pre-activation self-test returned a failure code.
    #[error("{extension}: self-test returned {code}")]
    SelfTestFailed { extension: String, code: i32 },

    /// An entry point returned a failure code.
    #[error("{extension}: {entry} returned {code}")]
    EntryFailed {
        extension: String,
        entry: &'static str,
        code: i32,
    },

    /// Removed together with a provider that failed.
    #[error("{extension}: unloaded because {provider} failed to {entry}")]
    DependencyDiscarded {
        extension: String,
        provider: String,
        entry: &'static str,
    },

    /// The extension refused to unload.
    #[error("Failed to unload '{0}'")]
    UnloadRefused(String),

    /// Single-winner slots are over- or under-subscribed.
    #[error("{}", SlotProblems(.0))]
    SlotCheck(Vec<String>),

    /// The binary could not be opened.
    #[error("{path}: {message}")]
    Open { path: PathBuf, message: String },

    /// A registration call was rejected.
    #[error("Registration error: {0}")]
    Registration(#[from] ModuleError),

    /// Authentication configuration errors.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

struct SlotProblems<'a>(&'a [String]);

impl fmt::Display for SlotProblems<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} slot problem(s): {}", self.0.len(), self.0.join("; "))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: msg.into(),
        }
    }
}

/// Error code left on an extension by its last registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, thiserror::Error)]
pub enum ModuleError {
    #[default]
    #[error("No error")]
    NoError,
    #[error("Object already exists")]
    Exists,
    #[error("No space available")]
    NoSpace,
    #[error("Invalid parameter(s)")]
    Invalid,
    #[error("Object was not found")]
    NotFound,
}

/// Creates an [`Error::Config`].
#[macro_export]
macro_rules! config_err {
    ($msg:expr) => {
        $crate::error::Error::Config($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Config(format!($fmt, $($arg)*))
    };
}

/// Creates an [`Error::Validation`] for a binary path.
#[macro_export]
macro_rules! validation_err {
    ($path:expr, $msg:expr) => {
        $crate::error::Error::validation($path, $msg)
    };
    ($path:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::validation($path, format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! auth_err {
    ($msg:expr) => {
        $crate::error::Error::Auth($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Auth(format!($fmt, $($arg)*))
    };
}

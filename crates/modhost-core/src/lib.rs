//! Extension runtime for a modular daemon.
//!
//! This crate loads, validates and unloads extensions, resolves the
//! symbols they depend on, and owns the registries they plug into:
//! hooks, single-winner callbacks and efunctions, hook types, version
//! flags, command overrides and authentication backends.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod extension;
pub mod registry;
pub mod runtime;
pub mod trie;

pub use config::{AuthConfig, RuntimeConfig};
pub use error::{Error, ModuleError, Result};
pub use extension::{
    Extension, ExtensionId, ExtensionOptions, ExtensionState, Loader, ModuleInfo, ModuleReturn,
    StaticBinary, UnloadOutcome,
};
pub use registry::{ModuleObject, Registries};
pub use runtime::Runtime;
pub use trie::Trie;

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{defaults, env_vars, AuthConfig, RuntimeConfig};

    // Error handling
    pub use crate::error::{Error, ModuleError, Result};

    // Extensions
    pub use crate::extension::{
        Extension, ExtensionId, ExtensionOptions, ExtensionState, ExtensionSummary, Loader,
        ModuleInfo, ModuleReturn, StaticBinary, UnloadOutcome,
    };

    // Registries
    pub use crate::registry::{CommandCall, OverrideLink, Registries};

    // Authentication
    pub use crate::auth::{AuthClient, AuthData, AuthOps, AuthOutcome};

    pub use crate::runtime::Runtime;
    pub use crate::trie::Trie;
}

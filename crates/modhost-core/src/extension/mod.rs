//! Extension loading and lifecycle.
//!
//! An extension is opened from a native shared object ([`NativeBinary`])
//! or taken from the in-process builtin catalog ([`StaticBinary`]). The
//! [`Loader`] validates it, resolves its declared symbol dependencies and
//! drives it through `Testing → Initialized → Loaded`, and back out again.

pub mod abi;
pub mod binary;
pub mod builtin;
pub mod context;
mod listing;
pub mod loader;
pub mod native;
pub mod record;
mod resolve;

pub use abi::{BuildTag, CallingConvention, Entry, ModsysVersion, ModuleReturn, MOD_VERSION_TAG};
pub use binary::{EntryPoint, ExtensionBinary, HostSymbols, SymbolDependency, SymbolProvider};
pub use builtin::{StaticBinary, StaticBinaryBuilder};
pub use context::ModuleInfo;
pub use loader::{Loader, UnloadOutcome};
pub use native::{purge_temp_dir, NativeBinary};
pub use record::{Extension, ExtensionHeader, ExtensionId, ExtensionOptions, ExtensionState, ExtensionSummary};
pub use resolve::SymbolScope;

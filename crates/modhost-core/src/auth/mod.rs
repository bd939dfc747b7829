//! Pluggable authentication backends.
//!
//! A backend is a named [`AuthOps`] table registered by an extension.
//! Password blocks name a backend (or none, for plain text) and the
//! helpers here combine the stored blob with a presented credential.

pub mod certfp;
pub mod clientcert;
pub mod crypt;
pub mod digest;

use std::sync::Arc;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::extension::StaticBinary;
use crate::trie::{ascii_uppercase, Trie};

/// Longest plain-text password accepted in configuration.
pub const PASSWDLEN: usize = 48;
/// Longest input accepted by [`mkpasswd`].
pub const MKPASSWD_MAX: usize = 64;

/// Result of checking a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthOutcome {
    Failed = -1,
    /// No authentication was configured.
    Succeeded = 1,
    /// The presented parameter matched.
    SucceededWithParameter = 2,
    /// The backend will answer later; not an error.
    Delayed = -2,
}

impl AuthOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, AuthOutcome::Succeeded | AuthOutcome::SucceededWithParameter)
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// The connection presenting a credential.
pub trait AuthClient {
    /// DER-encoded TLS client certificate, if any.
    fn tls_certificate(&self) -> Option<&[u8]> {
        None
    }
}

impl AuthClient for () {}

/// A client that presented a TLS certificate.
#[derive(Debug, Clone, Copy)]
pub struct CertificateClient<'a>(pub &'a [u8]);

impl AuthClient for CertificateClient<'_> {
    fn tls_certificate(&self) -> Option<&[u8]> {
        Some(self.0)
    }
}

pub type ValidateFn = fn(&dyn AuthClient, &AuthData, Option<&str>) -> AuthOutcome;
pub type MakeHashFn = fn(&str) -> Option<String>;
pub type ConfigHandleFn = fn(&AuthData) -> std::result::Result<(), String>;

/// Capability table of one backend.
#[derive(Debug, Clone)]
pub struct AuthOps {
    pub name: String,
    pub validate: Option<ValidateFn>,
    pub make_hash: Option<MakeHashFn>,
    pub config_handle: Option<ConfigHandleFn>,
}

impl AuthOps {
    pub fn new(name: impl Into<String>, validate: ValidateFn) -> Self {
        Self {
            name: name.into(),
            validate: Some(validate),
            make_hash: None,
            config_handle: None,
        }
    }

    pub fn with_make_hash(mut self, make_hash: MakeHashFn) -> Self {
        self.make_hash = Some(make_hash);
        self
    }

    pub fn with_config_handle(mut self, handle: ConfigHandleFn) -> Self {
        self.config_handle = Some(handle);
        self
    }
}

/// Backends by case-insensitive name.
#[derive(Debug, Default)]
pub struct AuthRegistry {
    backends: Option<Trie<Arc<AuthOps>>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` if a backend of that name is already registered.
    pub fn register(&mut self, ops: AuthOps) -> bool {
        let tree = self
            .backends
            .get_or_insert_with(|| Trie::named("auth_ops", Some(ascii_uppercase)));
        let name = ops.name.clone();
        tree.add(&name, Arc::new(ops))
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<AuthOps>> {
        self.backends.as_mut()?.delete(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<AuthOps>> {
        self.backends.as_ref()?.find(name).cloned()
    }

    /// Registered backend names, canonical and sorted.
    pub fn names(&self) -> Vec<String> {
        self.backends
            .as_ref()
            .map(|t| t.iter().map(|(k, _)| k.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.backends.as_ref().map_or(0, Trie::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A configured password: the stored blob and the backend that reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub data: String,
    /// Backend name; `None` compares in plain text.
    pub method: Option<String>,
}

impl AuthData {
    pub fn plain(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            method: None,
        }
    }

    pub fn with_method(data: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            method: Some(method.into()),
        }
    }
}

/// Validate a password block and turn it into [`AuthData`].
pub fn check_config(registry: &AuthRegistry, config: &AuthConfig) -> Result<AuthData> {
    let Some(password) = config.password.as_deref() else {
        return Err(Error::auth(format!(
            "{}: authentication module failure: missing parameter",
            config.name
        )));
    };
    if config.methods.len() > 1 {
        return Err(Error::auth(format!(
            "{}: you may not have multiple authentication methods",
            config.name
        )));
    }

    if let Some(method) = config.methods.first() {
        let ops = registry.lookup(method).ok_or_else(|| {
            Error::auth(format!(
                "{}: authentication module failure: {} is not an implemented/enabled authentication method",
                config.name, method
            ))
        })?;
        let data = AuthData::with_method(password, method.clone());
        if let Some(handle) = ops.config_handle {
            handle(&data).map_err(|e| {
                Error::auth(format!(
                    "{}: authentication module failure: {}",
                    config.name, e
                ))
            })?;
        }
        return Ok(data);
    }

    if password.len() > PASSWDLEN {
        return Err(Error::auth(format!(
            "{}: passwords length may not exceed {}",
            config.name, PASSWDLEN
        )));
    }
    Ok(AuthData::plain(password))
}

/// Check `param` against a configured password.
///
/// No configured password lets everyone in. The backend is looked up at
/// call time, so a password whose backend has since been unloaded fails.
pub fn check_auth(
    registry: &AuthRegistry,
    client: &dyn AuthClient,
    auth: Option<&AuthData>,
    param: Option<&str>,
) -> AuthOutcome {
    let Some(auth) = auth else {
        return AuthOutcome::Succeeded;
    };
    match auth.method.as_deref() {
        None => match param {
            Some(param) if param == auth.data => AuthOutcome::SucceededWithParameter,
            _ => AuthOutcome::Failed,
        },
        Some(method) => match registry.lookup(method).and_then(|ops| ops.validate) {
            Some(validate) => validate(client, auth, param),
            None => AuthOutcome::Failed,
        },
    }
}

/// Hash `param` with `method`.
///
/// Unknown methods and backends without a hash function echo the input.
/// `None` means the backend failed.
pub fn make_auth(registry: &AuthRegistry, method: &str, param: &str) -> Option<String> {
    match registry.lookup(method).and_then(|ops| ops.make_hash) {
        Some(make_hash) => make_hash(param),
        None => Some(param.to_string()),
    }
}

/// Reply text of the hash-generation command.
pub fn mkpasswd(registry: &AuthRegistry, method: &str, param: &str) -> String {
    if param.is_empty() {
        return "Syntax: mkpasswd <authmethod> <parameter>".to_string();
    }
    if param.len() > MKPASSWD_MAX {
        return "Your parameter (text-to-hash) is too long.".to_string();
    }
    if registry.lookup(method).is_none() {
        return format!("{} is not an enabled authentication method", method);
    }
    match make_auth(registry, method, param) {
        Some(hash) => format!(
            "Authentication phrase (method={}, para={}) is: {}",
            method, param, hash
        ),
        None => format!("Authentication method {} failed", method),
    }
}

/// The stock backends as builtin extensions.
pub fn stock_extensions() -> Vec<StaticBinary> {
    vec![
        crypt::extension(),
        digest::md5_extension(),
        digest::sha1_extension(),
        certfp::extension(),
        clientcert::extension(),
    ]
}

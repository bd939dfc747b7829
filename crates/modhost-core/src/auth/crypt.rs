//! `crypt` and `unixcrypt` backends, backed by bcrypt.

use tracing::error;

use super::{AuthClient, AuthData, AuthOps, AuthOutcome};
use crate::extension::{ModuleInfo, ModuleReturn, StaticBinary};

/// bcrypt cost used for new hashes.
pub const BCRYPT_COST: u32 = 10;

pub fn validate(_: &dyn AuthClient, auth: &AuthData, param: Option<&str>) -> AuthOutcome {
    let Some(param) = param else {
        return AuthOutcome::Failed;
    };
    if auth.data.len() < 2 {
        return AuthOutcome::Failed;
    }
    if bcrypt::verify(param, &auth.data).unwrap_or(false) {
        AuthOutcome::SucceededWithParameter
    } else {
        AuthOutcome::Failed
    }
}

pub fn make_hash(param: &str) -> Option<String> {
    bcrypt::hash(param, BCRYPT_COST)
        .map_err(|e| error!(category = "auth", error = %e, "Failed to hash password"))
        .ok()
}

pub fn config_handle(auth: &AuthData) -> Result<(), String> {
    if auth.data.len() < 2 {
        return Err("crypt: no salt (crypt strings will always be >2 in length)".to_string());
    }
    if !auth.data.starts_with("$2") {
        return Err("crypt: stored password is not a bcrypt hash".to_string());
    }
    Ok(())
}

fn ops(name: &str) -> AuthOps {
    AuthOps::new(name, validate)
        .with_make_hash(make_hash)
        .with_config_handle(config_handle)
}

fn init(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.mark_official();
    ModuleReturn::Success
}

fn load(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_register(ops("crypt"));
    info.auth_register(ops("unixcrypt"));
    ModuleReturn::Success
}

fn unload(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_unregister("crypt");
    info.auth_unregister("unixcrypt");
    ModuleReturn::Success
}

pub fn extension() -> StaticBinary {
    StaticBinary::builder("auth_crypt")
        .description("crypt/unixcrypt authentication type")
        .modversion("3.2-b8-1")
        .init(init)
        .load(load)
        .unload(unload)
        .build()
}

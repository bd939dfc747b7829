//! Salted digest backends: `md5` and `sha1`.
//!
//! Stored form is `$<b64 salt>$<b64 H(H(password) + salt)>`. Passwords
//! without a salt (`b64(H(password))`) are still accepted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::Md5;
use rand::RngCore;
use sha1::{Digest, Sha1};

use super::{AuthClient, AuthData, AuthOps, AuthOutcome};
use crate::extension::{ModuleInfo, ModuleReturn, StaticBinary};

/// Raw salt bytes generated for new hashes.
pub const RAW_SALT_LEN: usize = 6;
const MAX_SALT_LEN: usize = 127;

/// Split `$salt$hash`. `None` for the unsalted form.
fn parse_salted(stored: &str) -> Option<(&str, &str)> {
    let rest = stored.strip_prefix('$')?;
    let (salt, hash) = rest.split_once('$')?;
    if salt.is_empty() || hash.is_empty() {
        return None;
    }
    let salt = salt.get(..MAX_SALT_LEN).unwrap_or(salt);
    Some((salt, hash))
}

fn salted_digest<D: Digest>(param: &str, salt: &[u8]) -> Vec<u8> {
    let first = D::digest(param.as_bytes());
    let mut hasher = D::new();
    hasher.update(&first);
    hasher.update(salt);
    hasher.finalize().to_vec()
}

fn validate_with<D: Digest>(auth: &AuthData, param: Option<&str>) -> AuthOutcome {
    let Some(param) = param else {
        return AuthOutcome::Failed;
    };
    let matches = match parse_salted(&auth.data) {
        None => STANDARD.encode(D::digest(param.as_bytes())) == auth.data,
        Some((salt, hash)) => match STANDARD.decode(salt) {
            Ok(salt) if !salt.is_empty() => STANDARD.encode(salted_digest::<D>(param, &salt)) == hash,
            _ => false,
        },
    };
    if matches {
        AuthOutcome::SucceededWithParameter
    } else {
        AuthOutcome::Failed
    }
}

fn make_hash_with<D: Digest>(param: &str) -> Option<String> {
    let mut salt = [0u8; RAW_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    Some(format!(
        "${}${}",
        STANDARD.encode(salt),
        STANDARD.encode(salted_digest::<D>(param, &salt))
    ))
}

pub fn md5_validate(_: &dyn AuthClient, auth: &AuthData, param: Option<&str>) -> AuthOutcome {
    validate_with::<Md5>(auth, param)
}

pub fn md5_make_hash(param: &str) -> Option<String> {
    make_hash_with::<Md5>(param)
}

pub fn sha1_validate(_: &dyn AuthClient, auth: &AuthData, param: Option<&str>) -> AuthOutcome {
    validate_with::<Sha1>(auth, param)
}

pub fn sha1_make_hash(param: &str) -> Option<String> {
    make_hash_with::<Sha1>(param)
}

fn init(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.mark_official();
    ModuleReturn::Success
}

fn md5_load(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_register(AuthOps::new("md5", md5_validate).with_make_hash(md5_make_hash));
    ModuleReturn::Success
}

fn md5_unload(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_unregister("md5");
    ModuleReturn::Success
}

fn sha1_load(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_register(AuthOps::new("sha1", sha1_validate).with_make_hash(sha1_make_hash));
    ModuleReturn::Success
}

fn sha1_unload(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_unregister("sha1");
    ModuleReturn::Success
}

pub fn md5_extension() -> StaticBinary {
    StaticBinary::builder("auth_unreal_md5")
        .description("md5 authentication type")
        .modversion("3.2-b8-1")
        .init(init)
        .load(md5_load)
        .unload(md5_unload)
        .build()
}

pub fn sha1_extension() -> StaticBinary {
    StaticBinary::builder("auth_unreal_sha1")
        .description("sha1 authentication type")
        .modversion("3.2-b8-1")
        .init(init)
        .load(sha1_load)
        .unload(sha1_unload)
        .build()
}

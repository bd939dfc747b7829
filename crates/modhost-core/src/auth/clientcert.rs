//! `sslclientcert` backend: the client must present the certificate stored
//! in a PEM file.
//!
//! The configured password is the path of the file. It is read when the
//! configuration is checked and again on every validation, so replacing
//! the file takes effect without a rehash.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{AuthClient, AuthData, AuthOps, AuthOutcome};
use crate::extension::{ModuleInfo, ModuleReturn, StaticBinary};

/// DER bytes of the first certificate in a PEM file.
pub fn read_certificate(path: &Path) -> Result<Vec<u8>, String> {
    let file = File::open(path).map_err(|e| {
        format!(
            "AUTHTYPE_SSL_CLIENTCERT: error opening file {}: {}",
            path.display(),
            e
        )
    })?;
    let mut reader = BufReader::new(file);
    let first = rustls_pemfile::certs(&mut reader).next();
    match first {
        Some(Ok(cert)) => {
            let der: &[u8] = cert.as_ref();
            Ok(der.to_vec())
        }
        _ => Err(format!(
            "AUTHTYPE_SSL_CLIENTCERT: no PEM certificate in file {} (format error?)",
            path.display()
        )),
    }
}

fn config_handle(auth: &AuthData) -> Result<(), String> {
    read_certificate(Path::new(&auth.data)).map(|_| ())
}

pub fn validate(client: &dyn AuthClient, auth: &AuthData, param: Option<&str>) -> AuthOutcome {
    if param.is_none() {
        return AuthOutcome::Failed;
    }
    let Some(presented) = client.tls_certificate() else {
        return AuthOutcome::Failed;
    };
    match read_certificate(Path::new(&auth.data)) {
        Ok(stored) if stored == presented => AuthOutcome::SucceededWithParameter,
        _ => AuthOutcome::Failed,
    }
}

fn init(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.mark_official();
    ModuleReturn::Success
}

fn load(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_register(AuthOps::new("sslclientcert", validate).with_config_handle(config_handle));
    ModuleReturn::Success
}

fn unload(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_unregister("sslclientcert");
    ModuleReturn::Success
}

pub fn extension() -> StaticBinary {
    StaticBinary::builder("auth_clientcert")
        .description("clientcert authentication type")
        .modversion("3.2-b8-1")
        .init(init)
        .load(load)
        .unload(unload)
        .build()
}

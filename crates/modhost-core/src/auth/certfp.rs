//! `sslclientcertfp` backend: SHA-256 fingerprint of the TLS client certificate.

use sha2::{Digest, Sha256};

use super::{AuthClient, AuthData, AuthOps, AuthOutcome};
use crate::extension::{ModuleInfo, ModuleReturn, StaticBinary};

/// Lower-case hex fingerprint of a DER certificate, optionally colon-separated.
pub fn fingerprint(der: &[u8], colons: bool) -> String {
    let digest = Sha256::digest(der);
    if !colons {
        return hex::encode(digest);
    }
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn validate(client: &dyn AuthClient, auth: &AuthData, param: Option<&str>) -> AuthOutcome {
    if param.is_none() {
        return AuthOutcome::Failed;
    }
    let Some(der) = client.tls_certificate() else {
        return AuthOutcome::Failed;
    };
    let stored = auth.data.as_str();
    if stored.eq_ignore_ascii_case(&fingerprint(der, false))
        || stored.eq_ignore_ascii_case(&fingerprint(der, true))
    {
        AuthOutcome::SucceededWithParameter
    } else {
        AuthOutcome::Failed
    }
}

fn init(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.mark_official();
    ModuleReturn::Success
}

fn load(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_register(AuthOps::new("sslclientcertfp", validate));
    ModuleReturn::Success
}

fn unload(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.auth_unregister("sslclientcertfp");
    ModuleReturn::Success
}

pub fn extension() -> StaticBinary {
    StaticBinary::builder("auth_clientcertfp")
        .description("clientcert fingerprint authentication type")
        .modversion("3.2-b8-1")
        .init(init)
        .load(load)
        .unload(unload)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CertificateClient;

    const CERT: &[u8] = b"certificate";
    const FP: &str = "03d66dd08835c1ca3f128cceacd1f31ac94163096b20f445ae84285bc0832d72";

    #[test]
    fn test_fingerprint_forms() {
        assert_eq!(fingerprint(CERT, false), FP);
        let colons = fingerprint(CERT, true);
        assert!(colons.starts_with("03:d6:6d:"));
        assert_eq!(colons.replace(':', ""), FP);
    }

    #[test]
    fn test_validate() {
        let client = CertificateClient(CERT);
        let auth = AuthData::with_method(FP.to_uppercase(), "sslclientcertfp");
        assert_eq!(validate(&client, &auth, Some("")), AuthOutcome::SucceededWithParameter);

        let auth = AuthData::with_method(fingerprint(CERT, true), "sslclientcertfp");
        assert_eq!(validate(&client, &auth, Some("")), AuthOutcome::SucceededWithParameter);

        assert_eq!(validate(&(), &auth, Some("")), AuthOutcome::Failed);
        assert_eq!(validate(&client, &auth, None), AuthOutcome::Failed);
        assert_eq!(
            validate(&CertificateClient(b"other"), &auth, Some("")),
            AuthOutcome::Failed
        );
    }
}

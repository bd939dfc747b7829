//! Authentication backends through a running runtime.
//!
//! Tests hashing and checking with the stock backends, plain-text
//! passwords, certificate fingerprints and files, configuration checks
//! and what happens once a backend's extension is gone.

use modhost_core::auth::{certfp, AuthData, AuthOutcome, CertificateClient};
use modhost_core::{AuthConfig, Error, Runtime, RuntimeConfig};

fn runtime(dir: &tempfile::TempDir, load: &[&str], auth: Vec<AuthConfig>) -> Runtime {
    let config = RuntimeConfig {
        module_dir: dir.path().join("modules"),
        tmp_dir: dir.path().join("tmp"),
        load: load.iter().map(|s| s.to_string()).collect(),
        auth,
        ..Default::default()
    };
    Runtime::new(config)
}

fn block(name: &str, password: &str, methods: &[&str]) -> AuthConfig {
    AuthConfig {
        name: name.to_string(),
        password: Some(password.to_string()),
        methods: methods.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn test_crypt_hash_and_check() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["auth_crypt"], vec![]);
    assert!(rt.start().unwrap().is_empty());

    let hash = rt.make_auth("crypt", "hunter2").unwrap();
    assert!(hash.starts_with("$2"));
    let data = AuthData::with_method(hash, "crypt");
    assert_eq!(
        rt.auth_check(&(), Some(&data), Some("hunter2")),
        AuthOutcome::SucceededWithParameter
    );
    assert_eq!(rt.auth_check(&(), Some(&data), Some("hunter3")), AuthOutcome::Failed);
    assert_eq!(rt.auth_check(&(), Some(&data), None), AuthOutcome::Failed);

    let reply = rt.mkpasswd("unixcrypt", "hunter2");
    assert!(reply.starts_with("Authentication phrase (method=unixcrypt, para=hunter2) is: $2"));
}

#[test]
fn test_digest_round_trip_through_mkpasswd() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["auth_unreal_md5", "auth_unreal_sha1"], vec![]);
    rt.start().unwrap();

    for method in ["md5", "SHA1"] {
        let hash = rt.make_auth(method, "letmein").unwrap();
        assert!(hash.starts_with('$'));
        let data = AuthData::with_method(hash, method);
        assert!(rt.auth_check(&(), Some(&data), Some("letmein")).is_success());
        assert!(!rt.auth_check(&(), Some(&data), Some("letmeout")).is_success());
    }
}

#[test]
fn test_mkpasswd_replies() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["auth_unreal_md5"], vec![]);
    rt.start().unwrap();

    assert_eq!(rt.mkpasswd("md5", ""), "Syntax: mkpasswd <authmethod> <parameter>");
    assert_eq!(
        rt.mkpasswd("md5", &"x".repeat(65)),
        "Your parameter (text-to-hash) is too long."
    );
    assert_eq!(
        rt.mkpasswd("ripemd160", "secret"),
        "ripemd160 is not an enabled authentication method"
    );
    // Unknown methods pass the text through unchanged.
    assert_eq!(rt.make_auth("ripemd160", "secret").as_deref(), Some("secret"));
}

#[test]
fn test_plain_and_absent_passwords() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir, &[], vec![]);
    let plain = AuthData::plain("opensesame");

    assert_eq!(rt.auth_check(&(), None, None), AuthOutcome::Succeeded);
    assert_eq!(
        rt.auth_check(&(), Some(&plain), Some("opensesame")),
        AuthOutcome::SucceededWithParameter
    );
    assert_eq!(rt.auth_check(&(), Some(&plain), Some("OpenSesame")), AuthOutcome::Failed);
    assert_eq!(rt.auth_check(&(), Some(&plain), None), AuthOutcome::Failed);
}

#[test]
fn test_certificate_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["auth_clientcertfp"], vec![]);
    rt.start().unwrap();

    let der = b"not really DER but hashed all the same";
    let stored = certfp::fingerprint(der, true).to_uppercase();
    let data = AuthData::with_method(stored, "sslclientcertfp");

    let client = CertificateClient(der);
    assert_eq!(
        rt.auth_check(&client, Some(&data), Some("")),
        AuthOutcome::SucceededWithParameter
    );
    assert_eq!(rt.auth_check(&(), Some(&data), Some("")), AuthOutcome::Failed);
    let other = CertificateClient(b"someone else");
    assert_eq!(rt.auth_check(&other, Some(&data), Some("")), AuthOutcome::Failed);
}

#[test]
fn test_check_fails_once_backend_is_unloaded() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["auth_unreal_sha1"], vec![]);
    rt.start().unwrap();

    let data = AuthData::with_method(rt.make_auth("sha1", "pw").unwrap(), "sha1");
    assert!(rt.auth_check(&(), Some(&data), Some("pw")).is_success());

    rt.unload("auth_unreal_sha1").unwrap();
    assert!(rt.registries().auth.lookup("sha1").is_none());
    assert_eq!(rt.auth_check(&(), Some(&data), Some("pw")), AuthOutcome::Failed);
}

#[test]
fn test_configured_blocks_are_checked_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let good = bcrypt::hash("pw", 4).unwrap();
    let blocks = vec![
        block("oper-good", &good, &["crypt"]),
        block("oper-plain", "short", &[]),
        block("oper-salty", "x", &["crypt"]),
        block("oper-unknown", "pw", &["sha1"]),
        block("oper-greedy", "pw", &["crypt", "md5"]),
        block("oper-long", &"p".repeat(49), &[]),
        AuthConfig {
            name: "oper-empty".into(),
            password: None,
            methods: vec![],
        },
    ];
    let mut rt = runtime(&dir, &["auth_crypt"], blocks);

    let failures = rt.start().unwrap();
    let messages: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    assert_eq!(failures.len(), 5, "{:?}", messages);
    assert!(failures.iter().all(|e| matches!(e, Error::Auth(_))));

    let find = |name: &str| {
        messages
            .iter()
            .find(|m| m.contains(name))
            .cloned()
            .unwrap_or_default()
    };
    assert!(find("oper-salty").contains("crypt strings will always be >2 in length"));
    assert!(find("oper-unknown").contains("sha1 is not an implemented/enabled authentication method"));
    assert!(find("oper-greedy").contains("multiple authentication methods"));
    assert!(find("oper-long").contains("may not exceed 48"));
    assert!(find("oper-empty").contains("missing parameter"));
    assert!(find("oper-good").is_empty());
    assert!(find("oper-plain").is_empty());
}

fn pem(der: &[u8]) -> String {
    use base64::Engine;
    format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        base64::engine::general_purpose::STANDARD.encode(der)
    )
}

#[test]
fn test_client_certificate_file() {
    let dir = tempfile::tempdir().unwrap();
    let der = b"0\x82\x02\x10oper certificate";
    let cert = dir.path().join("oper.pem");
    std::fs::write(&cert, pem(der)).unwrap();
    let broken = dir.path().join("broken.pem");
    std::fs::write(&broken, "-----BEGIN NOTHING-----\n").unwrap();
    let path = |p: &std::path::Path| p.to_string_lossy().into_owned();

    let blocks = vec![
        block("oper-cert", &path(&cert), &["sslclientcert"]),
        block("oper-missing", &path(&dir.path().join("gone.pem")), &["sslclientcert"]),
        block("oper-broken", &path(&broken), &["sslclientcert"]),
    ];
    let mut rt = runtime(&dir, &["auth_clientcert"], blocks);
    let failures = rt.start().unwrap();
    let messages: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    assert_eq!(failures.len(), 2, "{:?}", messages);
    assert!(messages.iter().any(|m| m.contains("oper-missing") && m.contains("error opening file")));
    assert!(messages.iter().any(|m| m.contains("oper-broken") && m.contains("format error")));

    let data = AuthData::with_method(path(&cert), "sslclientcert");
    assert_eq!(
        rt.auth_check(&CertificateClient(der), Some(&data), Some("")),
        AuthOutcome::SucceededWithParameter
    );
    assert_eq!(
        rt.auth_check(&CertificateClient(b"impostor"), Some(&data), Some("")),
        AuthOutcome::Failed
    );
    assert_eq!(rt.auth_check(&(), Some(&data), Some("")), AuthOutcome::Failed);
}

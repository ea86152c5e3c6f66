//! Authentication and key management tests
//!
//! NIST 800-53: IA-2 (Authentication), AC-7 (Unsuccessful Logon Attempts), IA-5 (Authenticator Management)
//! STIG: V-222611, V-222578
//! Implementation: Tests for authorized key loading and the per-connection attempt cap

use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use snow_owl_sshd::auth::{AuthDecision, AuthState, Authenticator};
use snow_owl_sshd::keys::{parse_authorized_keys, KeyStore};
use snow_owl_sshd::Error;
use std::sync::Arc;

fn random_key() -> PrivateKey {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap()
}

fn openssh_line(key: &PublicKey, comment: &str) -> String {
    format!("{} {comment}", key.to_openssh().unwrap())
}

/// NIST 800-53: IA-2 - Loaded keys authorize, others do not
#[test]
fn test_keystore_authorizes_loaded_keys_only() {
    let allowed = random_key();
    let other = random_key();

    let mut store = KeyStore::new();
    let text = format!("{}\n", openssh_line(allowed.public_key(), "alice@example"));
    assert_eq!(store.load_authorized_keys(text.as_bytes()).unwrap(), 1);

    assert!(store.is_authorized(allowed.public_key()));
    assert!(!store.is_authorized(other.public_key()));
    assert_eq!(store.authorized_count(), 1);
}

/// NIST 800-53: IA-5 - Loading is cumulative across calls
#[test]
fn test_keystore_load_is_cumulative() {
    let first = random_key();
    let second = random_key();

    let mut store = KeyStore::new();
    store
        .load_authorized_keys(openssh_line(first.public_key(), "a").as_bytes())
        .unwrap();
    store
        .load_authorized_keys(openssh_line(second.public_key(), "b").as_bytes())
        .unwrap();

    assert!(store.is_authorized(first.public_key()));
    assert!(store.is_authorized(second.public_key()));
    assert_eq!(store.authorized_count(), 2);
}

/// STIG: V-222611 - Comments, blank lines and garbage are skipped
#[test]
fn test_authorized_keys_skips_bad_lines() {
    let key = random_key();
    let text = format!(
        "# team keys\n\nnot-a-key-type AAAA\nssh-ed25519 !!!notbase64!!!\n{}\n",
        openssh_line(key.public_key(), "deploy")
    );

    let parsed = parse_authorized_keys(&text);
    assert_eq!(parsed.keys.len(), 1);
    assert_eq!(parsed.skipped, 2);
    assert_eq!(parsed.keys[0].comment.as_deref(), Some("deploy"));
}

/// STIG: V-222611 - Leading key options are honored
#[test]
fn test_authorized_keys_options() {
    let key = random_key();
    let text = format!(
        "no-pty,no-port-forwarding {}\n",
        openssh_line(key.public_key(), "restricted")
    );

    let mut store = KeyStore::new();
    assert_eq!(store.load_authorized_keys(text.as_bytes()).unwrap(), 1);

    let entry = store.authorized_entry(key.public_key()).unwrap();
    assert!(entry.options.no_pty);
    assert!(entry.options.no_port_forwarding);
}

/// NIST 800-53: SI-10 - Non UTF-8 input is refused
#[test]
fn test_authorized_keys_rejects_binary_input() {
    let mut store = KeyStore::new();
    let result = store.load_authorized_keys(&[0xff, 0xfe, 0x00, 0x80]);
    assert!(matches!(result, Err(Error::KeyParse(_))));
    assert_eq!(store.authorized_count(), 0);
}

/// NIST 800-53: IA-5 - A serialized host key loads and keeps its public half
#[test]
fn test_host_identity_round_trip() {
    let key = random_key();
    let pem = key.to_openssh(LineEnding::LF).unwrap();

    let mut store = KeyStore::new();
    store.set_host_identity(pem.as_bytes()).unwrap();

    assert!(store.has_host_identity());
    assert_eq!(store.host_public_keys(), vec![key.public_key().clone()]);
}

/// NIST 800-53: IA-5 - Unusable host key material is an error
#[test]
fn test_host_identity_rejects_garbage() {
    let mut store = KeyStore::new();
    let result = store.set_host_identity(b"-----BEGIN NOTHING-----\nAAAA\n-----END NOTHING-----\n");
    assert!(matches!(result, Err(Error::KeyParse(_))));
    assert!(!store.has_host_identity());
}

/// NIST 800-53: SC-12 - Generated identities are distinct
#[test]
fn test_random_identities_differ() {
    let mut first = KeyStore::new();
    let mut second = KeyStore::new();
    first.generate_random_identity().unwrap();
    second.generate_random_identity().unwrap();

    assert_eq!(first.host_keys().len(), 1);
    assert_ne!(first.host_public_keys(), second.host_public_keys());
}

/// NIST 800-53: AC-7 - Unknown keys exhaust the cap, then even a valid key is refused
#[test]
fn test_attempt_cap_disconnects() {
    let allowed = random_key();
    let mut store = KeyStore::new();
    store
        .load_authorized_keys(openssh_line(allowed.public_key(), "ok").as_bytes())
        .unwrap();

    let mut auth = Authenticator::new(Arc::new(store), 3);
    for _ in 0..3 {
        let stranger = random_key();
        assert_eq!(
            auth.verify("bob", stranger.public_key()),
            AuthDecision::Reject
        );
    }

    assert_eq!(
        auth.offer("bob", allowed.public_key()),
        AuthDecision::Disconnect
    );
    assert_eq!(auth.state(), AuthState::TooManyAttempts);
}

/// NIST 800-53: IA-2 - Offer then signature for the same key is one attempt
#[test]
fn test_offer_and_signature_share_an_attempt() {
    let allowed = random_key();
    let mut store = KeyStore::new();
    store
        .load_authorized_keys(openssh_line(allowed.public_key(), "ok").as_bytes())
        .unwrap();

    let mut auth = Authenticator::new(Arc::new(store), 1);
    assert_eq!(auth.offer("alice", allowed.public_key()), AuthDecision::Accept);
    assert_eq!(auth.verify("alice", allowed.public_key()), AuthDecision::Accept);
    assert_eq!(auth.attempts(), 1);
    assert_eq!(auth.state(), AuthState::Authenticated);
}

//! Authentication Module
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-7 (Unsuccessful Logon Attempts)
//! STIG: V-222578 - Implement replay-resistant authentication mechanisms
//! Implementation: Per-connection public key authentication state machine.
//!
//! The transport asks twice for a key that ends up accepted: once for the bare public
//! key (an unsigned offer) and once after the signature over the exchange hash has been
//! verified. Only an authorized key is ever invited to sign, so probing for key
//! existence gains nothing without the matching private key.

use crate::keys::{KeyOptions, KeyStore};
use russh::keys::PublicKey;
use russh::keys::ssh_key::HashAlg;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a connection is in the authentication exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No key offered yet
    Start,
    /// A key was offered and is awaiting a verdict or signature
    KeyOffered,
    /// The last offered key was rejected; the client may try another
    Rejected,
    /// Authentication succeeded
    Authenticated,
    /// The attempt cap was exceeded; the connection must close
    TooManyAttempts,
}

/// Verdict for one authentication step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Key is authorized; ask for (or accept) the signature
    Accept,
    /// Key is not authorized; the client may retry with another key
    Reject,
    /// Attempt cap exceeded; close the connection
    Disconnect,
}

/// Per-connection public key authenticator
///
/// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
/// Implementation: Each distinct key offer consumes one attempt; the attempt after
/// the cap is answered with [`AuthDecision::Disconnect`] regardless of key validity.
#[derive(Debug)]
pub struct Authenticator {
    keys: Arc<KeyStore>,
    max_attempts: u32,
    attempts: u32,
    state: AuthState,
    /// Fingerprint of the key whose unsigned offer was just answered
    pending: Option<String>,
    options: Option<KeyOptions>,
}

impl Authenticator {
    /// Create an authenticator for one connection
    pub fn new(keys: Arc<KeyStore>, max_attempts: u32) -> Self {
        Self {
            keys,
            max_attempts,
            attempts: 0,
            state: AuthState::Start,
            pending: None,
            options: None,
        }
    }

    /// Current state
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Attempts consumed so far
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Options of the key that authenticated the connection
    pub const fn granted_options(&self) -> Option<&KeyOptions> {
        self.options.as_ref()
    }

    /// A public key was offered without a signature
    ///
    /// # NIST 800-53: IA-2, AC-7
    pub fn offer(&mut self, user: &str, key: &PublicKey) -> AuthDecision {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        if let Some(decision) = self.consume_attempt(user, &fingerprint) {
            return decision;
        }

        self.state = AuthState::KeyOffered;

        if self.keys.is_authorized(key) {
            debug!(user, fingerprint = %fingerprint, "Offered key is authorized, requesting signature");
            self.pending = Some(fingerprint);
            AuthDecision::Accept
        } else {
            self.reject(user, &fingerprint)
        }
    }

    /// A signature by `key` over the exchange hash has been verified
    ///
    /// A signed request for the key whose unsigned offer was just answered does not consume a
    /// second attempt; a signed request without an offer does.
    ///
    /// # NIST 800-53: IA-2 (Identification and Authentication)
    /// # STIG: V-222578
    pub fn verify(&mut self, user: &str, key: &PublicKey) -> AuthDecision {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        if self.pending.as_deref() != Some(fingerprint.as_str()) {
            if let Some(decision) = self.consume_attempt(user, &fingerprint) {
                return decision;
            }
        }
        self.pending = None;

        match self.keys.authorized_entry(key) {
            Some(entry) => {
                info!(
                    event = "auth_success",
                    user,
                    fingerprint = %fingerprint,
                    attempts = self.attempts,
                    "Public key authentication succeeded"
                );
                self.options = Some(entry.options.clone());
                self.state = AuthState::Authenticated;
                AuthDecision::Accept
            }
            None => self.reject(user, &fingerprint),
        }
    }

    /// A non-publickey method was tried; rejected without consuming an attempt
    pub fn reject_method(&self, user: &str, method: &str) -> AuthDecision {
        debug!(user, method, "Rejecting unsupported authentication method");
        if self.state == AuthState::TooManyAttempts {
            AuthDecision::Disconnect
        } else {
            AuthDecision::Reject
        }
    }

    fn consume_attempt(&mut self, user: &str, fingerprint: &str) -> Option<AuthDecision> {
        if self.state == AuthState::TooManyAttempts || self.attempts >= self.max_attempts {
            warn!(
                event = "auth_attempts_exceeded",
                user,
                fingerprint,
                max_attempts = self.max_attempts,
                "Authentication attempt cap exceeded, closing connection"
            );
            self.state = AuthState::TooManyAttempts;
            self.pending = None;
            return Some(AuthDecision::Disconnect);
        }

        self.attempts += 1;
        None
    }

    fn reject(&mut self, user: &str, fingerprint: &str) -> AuthDecision {
        // NIST 800-53: AU-2 (Audit Events) - Log failed authentication
        warn!(
            event = "auth_failure",
            user,
            fingerprint,
            attempt = self.attempts,
            max_attempts = self.max_attempts,
            "Public key not authorized"
        );
        self.pending = None;
        self.state = AuthState::Rejected;
        AuthDecision::Reject
    }
}

//! Key Store Module
//!
//! NIST 800-53: AC-2 (Account Management), IA-2 (Identification and Authentication),
//! IA-5 (Authenticator Management), SC-12 (Cryptographic Key Establishment)
//! STIG: V-222611 - Certificate validation
//! Implementation: Holds the server host identities and the authorized client key set.
//! Key material arrives as raw bytes; this module never touches the filesystem.

use crate::{Error, Result};
use russh::keys::ssh_key::{Algorithm, HashAlg};
use russh::keys::{PrivateKey, PublicKey};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Options recognized on an authorized_keys line
///
/// NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege)
/// Implementation: Every option is either enforced or has nothing to restrict here
/// (agent and X11 forwarding are never offered). A line carrying any other option is
/// refused rather than granting more than it says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOptions {
    /// `no-pty`: refuse PTY allocation
    pub no_pty: bool,
    /// `no-port-forwarding`: refuse direct-tcpip channels
    pub no_port_forwarding: bool,
    /// `command="..."`: run this instead of whatever the client asks for
    pub command: Option<String>,
    /// All options as written, in order
    pub raw: Vec<String>,
}

impl KeyOptions {
    /// Parse the comma-separated options field
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyParse`] for an option that cannot be enforced
    pub fn parse(field: &str) -> Result<Self> {
        let mut options = Self::default();

        for option in split_respecting_quotes(field, ',') {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name.to_ascii_lowercase(), Some(value)),
                None => (option.to_ascii_lowercase(), None),
            };

            match (name.as_str(), value) {
                ("no-pty", None) => options.no_pty = true,
                ("pty", None) => options.no_pty = false,
                ("no-port-forwarding", None) => options.no_port_forwarding = true,
                ("port-forwarding", None) => options.no_port_forwarding = false,
                ("restrict", None) => {
                    options.no_pty = true;
                    options.no_port_forwarding = true;
                }
                ("no-agent-forwarding" | "no-x11-forwarding" | "no-user-rc", None) => {}
                ("command", Some(value)) => options.command = Some(unquote(value)?),
                _ => {
                    return Err(Error::KeyParse(format!("unsupported key option {option}")));
                }
            }
            options.raw.push(option);
        }

        Ok(options)
    }
}

/// Strip the surrounding double quotes of an option value; only `\"` is an escape
fn unquote(value: &str) -> Result<String> {
    let inner = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| Error::KeyParse(format!("option value must be quoted: {value}")))?;
    Ok(inner.replace("\\\"", "\""))
}

/// A single authorized client key
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    /// The public key material
    pub key: PublicKey,
    /// SHA-256 fingerprint, `SHA256:<base64>`
    pub fingerprint: String,
    /// Parsed line options
    pub options: KeyOptions,
    /// Trailing comment, if any
    pub comment: Option<String>,
}

/// Result of parsing authorized_keys text
#[derive(Debug, Default)]
pub struct ParsedAuthorizedKeys {
    /// Keys that parsed successfully
    pub keys: Vec<AuthorizedKey>,
    /// Non-blank, non-comment lines that could not be parsed
    pub skipped: usize,
}

/// Immutable-after-load set of authorized client keys, keyed by fingerprint
///
/// NIST 800-53: AC-3 (Access Enforcement)
/// Implementation: An empty set authorizes nothing
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeySet {
    entries: HashMap<String, AuthorizedKey>,
}

impl AuthorizedKeySet {
    /// Number of distinct keys in the set
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: AuthorizedKey) {
        self.entries.insert(entry.fingerprint.clone(), entry);
    }

    /// Look up the entry matching `key` exactly
    ///
    /// # NIST 800-53: IA-2 (Identification and Authentication)
    /// # Implementation: Fingerprint lookup followed by a full key-material comparison
    pub fn get(&self, key: &PublicKey) -> Option<&AuthorizedKey> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        self.entries
            .get(&fingerprint)
            .filter(|entry| entry.key.key_data() == key.key_data())
    }

    /// Whether `key` is in the set
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.get(key).is_some()
    }
}

/// Server key material: host identities plus authorized client keys
///
/// Mutated only before the server starts listening; afterwards it is frozen behind an
/// `Arc` and read concurrently by every connection.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    host_keys: Vec<PrivateKey>,
    authorized: AuthorizedKeySet,
}

impl KeyStore {
    /// Create an empty key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host identity from a serialized private key (OpenSSH or PEM)
    ///
    /// A key of the same algorithm as an existing identity replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyParse`] if the bytes are not a supported, unencrypted private key
    ///
    /// # NIST 800-53: IA-5 (Authenticator Management)
    pub fn set_host_identity(&mut self, raw: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::KeyParse("host key is not valid UTF-8".into()))?;

        let key = russh::keys::decode_secret_key(text.trim(), None)
            .map_err(|e| Error::KeyParse(format!("failed to decode host key: {e}")))?;

        self.add_host_key(key);
        Ok(())
    }

    /// Generate a fresh in-memory Ed25519 host identity
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyGen`] if the OS random source fails
    ///
    /// # NIST 800-53: SC-12 (Cryptographic Key Establishment)
    /// # Implementation: Keys come from the operating system CSPRNG and are never persisted
    pub fn generate_random_identity(&mut self) -> Result<()> {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| Error::KeyGen(e.to_string()))?;

        info!(
            event = "host_key_generated",
            fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
            "Generated ephemeral Ed25519 host key"
        );

        self.add_host_key(key);
        Ok(())
    }

    fn add_host_key(&mut self, key: PrivateKey) {
        let algorithm = key.algorithm();
        if let Some(slot) = self
            .host_keys
            .iter_mut()
            .find(|existing| existing.algorithm() == algorithm)
        {
            debug!("Replacing existing {} host key", algorithm.as_str());
            *slot = key;
        } else {
            self.host_keys.push(key);
        }
    }

    /// Load authorized keys from authorized_keys formatted text
    ///
    /// # Returns
    ///
    /// The number of keys loaded from this input
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyParse`] only if the input is not UTF-8; bad lines are skipped
    ///
    /// # NIST 800-53: AC-2 (Account Management)
    /// # STIG: V-222611
    pub fn load_authorized_keys(&mut self, raw: &[u8]) -> Result<usize> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::KeyParse("authorized keys are not valid UTF-8".into()))?;

        let parsed = parse_authorized_keys(text);
        let loaded = parsed.keys.len();

        for entry in parsed.keys {
            self.authorized.insert(entry);
        }

        info!(
            event = "authorized_keys_loaded",
            loaded,
            skipped = parsed.skipped,
            total = self.authorized.len(),
            "Loaded authorized keys"
        );

        Ok(loaded)
    }

    /// Whether `key` exactly matches an authorized key
    ///
    /// # NIST 800-53: AC-3 (Access Enforcement), IA-2
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.authorized.contains(key)
    }

    /// The authorized entry for `key`, including its options
    pub fn authorized_entry(&self, key: &PublicKey) -> Option<&AuthorizedKey> {
        self.authorized.get(key)
    }

    /// Number of authorized keys
    pub fn authorized_count(&self) -> usize {
        self.authorized.len()
    }

    /// Host identities offered during the handshake
    pub fn host_keys(&self) -> &[PrivateKey] {
        &self.host_keys
    }

    /// Public halves of the host identities
    pub fn host_public_keys(&self) -> Vec<PublicKey> {
        self.host_keys
            .iter()
            .map(|key| key.public_key().clone())
            .collect()
    }

    /// Whether at least one host identity is configured
    pub fn has_host_identity(&self) -> bool {
        !self.host_keys.is_empty()
    }
}

/// Parse authorized_keys text
///
/// Format per line: `[options] <key-type> <base64-key> [comment]`. Blank lines and
/// `#` comments are ignored; lines that fail to parse are counted in `skipped`.
///
/// # NIST 800-53: SI-10 (Information Input Validation)
/// # STIG: V-222396 - Input validation
pub fn parse_authorized_keys(text: &str) -> ParsedAuthorizedKeys {
    let mut parsed = ParsedAuthorizedKeys::default();

    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match parse_key_line(trimmed) {
            Ok(entry) => {
                debug!(
                    line = index + 1,
                    fingerprint = %entry.fingerprint,
                    "Parsed authorized key"
                );
                parsed.keys.push(entry);
            }
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed authorized key line");
                parsed.skipped += 1;
            }
        }
    }

    parsed
}

fn parse_key_line(line: &str) -> Result<AuthorizedKey> {
    let tokens = split_respecting_quotes(line, ' ');

    let type_index = tokens
        .iter()
        .position(|token| is_key_type(token))
        .ok_or_else(|| Error::KeyParse("no recognized key type".into()))?;

    // Options, when present, are a single comma-separated field before the key type
    let options = match type_index {
        0 => KeyOptions::default(),
        1 => KeyOptions::parse(&tokens[0])?,
        _ => return Err(Error::KeyParse("unexpected fields before key type".into())),
    };

    let key_type = &tokens[type_index];
    let blob = tokens
        .get(type_index + 1)
        .ok_or_else(|| Error::KeyParse("missing base64 key data".into()))?;

    let key = PublicKey::from_openssh(&format!("{key_type} {blob}"))
        .map_err(|e| Error::KeyParse(format!("invalid public key: {e}")))?;

    let comment = tokens
        .get(type_index + 2..)
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.join(" "));

    Ok(AuthorizedKey {
        fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        key,
        options,
        comment,
    })
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-")
        || token.starts_with("ecdsa-sha2-")
        || token.starts_with("sk-ssh-")
        || token.starts_with("sk-ecdsa-sha2-")
}

/// Split on `separator` outside of double quotes, dropping empty pieces
fn split_respecting_quotes(input: &str, separator: char) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c == separator && !in_quotes => {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
            }
            c if separator == ' ' && c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::LineEnding;

    fn random_key() -> PrivateKey {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap()
    }

    fn openssh_line(key: &PrivateKey) -> String {
        key.public_key().to_openssh().unwrap()
    }

    #[test]
    fn test_empty_set_authorizes_nothing() {
        let store = KeyStore::new();
        let key = random_key();
        assert!(!store.is_authorized(key.public_key()));
        assert_eq!(store.authorized_count(), 0);
    }

    #[test]
    fn test_loaded_keys_are_authorized() {
        let alice = random_key();
        let bob = random_key();
        let mallory = random_key();

        let text = format!(
            "# team keys\n{} alice@example\n\n{}\n",
            openssh_line(&alice),
            openssh_line(&bob)
        );

        let mut store = KeyStore::new();
        assert_eq!(store.load_authorized_keys(text.as_bytes()).unwrap(), 2);

        assert!(store.is_authorized(alice.public_key()));
        assert!(store.is_authorized(bob.public_key()));
        assert!(!store.is_authorized(mallory.public_key()));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let alice = random_key();
        let text = format!(
            "garbage\nssh-ed25519 not-base64!!\n{}\nssh-rsa\n",
            openssh_line(&alice)
        );

        let parsed = parse_authorized_keys(&text);
        assert_eq!(parsed.keys.len(), 1);
        assert_eq!(parsed.skipped, 3);
    }

    #[test]
    fn test_unparsable_input_loads_zero_without_error() {
        let mut store = KeyStore::new();
        let loaded = store.load_authorized_keys(b"not a key\nstill not a key\n").unwrap();
        assert_eq!(loaded, 0);
    }

    #[test]
    fn test_non_utf8_input_is_an_error() {
        let mut store = KeyStore::new();
        let result = store.load_authorized_keys(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(Error::KeyParse(_))));
    }

    #[test]
    fn test_options_and_comment_are_parsed() {
        let alice = random_key();
        let line = format!(
            "no-pty,command=\"echo a, b\",no-port-forwarding {} alice laptop",
            openssh_line(&alice)
        );

        let parsed = parse_authorized_keys(&line);
        assert_eq!(parsed.skipped, 0);

        let entry = &parsed.keys[0];
        assert!(entry.options.no_pty);
        assert!(entry.options.no_port_forwarding);
        assert_eq!(entry.options.command.as_deref(), Some("echo a, b"));
        assert_eq!(entry.options.raw.len(), 3);
        assert_eq!(entry.options.raw[1], "command=\"echo a, b\"");
        assert_eq!(entry.comment.as_deref(), Some("alice laptop"));
    }

    #[test]
    fn test_restrict_option_implies_both_restrictions() {
        let alice = random_key();
        let line = format!("restrict {}", openssh_line(&alice));

        let parsed = parse_authorized_keys(&line);
        let options = &parsed.keys[0].options;
        assert!(options.no_pty);
        assert!(options.no_port_forwarding);

        let options = KeyOptions::parse("restrict,pty").unwrap();
        assert!(!options.no_pty);
        assert!(options.no_port_forwarding);
    }

    #[test]
    fn test_forced_command_is_unquoted() {
        let options = KeyOptions::parse(r#"command="printf '%s' \"$X\"",no-user-rc"#).unwrap();
        assert_eq!(options.command.as_deref(), Some(r#"printf '%s' "$X""#));
        assert!(!options.no_pty);

        assert!(KeyOptions::parse("command=ls").is_err());
        assert!(KeyOptions::parse("command=\"").is_err());
    }

    /// NIST 800-53: AC-3 - Options that cannot be enforced refuse the whole line
    #[test]
    fn test_unenforceable_options_skip_the_line() {
        let alice = random_key();
        let bob = random_key();
        let text = format!(
            "from=\"10.0.0.0/8\" {}\npermitopen=\"db:5432\",no-pty {}\n",
            openssh_line(&alice),
            openssh_line(&bob)
        );

        let parsed = parse_authorized_keys(&text);
        assert!(parsed.keys.is_empty());
        assert_eq!(parsed.skipped, 2);

        for option in ["environment=\"A=b\"", "cert-authority", "tunnel=\"1\"", "frobnicate"] {
            assert!(KeyOptions::parse(option).is_err(), "{option}");
        }
    }

    #[test]
    fn test_host_identity_round_trip() {
        let key = random_key();
        let pem = key.to_openssh(LineEnding::LF).unwrap();

        let mut store = KeyStore::new();
        store.set_host_identity(pem.as_bytes()).unwrap();

        let served = store.host_public_keys();
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].key_data(), key.public_key().key_data());
    }

    #[test]
    fn test_same_algorithm_replaces_identity() {
        let mut store = KeyStore::new();
        store.generate_random_identity().unwrap();
        let first = store.host_public_keys();

        store.generate_random_identity().unwrap();
        let second = store.host_public_keys();

        assert_eq!(second.len(), 1);
        assert_ne!(first[0].key_data(), second[0].key_data());
    }

    #[test]
    fn test_invalid_host_key_rejected() {
        let mut store = KeyStore::new();
        let result = store.set_host_identity(b"-----BEGIN NOTHING-----\n");
        assert!(matches!(result, Err(Error::KeyParse(_))));
        assert!(!store.has_host_identity());
    }
}

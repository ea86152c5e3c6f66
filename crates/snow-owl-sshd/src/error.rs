//! Error types for the SSH daemon
//!
//! NIST 800-53: SI-11 (Error Handling), AU-3 (Content of Audit Records)
//! STIG: V-222566 - The application must generate error messages that provide information
//! necessary for corrective actions without revealing information that could be exploited
//! Implementation: Errors are scoped to the layer that produced them (channel, connection,
//! listener) and carry enough detail for the operator log, never for the remote peer

use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, Error>;

/// SSH daemon error types
///
/// NIST 800-53: SI-11 (Error Handling)
/// STIG: V-222566
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error reported by the transport
    ///
    /// NIST 800-53: SI-11, SC-8 (Transmission Confidentiality)
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Key material could not be parsed
    ///
    /// Fatal to startup for host keys, skipped per line for authorized keys.
    #[error("Key parse error: {0}")]
    KeyParse(String),

    /// Host key generation failed
    #[error("Key generation error: {0}")]
    KeyGen(String),

    /// Transport handshake failed (key exchange, version exchange, host key proof)
    ///
    /// NIST 800-53: SC-8, SI-11
    /// Implementation: Fatal to a single connection only
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The per-connection authentication attempt cap was exceeded
    ///
    /// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    #[error("Too many authentication attempts ({0})")]
    TooManyAuthAttempts(u32),

    /// A channel-level request could not be honored
    ///
    /// Implementation: Answered with a failure reply, never escapes the channel
    #[error("Channel request failed: {0}")]
    ChannelRequest(String),

    /// The listener itself failed; fatal to the whole server
    #[error("Listener error: {0}")]
    Listener(String),

    /// A transient accept failure; logged and retried
    #[error("Accept error: {0}")]
    Accept(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key material was changed after the server started listening
    #[error("Server already started; key material is frozen")]
    AlreadyStarted,

    /// The server refuses to listen without any authorized key
    ///
    /// NIST 800-53: AC-3 (Access Enforcement)
    #[error("No authorized keys configured")]
    NoAuthorizedKeys,
}

impl Error {
    /// Check if error is recoverable
    ///
    /// # Returns
    ///
    /// `true` if the failing operation may be retried without operator action
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Accept(_) | Self::ChannelRequest(_))
    }

    /// Check if error is security-related
    ///
    /// # NIST 800-53: AU-2 (Audit Events), SI-11
    /// # STIG: V-222566
    pub const fn is_security_event(&self) -> bool {
        matches!(self, Self::TooManyAuthAttempts(_) | Self::Handshake(_))
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Self::KeyParse(err.to_string())
    }
}

impl Error {
    /// Create channel request error with context
    pub fn channel_request(context: impl Into<String>) -> Self {
        Self::ChannelRequest(context.into())
    }

    /// Create handshake error
    pub fn handshake(context: impl Into<String>) -> Self {
        Self::Handshake(context.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_recoverable() {
        assert!(Error::Accept("emfile".into()).is_recoverable());
        assert!(Error::channel_request("pty").is_recoverable());
        assert!(!Error::Listener("gone".into()).is_recoverable());
        assert!(!Error::Handshake("kex".into()).is_recoverable());
    }

    #[test]
    fn test_is_security_event() {
        assert!(Error::handshake("bad banner").is_security_event());
        assert!(Error::TooManyAuthAttempts(3).is_security_event());
        assert!(!Error::Io(std::io::Error::from(std::io::ErrorKind::Other)).is_security_event());
    }
}

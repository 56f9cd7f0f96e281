//! Login Credentials and SASL
//!
//! The client authenticates during `connection.start-ok` with one of the
//! mechanisms the server advertised. Only `PLAIN` is spoken here; its
//! response is the NUL-framed `\0user\0password` byte string.

use crate::error::{Error, Result};

/// The SASL mechanism used for `start-ok`.
pub const MECHANISM_PLAIN: &str = "PLAIN";

/// A username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials { user: user.into(), password: password.into() }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The SASL PLAIN response: NUL, user, NUL, password.
    pub fn plain_response(&self) -> Vec<u8> {
        let mut response = Vec::with_capacity(2 + self.user.len() + self.password.len());
        response.push(0);
        response.extend_from_slice(self.user.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        response
    }

    /// Pick a mechanism from the server's space-separated list.
    pub fn select_mechanism(&self, offered: &[u8]) -> Result<&'static str> {
        let offered = String::from_utf8_lossy(offered);
        if offered.split(' ').any(|m| m == MECHANISM_PLAIN) {
            Ok(MECHANISM_PLAIN)
        } else {
            Err(Error::protocol(format!(
                "server offers no supported SASL mechanism (got: {})",
                offered
            )))
        }
    }
}

impl Default for Credentials {
    /// The conventional broker default account.
    fn default() -> Self {
        Credentials::new("guest", "guest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_credentials() {
        let credentials = Credentials::default();
        assert_eq!(credentials.user(), "guest");
        assert_eq!(credentials.plain_response(), b"\0guest\0guest");
    }

    #[test]
    fn test_plain_response_framing() {
        let credentials = Credentials::new("alice", "s3cret");
        assert_eq!(credentials.plain_response(), b"\0alice\0s3cret");
    }

    #[test]
    fn test_mechanism_selection() {
        let credentials = Credentials::default();
        assert_eq!(
            credentials.select_mechanism(b"PLAIN AMQPLAIN").unwrap(),
            "PLAIN"
        );
        assert_eq!(
            credentials.select_mechanism(b"AMQPLAIN PLAIN").unwrap(),
            "PLAIN"
        );
        assert!(credentials.select_mechanism(b"EXTERNAL").is_err());
    }
}

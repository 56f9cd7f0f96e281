//! AMQP Address Parsing
//!
//! Parses `amqp[s]://[user[:password]@]host[:port][/vhost]` into its parts.
//! Defaults: user and password `guest`, port 5672 (`amqp`) or 5671
//! (`amqps`), vhost `/`. The vhost segment is percent-decoded, so a vhost
//! containing a literal `/` is written `%2F`.
//!
//! # Examples
//!
//! ```rust
//! use warren_amqp::uri::AmqpUri;
//!
//! let uri: AmqpUri = "amqp://alice:pw@broker.example:5673/prod".parse().unwrap();
//! assert_eq!(uri.host, "broker.example");
//! assert_eq!(uri.port, 5673);
//! assert_eq!(uri.vhost, "prod");
//! ```

use std::str::FromStr;

use crate::auth::Credentials;
use crate::error::{Error, Result};

/// Default port for `amqp`.
pub const PORT_AMQP: u16 = 5672;
/// Default port for `amqps`.
pub const PORT_AMQPS: u16 = 5671;

/// A parsed AMQP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpUri {
    /// Whether the scheme was `amqps`.
    pub tls: bool,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl AmqpUri {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.clone(), self.password.clone())
    }
}

impl Default for AmqpUri {
    fn default() -> Self {
        AmqpUri {
            tls: false,
            user: "guest".into(),
            password: "guest".into(),
            host: "localhost".into(),
            port: PORT_AMQP,
            vhost: "/".into(),
        }
    }
}

impl FromStr for AmqpUri {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = input.strip_prefix("amqps://") {
            (true, rest)
        } else if let Some(rest) = input.strip_prefix("amqp://") {
            (false, rest)
        } else {
            return Err(Error::usage(format!("address has no amqp:// scheme: {}", input)));
        };

        let mut uri = AmqpUri {
            tls,
            port: if tls { PORT_AMQPS } else { PORT_AMQP },
            ..AmqpUri::default()
        };

        // authority [/vhost]
        let (authority, vhost) = match rest.split_once('/') {
            Some((authority, vhost)) => (authority, Some(vhost)),
            None => (rest, None),
        };

        let hostport = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => {
                match userinfo.split_once(':') {
                    Some((user, password)) => {
                        uri.user = percent_decode(user)?;
                        uri.password = percent_decode(password)?;
                    }
                    None => {
                        uri.user = percent_decode(userinfo)?;
                    }
                }
                hostport
            }
            None => authority,
        };

        match hostport.rsplit_once(':') {
            Some((host, port)) => {
                uri.host = host.to_string();
                uri.port = port
                    .parse()
                    .map_err(|_| Error::usage(format!("invalid port: {}", port)))?;
            }
            None => {
                uri.host = hostport.to_string();
            }
        }
        if uri.host.is_empty() {
            return Err(Error::usage("address has an empty host"));
        }

        if let Some(vhost) = vhost {
            if !vhost.is_empty() {
                uri.vhost = percent_decode(vhost)?;
            }
        }

        Ok(uri)
    }
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::usage(format!("truncated percent escape in {}", input)))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::usage(format!("bad percent escape %{} in {}", hex, input)))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::usage(format!("address is not valid UTF-8: {}", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host() {
        let uri: AmqpUri = "amqp://broker".parse().unwrap();
        assert_eq!(uri.host, "broker");
        assert_eq!(uri.port, PORT_AMQP);
        assert_eq!(uri.user, "guest");
        assert_eq!(uri.password, "guest");
        assert_eq!(uri.vhost, "/");
        assert!(!uri.tls);
    }

    #[test]
    fn test_amqps_changes_default_port() {
        let uri: AmqpUri = "amqps://broker".parse().unwrap();
        assert!(uri.tls);
        assert_eq!(uri.port, PORT_AMQPS);
    }

    #[test]
    fn test_full_address() {
        let uri: AmqpUri = "amqp://alice:pw@broker.example:5673/prod".parse().unwrap();
        assert_eq!(uri.user, "alice");
        assert_eq!(uri.password, "pw");
        assert_eq!(uri.host, "broker.example");
        assert_eq!(uri.port, 5673);
        assert_eq!(uri.vhost, "prod");
    }

    #[test]
    fn test_user_without_password() {
        let uri: AmqpUri = "amqp://alice@broker".parse().unwrap();
        assert_eq!(uri.user, "alice");
        assert_eq!(uri.password, "guest");
    }

    #[test]
    fn test_percent_decoded_vhost() {
        let uri: AmqpUri = "amqp://broker/%2Fstaging".parse().unwrap();
        assert_eq!(uri.vhost, "/staging");
    }

    #[test]
    fn test_trailing_slash_keeps_default_vhost() {
        let uri: AmqpUri = "amqp://broker/".parse().unwrap();
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!("http://broker".parse::<AmqpUri>().is_err());
        assert!("broker:5672".parse::<AmqpUri>().is_err());
    }

    #[test]
    fn test_rejects_bad_port_and_empty_host() {
        assert!("amqp://broker:70000".parse::<AmqpUri>().is_err());
        assert!("amqp://broker:abc".parse::<AmqpUri>().is_err());
        assert!("amqp://:5672".parse::<AmqpUri>().is_err());
    }

    #[test]
    fn test_credentials_accessor() {
        let uri: AmqpUri = "amqp://bob:pw@broker".parse().unwrap();
        assert_eq!(uri.credentials().plain_response(), b"\0bob\0pw");
    }
}

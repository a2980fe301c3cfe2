
use crate::error::*;

use std::fmt;

/// The kind of server described by a [`Url`].
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum SchemeType {
    /// The URL represents a STUN server.
    Stun,

    /// The URL represents a STUNS (secure) server.
    Stuns,

    Unknown,
}

impl Default for SchemeType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl From<&str> for SchemeType {
    fn from(raw: &str) -> Self {
        match raw {
            "stun" => Self::Stun,
            "stuns" => Self::Stuns,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SchemeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SchemeType::Stun => "stun",
            SchemeType::Stuns => "stuns",
            SchemeType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A STUN server URL following the ABNF syntax described in
/// [IETF rfc-7064](https://tools.ietf.org/html/rfc7064).
#[derive(Debug, Clone, Default)]
pub struct Url {
    pub scheme: SchemeType,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains("::") {
            "[".to_owned() + self.host.as_str() + "]"
        } else {
            self.host.clone()
        };
        write!(f, "{}:{}:{}", self.scheme, host, self.port)
    }
}

impl Url {
    /// Parses a `stun:` or `stuns:` URL. The port defaults to 3478 (5349 for
    /// `stuns:`) when absent.
    pub fn parse_url(raw: &str) -> Result<Self> {
        // The url crate would treat "stun:host" as an opaque path, so force an
        // authority component before handing it over.
        if raw.contains("//") {
            return Err(Error::ErrInvalidUrl);
        }

        let mut s = raw.to_string();
        if let Some(pos) = raw.find(':') {
            s.replace_range(pos..=pos, "://");
        } else {
            return Err(Error::ErrSchemeType);
        }

        let raw_parts = url::Url::parse(&s)?;

        let scheme: SchemeType = raw_parts.scheme().into();
        if scheme == SchemeType::Unknown {
            return Err(Error::ErrSchemeType);
        }

        let host = if let Some(host) = raw_parts.host_str() {
            host.trim()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_owned()
        } else {
            return Err(Error::ErrHost);
        };

        if raw_parts.query_pairs().count() > 0 {
            return Err(Error::ErrStunQuery);
        }

        let port = if let Some(port) = raw_parts.port() {
            port
        } else if scheme == SchemeType::Stun {
            3478
        } else {
            5349
        };

        Ok(Self { scheme, host, port })
    }

    /// Returns whether this URL's scheme describes a secure server.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.scheme == SchemeType::Stuns
    }
}

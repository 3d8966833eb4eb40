//! Network addresses (`user[:device]@server`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Server for individual accounts
pub const USER_SERVER: &str = "s.courier.net";
/// Server for groups
pub const GROUP_SERVER: &str = "g.courier.net";
/// The relay itself
pub const RELAY_SERVER: &str = "courier.net";
/// Broadcast lists and status
pub const BROADCAST_SERVER: &str = "broadcast";
/// Newsletter channels
pub const NEWSLETTER_SERVER: &str = "newsletter";

/// Address of an account, device, group or server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    /// Account part, empty for bare servers
    pub user: String,
    /// Device index for multi-device addresses
    pub device: Option<u16>,
    /// Server part
    pub server: String,
}

/// Error returned when a string is not a JID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid jid: {0}")]
pub struct JidParseError(pub String);

impl Jid {
    /// Account address on the user server.
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: None,
            server: USER_SERVER.to_string(),
        }
    }

    /// Device address on the user server.
    pub fn device(user: impl Into<String>, device: u16) -> Self {
        Self {
            user: user.into(),
            device: Some(device),
            server: USER_SERVER.to_string(),
        }
    }

    /// Group address.
    pub fn group(id: impl Into<String>) -> Self {
        Self {
            user: id.into(),
            device: None,
            server: GROUP_SERVER.to_string(),
        }
    }

    /// Bare server address.
    pub fn server(server: impl Into<String>) -> Self {
        Self {
            user: String::new(),
            device: None,
            server: server.into(),
        }
    }

    /// The relay's own address.
    #[must_use]
    pub fn relay() -> Self {
        Self::server(RELAY_SERVER)
    }

    /// Same account without the device part.
    #[must_use]
    pub fn to_account(&self) -> Self {
        Self {
            device: None,
            ..self.clone()
        }
    }

    /// Device index, 0 for the primary device.
    #[must_use]
    pub fn device_id(&self) -> u16 {
        self.device.unwrap_or(0)
    }

    /// Whether this addresses a group.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// Whether this addresses a broadcast list or status.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    /// Whether this addresses a newsletter.
    #[must_use]
    pub fn is_newsletter(&self) -> bool {
        self.server == NEWSLETTER_SERVER
    }

    /// Parse only if the canonical rendering reproduces `s` exactly.
    ///
    /// The codec relies on this to pick compact JID encodings without
    /// changing the decoded string.
    #[must_use]
    pub fn parse_exact(s: &str) -> Option<Self> {
        if !s.contains('@') {
            return None;
        }
        let jid: Self = s.parse().ok()?;
        (jid.to_string() == s).then_some(jid)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            return write!(f, "{}", self.server);
        }
        match self.device {
            Some(device) => write!(f, "{}:{}@{}", self.user, device, self.server),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || JidParseError(s.to_string());

        let Some((left, server)) = s.split_once('@') else {
            if s.is_empty() || s.contains(':') {
                return Err(invalid());
            }
            return Ok(Self::server(s));
        };
        if server.is_empty() || server.contains('@') || left.is_empty() {
            return Err(invalid());
        }

        let (user, device) = match left.split_once(':') {
            Some((user, device)) => {
                let device: u16 = device.parse().map_err(|_| invalid())?;
                (user, Some(device))
            }
            None => (left, None),
        };
        if user.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let jid: Jid = "15551234567:3@s.courier.net".parse().unwrap();
        assert_eq!(jid.user, "15551234567");
        assert_eq!(jid.device, Some(3));
        assert_eq!(jid.server, USER_SERVER);
        assert_eq!(jid.to_string(), "15551234567:3@s.courier.net");
        assert_eq!(jid.to_account().to_string(), "15551234567@s.courier.net");

        let server: Jid = "courier.net".parse().unwrap();
        assert_eq!(server, Jid::relay());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "@s.courier.net", "user@", "a@b@c", "u:x@s.courier.net", ":1@s"] {
            assert!(bad.parse::<Jid>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_exact() {
        assert!(Jid::parse_exact("123@g.courier.net").is_some());
        // Leading zero in the device would not survive a round trip
        assert!(Jid::parse_exact("123:01@s.courier.net").is_none());
        assert!(Jid::parse_exact("plain").is_none());
    }

    #[test]
    fn test_kinds() {
        assert!(Jid::group("1-2").is_group());
        assert!(Jid::server(BROADCAST_SERVER).is_broadcast());
        assert!(!Jid::user("1").is_group());
        assert_eq!(Jid::device("1", 4).device_id(), 4);
    }
}

//! Session table keys.

use crate::jid::Jid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One device of one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    /// Account user part
    pub user: String,
    /// Device index, 0 for the primary device
    pub device: u16,
}

impl ProtocolAddress {
    /// Create an address.
    pub fn new(user: impl Into<String>, device: u16) -> Self {
        Self {
            user: user.into(),
            device,
        }
    }

    /// Address of the device a JID names.
    #[must_use]
    pub fn from_jid(jid: &Jid) -> Self {
        Self::new(jid.user.clone(), jid.device_id())
    }

    /// Device JID on the user server.
    #[must_use]
    pub fn to_jid(&self) -> Jid {
        match self.device {
            0 => Jid::user(self.user.clone()),
            device => Jid::device(self.user.clone(), device),
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user, self.device)
    }
}

impl From<&Jid> for ProtocolAddress {
    fn from(jid: &Jid) -> Self {
        Self::from_jid(jid)
    }
}

/// Sender key slot: one sender within one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderKeyName {
    /// Group JID
    pub group: String,
    /// Sending device
    pub sender: ProtocolAddress,
}

impl SenderKeyName {
    /// Create a sender key name.
    pub fn new(group: impl Into<String>, sender: ProtocolAddress) -> Self {
        Self {
            group: group.into(),
            sender,
        }
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group, self.sender)
    }
}

//! Node encoder.

use super::node::{BinaryNode, NodeContent};
use super::token::{
    AD_JID, BINARY_8, BINARY_20, BINARY_32, JID_PAIR, LIST_8, LIST_16, LIST_EMPTY, NIBBLE_8,
    index_of,
};
use super::DEFAULT_MAX_DEPTH;
use crate::error::CodecError;
use crate::jid::{Jid, USER_SERVER};

/// Encode a node, prefixed with the (zero) flags byte.
///
/// # Errors
///
/// Returns [`CodecError::EmptyTag`] for a node without a tag,
/// [`CodecError::DepthExceeded`] for trees deeper than the decoder accepts,
/// and [`CodecError::TooLarge`] for lists or payloads beyond the length classes.
pub fn encode(node: &BinaryNode) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder {
        out: Vec::with_capacity(64),
    };
    encoder.out.push(0);
    encoder.write_node(node, 0)?;
    Ok(encoder.out)
}

struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn write_node(&mut self, node: &BinaryNode, depth: usize) -> Result<(), CodecError> {
        if depth > DEFAULT_MAX_DEPTH {
            return Err(CodecError::DepthExceeded(DEFAULT_MAX_DEPTH));
        }
        if node.tag().is_empty() {
            return Err(CodecError::EmptyTag);
        }

        let has_content = !matches!(node.content(), NodeContent::None);
        let size = 1 + 2 * node.attrs().len() + usize::from(has_content);
        self.write_list_start(size)?;

        self.write_string(node.tag())?;
        for (key, value) in node.attrs() {
            self.write_string(key)?;
            self.write_string(value)?;
        }

        match node.content() {
            NodeContent::None => {}
            NodeContent::Bytes(bytes) => self.write_bytes(bytes)?,
            NodeContent::Nodes(children) => {
                self.write_list_start(children.len())?;
                for child in children {
                    self.write_node(child, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn write_list_start(&mut self, len: usize) -> Result<(), CodecError> {
        if len == 0 {
            self.out.push(LIST_EMPTY);
        } else if let Ok(len) = u8::try_from(len) {
            self.out.push(LIST_8);
            self.out.push(len);
        } else if let Ok(len) = u16::try_from(len) {
            self.out.push(LIST_16);
            self.out.extend_from_slice(&len.to_be_bytes());
        } else {
            return Err(CodecError::TooLarge(len));
        }
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let len = bytes.len();
        if len < 1 << 8 {
            self.out.push(BINARY_8);
            self.out.push(len as u8);
        } else if len < 1 << 20 {
            self.out.push(BINARY_20);
            self.out.push(((len >> 16) & 0x0F) as u8);
            self.out.push((len >> 8) as u8);
            self.out.push(len as u8);
        } else if let Ok(len) = u32::try_from(len) {
            self.out.push(BINARY_32);
            self.out.extend_from_slice(&len.to_be_bytes());
        } else {
            return Err(CodecError::TooLarge(len));
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<(), CodecError> {
        if let Some(jid) = Jid::parse_exact(value) {
            if self.write_jid(&jid)? {
                return Ok(());
            }
        }
        self.write_plain_string(value)
    }

    /// Token, nibble or raw form. Never a JID, so JID parts cannot nest.
    fn write_plain_string(&mut self, value: &str) -> Result<(), CodecError> {
        if let Some(index) = index_of(value) {
            self.out.push(index);
            Ok(())
        } else if is_nibble(value) {
            self.write_nibbles(value);
            Ok(())
        } else {
            self.write_bytes(value.as_bytes())
        }
    }

    fn write_jid(&mut self, jid: &Jid) -> Result<bool, CodecError> {
        match jid.device {
            Some(device) if jid.server == USER_SERVER => {
                let Ok(device) = u8::try_from(device) else {
                    return Ok(false);
                };
                self.out.push(AD_JID);
                self.out.push(0);
                self.out.push(device);
                self.write_plain_string(&jid.user)?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                self.out.push(JID_PAIR);
                self.write_plain_string(&jid.user)?;
                self.write_plain_string(&jid.server)?;
                Ok(true)
            }
        }
    }

    fn write_nibbles(&mut self, value: &str) {
        let digits: Vec<u8> = value.bytes().filter_map(nibble_of).collect();
        let odd = digits.len() % 2 == 1;
        let packed_len = digits.len().div_ceil(2);

        self.out.push(NIBBLE_8);
        self.out.push(((odd as u8) << 7) | packed_len as u8);
        for pair in digits.chunks(2) {
            let hi = pair[0];
            let lo = pair.get(1).copied().unwrap_or(0x0F);
            self.out.push((hi << 4) | lo);
        }
    }
}

fn nibble_of(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'-' => Some(10),
        b'.' => Some(11),
        _ => None,
    }
}

fn is_nibble(value: &str) -> bool {
    !value.is_empty() && value.len() <= 254 && value.bytes().all(|c| nibble_of(c).is_some())
}

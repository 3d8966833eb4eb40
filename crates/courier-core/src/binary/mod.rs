//! Binary stanza codec.
//!
//! Stanzas are trees of [`BinaryNode`]s. On the wire a node is a list
//! header counting `1 + 2 * attrs + content?` items, followed by the tag,
//! the attribute key/value strings and the optional content. Strings use
//! the shortest available form: a dictionary index, a packed JID, a packed
//! numeric string, or raw bytes.

mod decode;
mod encode;
mod node;
pub mod token;

pub use decode::{decode, decode_with_depth};
pub use encode::encode;
pub use node::{BinaryNode, NodeBuilder, NodeContent};

/// Default nesting bound for encoding and decoding
pub const DEFAULT_MAX_DEPTH: usize = 64;

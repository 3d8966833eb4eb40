//! Stanza tree.

use std::fmt;

/// Content slot of a node. The variant is fixed when the node is built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeContent {
    /// No content
    #[default]
    None,
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered child nodes
    Nodes(Vec<BinaryNode>),
}

/// A tagged, attributed, tree-structured stanza.
///
/// Nodes are assembled through [`NodeBuilder`] and immutable afterwards.
/// Attribute keys are unique and keep insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryNode {
    tag: String,
    attrs: Vec<(String, String)>,
    content: NodeContent,
}

impl BinaryNode {
    /// Start building a node with the given tag.
    pub fn builder(tag: impl Into<String>) -> NodeBuilder {
        NodeBuilder {
            tag: tag.into(),
            attrs: Vec::new(),
            content: NodeContent::None,
        }
    }

    /// Node without attributes or content.
    pub fn empty(tag: impl Into<String>) -> Self {
        Self::builder(tag).build()
    }

    /// Reopen the node for assembly.
    #[must_use]
    pub fn into_builder(self) -> NodeBuilder {
        NodeBuilder {
            tag: self.tag,
            attrs: self.attrs,
            content: self.content,
        }
    }

    /// Tag name.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Attributes in insertion order.
    #[must_use]
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    /// Value of one attribute.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Content slot.
    #[must_use]
    pub fn content(&self) -> &NodeContent {
        &self.content
    }

    /// Child nodes, empty unless the content is a node list.
    #[must_use]
    pub fn children(&self) -> &[BinaryNode] {
        match &self.content {
            NodeContent::Nodes(nodes) => nodes,
            _ => &[],
        }
    }

    /// First child with the given tag.
    #[must_use]
    pub fn child(&self, tag: &str) -> Option<&BinaryNode> {
        self.children().iter().find(|c| c.tag == tag)
    }

    /// All children with the given tag.
    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a BinaryNode> + 'a {
        self.children().iter().filter(move |c| c.tag == tag)
    }

    /// Raw byte content, if any.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte content of the first child with the given tag.
    #[must_use]
    pub fn child_bytes(&self, tag: &str) -> Option<&[u8]> {
        self.child(tag).and_then(BinaryNode::bytes)
    }
}

/// Builder for [`BinaryNode`].
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    tag: String,
    attrs: Vec<(String, String)>,
    content: NodeContent,
}

impl NodeBuilder {
    /// Set an attribute. An existing key keeps its position and takes the new value.
    #[must_use]
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
        self
    }

    /// Set an attribute only if `value` is present.
    #[must_use]
    pub fn attr_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.attr(key, v),
            None => self,
        }
    }

    /// Whether an attribute is already set.
    #[must_use]
    pub fn has_attr(&self, key: &str) -> bool {
        self.attrs.iter().any(|(k, _)| k == key)
    }

    /// Use raw bytes as content.
    #[must_use]
    pub fn bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    /// Use a list of nodes as content.
    #[must_use]
    pub fn children(mut self, children: Vec<BinaryNode>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    /// Append one child, turning the content into a node list.
    #[must_use]
    pub fn child(mut self, child: BinaryNode) -> Self {
        match &mut self.content {
            NodeContent::Nodes(nodes) => nodes.push(child),
            _ => self.content = NodeContent::Nodes(vec![child]),
        }
        self
    }

    /// Finish the node.
    #[must_use]
    pub fn build(self) -> BinaryNode {
        BinaryNode {
            tag: self.tag,
            attrs: self.attrs,
            content: self.content,
        }
    }
}

impl fmt::Display for BinaryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (k, v) in &self.attrs {
            write!(f, " {k}=\"{v}\"")?;
        }
        match &self.content {
            NodeContent::None => write!(f, "/>"),
            NodeContent::Bytes(b) => write!(f, ">[{} bytes]</{}>", b.len(), self.tag),
            NodeContent::Nodes(nodes) => {
                write!(f, ">")?;
                for node in nodes {
                    write!(f, "{node}")?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}

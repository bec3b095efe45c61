//! Arena-backed XML document model.
//!
//! Nodes live in a single `Vec` and refer to each other through [`NodeId`]
//! handles, so the tree has no reference cycles and drops trivially.
//!
//! ```text
//! Document
//!   top_level: [comment?, pi?, root, ...]
//!   nodes[root] = Element { name, namespaces, attributes }
//!     children: [NodeId, ...]   parent: Option<NodeId>
//! ```

mod parse;
mod write;

pub(crate) use write::{escape_attr_value, escape_text};

use crate::error::CanonicalizationError;

/// Namespace URI bound to the reserved `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Maximum element nesting depth accepted by the parser and canonicalizer.
pub const MAX_DEPTH: usize = 256;

/// Maximum document size accepted by the parser (50 MiB).
pub const MAX_INPUT_SIZE: usize = 50 * 1024 * 1024;

/// Handle to a node inside a [`Document`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Qualified name as written in the document (`prefix:local`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub prefix: Option<String>,
    pub local: String,
}

impl QName {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
        }
    }

    pub fn prefixed(prefix: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            local: local.into(),
        }
    }

    /// Split a raw `prefix:local` name on the first colon.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => {
                Self::prefixed(prefix, local)
            }
            _ => Self::new(raw),
        }
    }
}

impl std::fmt::Display for QName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local),
            None => f.write_str(&self.local),
        }
    }
}

/// A regular (non-`xmlns`) attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

/// A namespace declaration (`xmlns="..."` or `xmlns:p="..."`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    pub prefix: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: QName,
    pub namespaces: Vec<NamespaceDecl>,
    pub attributes: Vec<Attribute>,
}

impl Element {
    pub fn new(name: QName) -> Self {
        Self {
            name,
            namespaces: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Value of an unprefixed attribute.
    pub fn attribute(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.prefix.is_none() && a.name.local == local)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element(Element),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An XML document stored as an arena of nodes.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    top_level: Vec<NodeId>,
    root: NodeId,
}

impl Document {
    /// Create a document containing only an empty root element.
    pub fn new(root: QName) -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            top_level: Vec::new(),
            root: NodeId(0),
        };
        let root = doc.create_element(root);
        doc.top_level.push(root);
        doc.root = root;
        doc
    }

    /// Parse a document from UTF-8 text.
    pub fn parse(input: &str) -> Result<Self, CanonicalizationError> {
        parse::parse_document(input)
    }

    /// Parse a document from raw bytes (must be UTF-8).
    pub fn parse_bytes(input: &[u8]) -> Result<Self, CanonicalizationError> {
        let text =
            std::str::from_utf8(input).map_err(|e| CanonicalizationError::InvalidEncoding {
                message: e.to_string(),
            })?;
        Self::parse(text)
    }

    /// Serialize as compact XML without an XML declaration.
    pub fn to_xml_bytes(&self) -> Vec<u8> {
        write::write_document(self).into_bytes()
    }

    pub fn to_xml_string(&self) -> String {
        write::write_document(self)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Nodes outside the root element (plus the root itself), in order.
    pub fn top_level(&self) -> &[NodeId] {
        &self.top_level
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id.0].kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[id.0].kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn child_elements(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(id)
            .iter()
            .copied()
            .filter(move |child| self.element(*child).is_some())
    }

    /// First child element with the given local name and no prefix.
    pub fn find_child(&self, id: NodeId, local: &str) -> Option<NodeId> {
        self.child_elements(id).find(|child| {
            self.element(*child)
                .is_some_and(|e| e.name.prefix.is_none() && e.name.local == local)
        })
    }

    /// Number of ancestors between `id` and the document.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.parent(id);
        while let Some(parent) = current {
            depth += 1;
            current = self.parent(parent);
        }
        depth
    }

    /// Pre-order list of `id` and all of its descendants.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            for child in self.children(current).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|node| match self.kind(node) {
                NodeKind::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Resolve a prefix (`None` for the default namespace) in the scope of `id`.
    ///
    /// Returns `None` when the prefix is unbound or the default namespace is
    /// empty.
    pub fn lookup_namespace(&self, id: NodeId, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NAMESPACE);
        }
        let mut current = Some(id);
        while let Some(node) = current {
            if let Some(element) = self.element(node) {
                if let Some(decl) = element
                    .namespaces
                    .iter()
                    .find(|decl| decl.prefix.as_deref() == prefix)
                {
                    return if decl.uri.is_empty() {
                        None
                    } else {
                        Some(decl.uri.as_str())
                    };
                }
            }
            current = self.parent(node);
        }
        None
    }

    /// Namespace URI of an element's own name.
    pub fn namespace_uri(&self, id: NodeId) -> Option<&str> {
        let element = self.element(id)?;
        self.lookup_namespace(id, element.name.prefix.as_deref())
    }

    /// Whether the element at `id` has the given expanded name.
    pub fn is_element(&self, id: NodeId, namespace: Option<&str>, local: &str) -> bool {
        match self.element(id) {
            Some(element) => element.name.local == local && self.namespace_uri(id) == namespace,
            None => false,
        }
    }

    /// All elements (document order) with the given expanded name.
    pub fn find_all(&self, namespace: Option<&str>, local: &str) -> Vec<NodeId> {
        self.descendants(self.root)
            .into_iter()
            .filter(|id| self.is_element(*id, namespace, local))
            .collect()
    }

    /// Allocate a detached element node.
    pub fn create_element(&mut self, name: QName) -> NodeId {
        self.push(NodeKind::Element(Element::new(name)))
    }

    /// Allocate a detached text node.
    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.push(NodeKind::Text(text.into()))
    }

    pub(crate) fn create_node(&mut self, kind: NodeKind) -> NodeId {
        self.push(kind)
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    /// Append `child` as the last child of `parent`, detaching it first.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Insert `child` at `index` among the children of `parent`.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        let children = &mut self.nodes[parent.0].children;
        let index = index.min(children.len());
        children.insert(index, child);
        self.nodes[child.0].parent = Some(parent);
    }

    /// Remove a node from its parent. The node stays in the arena, unreachable.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent.take() {
            self.nodes[parent.0].children.retain(|child| *child != id);
        }
    }

    /// Set (or replace) an attribute on an element.
    pub fn set_attribute(&mut self, id: NodeId, name: QName, value: impl Into<String>) {
        let value = value.into();
        if let Some(element) = self.element_mut(id) {
            match element.attributes.iter_mut().find(|a| a.name == name) {
                Some(existing) => existing.value = value,
                None => element.attributes.push(Attribute { name, value }),
            }
        }
    }

    /// Declare a namespace on an element.
    pub fn declare_namespace(&mut self, id: NodeId, prefix: Option<&str>, uri: impl Into<String>) {
        let uri = uri.into();
        if let Some(element) = self.element_mut(id) {
            match element
                .namespaces
                .iter_mut()
                .find(|decl| decl.prefix.as_deref() == prefix)
            {
                Some(existing) => existing.uri = uri,
                None => element.namespaces.push(NamespaceDecl {
                    prefix: prefix.map(String::from),
                    uri,
                }),
            }
        }
    }

    /// Replace all children of an element with one text node.
    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        for child in self.children(id).to_vec() {
            self.detach(child);
        }
        let text = self.create_text(text);
        self.append_child(id, text);
    }

    /// Convenience: create `name` as the last child of `parent`.
    pub fn append_element(&mut self, parent: NodeId, name: QName) -> NodeId {
        let child = self.create_element(name);
        self.append_child(parent, child);
        child
    }

    pub(crate) fn from_parts(nodes_doc: Document, top_level: Vec<NodeId>, root: NodeId) -> Self {
        Self {
            nodes: nodes_doc.nodes,
            top_level,
            root,
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            top_level: Vec::new(),
            root: NodeId(0),
        }
    }

    pub(crate) fn set_text_node(&mut self, id: NodeId, text: String) {
        if let NodeKind::Text(existing) = &mut self.nodes[id.0].kind {
            *existing = text;
        }
    }

    pub(crate) fn is_whitespace_only(&self, id: NodeId) -> bool {
        matches!(self.kind(id), NodeKind::Text(text) if text.chars().all(is_xml_whitespace))
    }

    pub(crate) fn has_element_children(&self, id: NodeId) -> bool {
        self.child_elements(id).next().is_some()
    }
}

pub(crate) fn is_xml_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

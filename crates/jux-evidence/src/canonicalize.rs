//! Exclusive XML canonicalization and content hashing.
//!
//! Two flavours share one serializer:
//!
//! - [`canonicalize`] produces the *content form* of a whole report. It is
//!   Exclusive C14N 1.0 without comments, with every `ds:Signature` element
//!   removed and with namespace prefixes rewritten to `n0`, `n1`, ... in
//!   order of first use. Prefix rewriting makes documents that only differ
//!   in how they spell a namespace canonicalize byte-identically.
//! - [`canonicalize_subtree`] is plain Exclusive C14N 1.0 of one element
//!   (prefixes kept), used for `ds:SignedInfo`.
//!
//! # Rules
//!
//! - Attributes sorted by (namespace URI, local name)
//! - Namespace declarations emitted only where visibly utilized and not
//!   already in output scope, sorted by prefix
//! - Empty elements written as start/end tag pairs
//! - Whitespace-only text between child elements dropped
//! - Comments removed, processing instructions kept
//!
//! # DoS Limits
//!
//! - Max depth: [`MAX_DEPTH`]
//! - Max input size: [`crate::xml::MAX_INPUT_SIZE`] (enforced by the parser)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::dsig::DSIG_NAMESPACE;
use crate::error::CanonicalizationError;
use crate::xml::{escape_attr_value, escape_text, Document, NodeId, NodeKind, XML_NAMESPACE};

pub use crate::xml::MAX_DEPTH;

/// Canonical bytes of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalForm(Vec<u8>);

impl CanonicalForm {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 of the canonical bytes.
    pub fn hash(&self) -> ContentHash {
        hash(self)
    }
}

/// SHA-256 content address, rendered as `sha256:<64 lowercase hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse the bare 64-character hex form (as used in file names).
    pub fn from_hex(hex_str: &str) -> Result<Self, ContentHashParseError> {
        if hex_str.len() != 64 || hex_str.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(ContentHashParseError {
                input: hex_str.to_string(),
            });
        }
        let mut bytes = [0_u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes).map_err(|_| ContentHashParseError {
            input: hex_str.to_string(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bare lowercase hex (no `sha256:` prefix).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl FromStr for ContentHash {
    type Err = ContentHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("sha256:") {
            Some(hex_str) => Self::from_hex(hex_str),
            None => Err(ContentHashParseError {
                input: s.to_string(),
            }),
        }
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid content hash '{input}': expected sha256:<64 lowercase hex>")]
pub struct ContentHashParseError {
    pub input: String,
}

/// Canonical content form of a whole document, signatures excluded.
pub fn canonicalize(doc: &Document) -> Result<CanonicalForm, CanonicalizationError> {
    let mut c14n = Canonicalizer::new(doc, PrefixMode::Normalized, true);
    let root = doc.root();
    let mut seen_root = false;
    for id in doc.top_level() {
        if *id == root {
            c14n.element(root, &BTreeMap::new(), 0)?;
            seen_root = true;
            continue;
        }
        if let NodeKind::ProcessingInstruction { target, data } = doc.kind(*id) {
            if seen_root {
                c14n.out.push('\n');
                c14n.pi(target, data);
            } else {
                c14n.pi(target, data);
                c14n.out.push('\n');
            }
        }
    }
    Ok(CanonicalForm(c14n.out.into_bytes()))
}

/// Exclusive C14N of the subtree rooted at `node`, prefixes preserved.
pub fn canonicalize_subtree(
    doc: &Document,
    node: NodeId,
) -> Result<CanonicalForm, CanonicalizationError> {
    let mut c14n = Canonicalizer::new(doc, PrefixMode::Preserve, false);
    c14n.element(node, &BTreeMap::new(), 0)?;
    Ok(CanonicalForm(c14n.out.into_bytes()))
}

/// SHA-256 over canonical bytes.
pub fn hash(form: &CanonicalForm) -> ContentHash {
    let digest = Sha256::digest(form.as_bytes());
    let mut bytes = [0_u8; 32];
    bytes.copy_from_slice(&digest);
    ContentHash(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefixMode {
    Normalized,
    Preserve,
}

/// Prefix -> URI declarations already rendered by output ancestors.
/// The default namespace uses the empty prefix.
type Rendered = BTreeMap<String, String>;

struct Canonicalizer<'a> {
    doc: &'a Document,
    mode: PrefixMode,
    exclude_signatures: bool,
    assigned: HashMap<String, String>,
    out: String,
}

impl<'a> Canonicalizer<'a> {
    fn new(doc: &'a Document, mode: PrefixMode, exclude_signatures: bool) -> Self {
        Self {
            doc,
            mode,
            exclude_signatures,
            assigned: HashMap::new(),
            out: String::new(),
        }
    }

    fn normalized_prefix(&mut self, uri: &str) -> String {
        if let Some(prefix) = self.assigned.get(uri) {
            return prefix.clone();
        }
        let prefix = format!("n{}", self.assigned.len());
        self.assigned.insert(uri.to_string(), prefix.clone());
        prefix
    }

    fn is_excluded(&self, id: NodeId) -> bool {
        self.exclude_signatures && self.doc.is_element(id, Some(DSIG_NAMESPACE), "Signature")
    }

    fn element(
        &mut self,
        id: NodeId,
        rendered: &Rendered,
        depth: usize,
    ) -> Result<(), CanonicalizationError> {
        if depth >= MAX_DEPTH {
            return Err(CanonicalizationError::DepthExceeded {
                depth: depth + 1,
                limit: MAX_DEPTH,
            });
        }
        let doc = self.doc;
        let Some(element) = doc.element(id) else {
            return Ok(());
        };

        // Resolve attributes to (uri, local, value, written prefix).
        let mut attrs = Vec::with_capacity(element.attributes.len());
        for attr in &element.attributes {
            let uri = match attr.name.prefix.as_deref() {
                Some(prefix) => Some(doc.lookup_namespace(id, Some(prefix)).ok_or_else(|| {
                    CanonicalizationError::UnboundPrefix {
                        prefix: prefix.to_string(),
                    }
                })?),
                None => None,
            };
            attrs.push((
                uri,
                attr.name.local.as_str(),
                attr.value.as_str(),
                attr.name.prefix.as_deref(),
            ));
        }
        attrs.sort_by(|a, b| (a.0.unwrap_or(""), a.1).cmp(&(b.0.unwrap_or(""), b.1)));

        let element_uri = match element.name.prefix.as_deref() {
            Some(prefix) => Some(doc.lookup_namespace(id, Some(prefix)).ok_or_else(|| {
                CanonicalizationError::UnboundPrefix {
                    prefix: prefix.to_string(),
                }
            })?),
            None => doc.lookup_namespace(id, None),
        };

        // Visibly utilized declarations as (prefix, uri); "" is the default namespace.
        let mut utilized: Vec<(String, String)> = Vec::new();
        let element_name;
        let mut attr_names = Vec::with_capacity(attrs.len());
        match self.mode {
            PrefixMode::Normalized => {
                element_name = match element_uri {
                    Some(uri) => {
                        let prefix = self.normalized_prefix(uri);
                        utilized.push((prefix.clone(), uri.to_string()));
                        format!("{prefix}:{}", element.name.local)
                    }
                    None => element.name.local.clone(),
                };
                for (uri, local, _, _) in &attrs {
                    match uri {
                        Some(uri) if *uri == XML_NAMESPACE => {
                            attr_names.push(format!("xml:{local}"))
                        }
                        Some(uri) => {
                            let prefix = self.normalized_prefix(uri);
                            utilized.push((prefix.clone(), uri.to_string()));
                            attr_names.push(format!("{prefix}:{local}"));
                        }
                        None => attr_names.push((*local).to_string()),
                    }
                }
            }
            PrefixMode::Preserve => {
                element_name = element.name.to_string();
                let prefix = element.name.prefix.clone().unwrap_or_default();
                utilized.push((prefix, element_uri.unwrap_or("").to_string()));
                for (uri, local, _, prefix) in &attrs {
                    match (prefix, uri) {
                        (Some(prefix), Some(uri)) => {
                            if *uri != XML_NAMESPACE {
                                utilized.push(((*prefix).to_string(), (*uri).to_string()));
                            }
                            attr_names.push(format!("{prefix}:{local}"));
                        }
                        _ => attr_names.push((*local).to_string()),
                    }
                }
            }
        }

        let mut to_render: BTreeMap<String, String> = BTreeMap::new();
        for (prefix, uri) in utilized {
            let already = match rendered.get(&prefix) {
                Some(existing) => *existing == uri,
                // An empty default namespace is the initial state.
                None => prefix.is_empty() && uri.is_empty(),
            };
            if !already {
                to_render.insert(prefix, uri);
            }
        }

        self.out.push('<');
        self.out.push_str(&element_name);
        for (prefix, uri) in &to_render {
            if prefix.is_empty() {
                self.out.push_str(" xmlns=\"");
            } else {
                self.out.push_str(" xmlns:");
                self.out.push_str(prefix);
                self.out.push_str("=\"");
            }
            self.out.push_str(&escape_attr_value(uri));
            self.out.push('"');
        }
        for ((_, _, value, _), name) in attrs.iter().zip(&attr_names) {
            self.out.push(' ');
            self.out.push_str(name);
            self.out.push_str("=\"");
            self.out.push_str(&escape_attr_value(value));
            self.out.push('"');
        }
        self.out.push('>');

        let scope = if to_render.is_empty() {
            None
        } else {
            let mut scope = rendered.clone();
            scope.extend(to_render);
            Some(scope)
        };
        let scope = scope.as_ref().unwrap_or(rendered);

        let drop_whitespace = doc.has_element_children(id);
        for child in doc.children(id) {
            match doc.kind(*child) {
                NodeKind::Element(_) => {
                    if !self.is_excluded(*child) {
                        self.element(*child, scope, depth + 1)?;
                    }
                }
                NodeKind::Text(text) => {
                    if !(drop_whitespace && doc.is_whitespace_only(*child)) {
                        self.out.push_str(&escape_text(text));
                    }
                }
                NodeKind::Comment(_) => {}
                NodeKind::ProcessingInstruction { target, data } => self.pi(target, data),
            }
        }

        self.out.push_str("</");
        self.out.push_str(&element_name);
        self.out.push('>');
        Ok(())
    }

    fn pi(&mut self, target: &str, data: &str) {
        self.out.push_str("<?");
        self.out.push_str(target);
        if !data.is_empty() {
            self.out.push(' ');
            self.out.push_str(data);
        }
        self.out.push_str("?>");
    }
}

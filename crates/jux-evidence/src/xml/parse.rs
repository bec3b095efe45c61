//! Build a [`Document`] from text with the `quick-xml` pull parser.

use std::collections::HashSet;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{
    is_xml_whitespace, Attribute, Document, Element, NamespaceDecl, NodeId, NodeKind, QName,
    MAX_DEPTH, MAX_INPUT_SIZE,
};
use crate::error::CanonicalizationError;

pub(super) fn parse_document(input: &str) -> Result<Document, CanonicalizationError> {
    if input.len() > MAX_INPUT_SIZE {
        return Err(CanonicalizationError::InputTooLarge {
            size: input.len(),
            limit: MAX_INPUT_SIZE,
        });
    }

    let mut reader = Reader::from_str(input);
    let mut builder = TreeBuilder::new();

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader
            .read_event()
            .map_err(|e| CanonicalizationError::Syntax {
                position,
                message: e.to_string(),
            })?;
        match event {
            Event::Start(start) => builder.open(&start, position)?,
            Event::Empty(start) => {
                builder.open(&start, position)?;
                builder.close()?;
            }
            Event::End(_) => builder.close()?,
            Event::Text(text) => {
                let raw = utf8(&text, position)?;
                builder.text(unescape(raw, position)?)?;
            }
            Event::CData(cdata) => {
                let raw = utf8(&cdata, position)?;
                builder.text(normalize_line_endings(raw))?;
            }
            Event::Comment(comment) => {
                let raw = utf8(&comment, position)?;
                builder.leaf(NodeKind::Comment(normalize_line_endings(raw)))?;
            }
            Event::PI(pi) => {
                let raw = normalize_line_endings(utf8(&pi, position)?);
                let (target, data) = match raw.split_once(is_xml_whitespace) {
                    Some((target, data)) => (target.to_string(), data.trim_start().to_string()),
                    None => (raw, String::new()),
                };
                builder.leaf(NodeKind::ProcessingInstruction { target, data })?;
            }
            Event::DocType(_) => return Err(CanonicalizationError::DoctypeNotAllowed),
            Event::Eof => break,
            _ => {}
        }
    }

    builder.finish()
}

struct TreeBuilder {
    doc: Document,
    stack: Vec<NodeId>,
    top_level: Vec<NodeId>,
    root: Option<NodeId>,
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            doc: Document::empty(),
            stack: Vec::new(),
            top_level: Vec::new(),
            root: None,
        }
    }

    fn open(&mut self, start: &BytesStart<'_>, position: u64) -> Result<(), CanonicalizationError> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(CanonicalizationError::DepthExceeded {
                depth: self.stack.len() + 1,
                limit: MAX_DEPTH,
            });
        }

        let name = QName::parse(utf8(start.name().as_ref(), position)?);
        let mut element = Element::new(name);

        for attr in start.attributes() {
            let attr = attr.map_err(|e| match e {
                quick_xml::events::attributes::AttrError::Duplicated(..) => {
                    CanonicalizationError::DuplicateAttribute {
                        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    }
                }
                other => CanonicalizationError::Syntax {
                    position,
                    message: other.to_string(),
                },
            })?;
            let key = utf8(attr.key.as_ref(), position)?;
            let raw_value = utf8(&attr.value, position)?;
            let value = unescape(&normalize_attribute_whitespace(raw_value), position)?;

            if key == "xmlns" {
                element.namespaces.push(NamespaceDecl { prefix: None, uri: value });
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(CanonicalizationError::Syntax {
                        position,
                        message: format!("prefix '{prefix}' cannot be undeclared"),
                    });
                }
                element.namespaces.push(NamespaceDecl {
                    prefix: Some(prefix.to_string()),
                    uri: value,
                });
            } else {
                element.attributes.push(Attribute {
                    name: QName::parse(key),
                    value,
                });
            }
        }

        let id = self.doc.create_node(NodeKind::Element(element));
        match self.stack.last() {
            Some(parent) => self.doc.append_child(*parent, id),
            None => {
                if self.root.is_some() {
                    return Err(CanonicalizationError::MultipleRoots);
                }
                self.root = Some(id);
                self.top_level.push(id);
            }
        }
        self.stack.push(id);
        self.check_namespaces(id)
    }

    /// Every prefix used by the element or its attributes must be bound, and
    /// no two attributes may share an expanded name.
    fn check_namespaces(&self, id: NodeId) -> Result<(), CanonicalizationError> {
        let Some(element) = self.doc.element(id) else {
            return Ok(());
        };
        if let Some(prefix) = element.name.prefix.as_deref() {
            if self.doc.lookup_namespace(id, Some(prefix)).is_none() {
                return Err(CanonicalizationError::UnboundPrefix {
                    prefix: prefix.to_string(),
                });
            }
        }
        let mut seen = HashSet::new();
        for attr in &element.attributes {
            let namespace = match attr.name.prefix.as_deref() {
                Some(prefix) => match self.doc.lookup_namespace(id, Some(prefix)) {
                    Some(uri) => uri,
                    None => {
                        return Err(CanonicalizationError::UnboundPrefix {
                            prefix: prefix.to_string(),
                        })
                    }
                },
                None => "",
            };
            if !seen.insert((namespace, attr.name.local.as_str())) {
                return Err(CanonicalizationError::DuplicateAttribute {
                    name: attr.name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), CanonicalizationError> {
        let Some(id) = self.stack.pop() else {
            return Err(CanonicalizationError::Syntax {
                position: 0,
                message: "unexpected end tag".to_string(),
            });
        };
        // Whitespace between child elements is insignificant.
        if self.doc.has_element_children(id) {
            for child in self.doc.children(id).to_vec() {
                if self.doc.is_whitespace_only(child) {
                    self.doc.detach(child);
                }
            }
        }
        Ok(())
    }

    fn text(&mut self, text: String) -> Result<(), CanonicalizationError> {
        if text.is_empty() {
            return Ok(());
        }
        let Some(parent) = self.stack.last().copied() else {
            if text.chars().all(is_xml_whitespace) {
                return Ok(());
            }
            return Err(CanonicalizationError::ContentOutsideRoot);
        };
        // Adjacent text and CDATA sections merge into one text node.
        if let Some(last) = self.doc.children(parent).last().copied() {
            if let NodeKind::Text(existing) = self.doc.kind(last) {
                let merged = format!("{existing}{text}");
                self.doc.set_text_node(last, merged);
                return Ok(());
            }
        }
        let id = self.doc.create_text(text);
        self.doc.append_child(parent, id);
        Ok(())
    }

    fn leaf(&mut self, kind: NodeKind) -> Result<(), CanonicalizationError> {
        let id = self.doc.create_node(kind);
        match self.stack.last() {
            Some(parent) => self.doc.append_child(*parent, id),
            None => self.top_level.push(id),
        }
        Ok(())
    }

    fn finish(self) -> Result<Document, CanonicalizationError> {
        if let Some(open) = self.stack.last() {
            let name = self
                .doc
                .element(*open)
                .map(|e| e.name.to_string())
                .unwrap_or_default();
            return Err(CanonicalizationError::Syntax {
                position: 0,
                message: format!("unclosed element '{name}'"),
            });
        }
        let root = self.root.ok_or(CanonicalizationError::MissingRoot)?;
        Ok(Document::from_parts(self.doc, self.top_level, root))
    }
}

fn utf8(bytes: &[u8], position: u64) -> Result<&str, CanonicalizationError> {
    std::str::from_utf8(bytes).map_err(|e| CanonicalizationError::InvalidEncoding {
        message: format!("at byte {position}: {e}"),
    })
}

fn unescape(raw: &str, position: u64) -> Result<String, CanonicalizationError> {
    let normalized = normalize_line_endings(raw);
    quick_xml::escape::unescape(&normalized)
        .map(|text| text.into_owned())
        .map_err(|e| CanonicalizationError::Syntax {
            position,
            message: e.to_string(),
        })
}

/// `\r\n` and lone `\r` become `\n` (XML 1.0 section 2.11).
fn normalize_line_endings(raw: &str) -> String {
    if !raw.contains('\r') {
        return raw.to_string();
    }
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

/// Literal whitespace characters in attribute values become spaces
/// (XML 1.0 section 3.3.3). Character references are untouched.
fn normalize_attribute_whitespace(raw: &str) -> String {
    normalize_line_endings(raw).replace(['\t', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Document, CanonicalizationError> {
        parse_document(input)
    }

    #[test]
    fn test_parses_attributes_and_text() {
        let doc = parse(r#"<testsuite name="a &amp; b" tests="1"><testcase name="x">out &lt;1&gt;</testcase></testsuite>"#).unwrap();
        let root = doc.root();
        assert_eq!(doc.element(root).unwrap().attribute("name"), Some("a & b"));
        let case = doc.find_child(root, "testcase").unwrap();
        assert_eq!(doc.text_content(case), "out <1>");
    }

    #[test]
    fn test_drops_whitespace_between_elements() {
        let doc = parse("<r>\n  <a> keep </a>\n  <b/>\n</r>").unwrap();
        let root = doc.root();
        assert_eq!(doc.children(root).len(), 2);
        let a = doc.find_child(root, "a").unwrap();
        assert_eq!(doc.text_content(a), " keep ");
    }

    #[test]
    fn test_normalizes_line_endings() {
        let doc = parse("<r a=\"x\r\ny\">one\r\ntwo\rthree</r>").unwrap();
        let root = doc.root();
        assert_eq!(doc.element(root).unwrap().attribute("a"), Some("x y"));
        assert_eq!(doc.text_content(root), "one\ntwo\nthree");
    }

    #[test]
    fn test_character_references_survive_attribute_normalization() {
        let doc = parse("<r a=\"x&#xA;y\"/>").unwrap();
        assert_eq!(doc.element(doc.root()).unwrap().attribute("a"), Some("x\ny"));
    }

    #[test]
    fn test_cdata_merges_with_text() {
        let doc = parse("<r>a<![CDATA[<b>]]>c</r>").unwrap();
        assert_eq!(doc.children(doc.root()).len(), 1);
        assert_eq!(doc.text_content(doc.root()), "a<b>c");
    }

    #[test]
    fn test_keeps_comments_and_top_level_pis() {
        let doc = parse("<?xml version=\"1.0\"?><?style x?><r><!-- note --></r>").unwrap();
        assert_eq!(doc.top_level().len(), 2);
        let child = doc.children(doc.root())[0];
        assert_eq!(doc.kind(child), &NodeKind::Comment(" note ".to_string()));
    }

    #[test]
    fn test_rejects_doctype() {
        let err = parse("<!DOCTYPE r [<!ENTITY x \"y\">]><r>&x;</r>").unwrap_err();
        assert!(matches!(err, CanonicalizationError::DoctypeNotAllowed));
    }

    #[test]
    fn test_rejects_unbound_prefix() {
        let err = parse("<p:r/>").unwrap_err();
        assert!(matches!(err, CanonicalizationError::UnboundPrefix { .. }));

        let err = parse("<r q:a=\"1\"/>").unwrap_err();
        assert!(matches!(err, CanonicalizationError::UnboundPrefix { .. }));
    }

    #[test]
    fn test_rejects_duplicate_expanded_attribute() {
        let err = parse(r#"<r xmlns:a="urn:x" xmlns:b="urn:x" a:k="1" b:k="2"/>"#).unwrap_err();
        assert!(matches!(err, CanonicalizationError::DuplicateAttribute { .. }));
    }

    #[test]
    fn test_rejects_bad_structure() {
        assert!(parse("").is_err());
        assert!(parse("<a/><b/>").is_err());
        assert!(parse("<a>").is_err());
        assert!(parse("<a></b>").is_err());
        assert!(parse("text<a/>").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}{}", "<a>".repeat(MAX_DEPTH + 1), "</a>".repeat(MAX_DEPTH + 1));
        let err = parse(&deep).unwrap_err();
        assert!(matches!(err, CanonicalizationError::DepthExceeded { .. }));

        let ok = format!("{}{}", "<a>".repeat(MAX_DEPTH), "</a>".repeat(MAX_DEPTH));
        assert!(parse(&ok).is_ok());
    }
}

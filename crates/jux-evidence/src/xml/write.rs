//! Compact serialization of a [`Document`].

use super::{Document, NodeId, NodeKind};

/// Serialize without an XML declaration or inter-element whitespace.
pub(super) fn write_document(doc: &Document) -> String {
    let mut out = String::new();
    for (index, id) in doc.top_level().iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        write_node(doc, *id, &mut out);
    }
    out
}

fn write_node(doc: &Document, id: NodeId, out: &mut String) {
    match doc.kind(id) {
        NodeKind::Element(element) => {
            let name = element.name.to_string();
            out.push('<');
            out.push_str(&name);
            for decl in &element.namespaces {
                out.push_str(" xmlns");
                if let Some(prefix) = &decl.prefix {
                    out.push(':');
                    out.push_str(prefix);
                }
                out.push_str("=\"");
                out.push_str(&escape_attr_value(&decl.uri));
                out.push('"');
            }
            for attr in &element.attributes {
                out.push(' ');
                out.push_str(&attr.name.to_string());
                out.push_str("=\"");
                out.push_str(&escape_attr_value(&attr.value));
                out.push('"');
            }
            let children = doc.children(id);
            if children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in children {
                write_node(doc, *child, out);
            }
            out.push_str("</");
            out.push_str(&name);
            out.push('>');
        }
        NodeKind::Text(text) => out.push_str(&escape_text(text)),
        NodeKind::Comment(comment) => {
            out.push_str("<!--");
            out.push_str(comment);
            out.push_str("-->");
        }
        NodeKind::ProcessingInstruction { target, data } => {
            out.push_str("<?");
            out.push_str(target);
            if !data.is_empty() {
                out.push(' ');
                out.push_str(data);
            }
            out.push_str("?>");
        }
    }
}

/// Text node escaping as defined by Canonical XML.
pub(crate) fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

/// Attribute value escaping as defined by Canonical XML.
pub(crate) fn escape_attr_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

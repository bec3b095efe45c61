//! JUnit XML reports: the unsigned input document and its summary.

use serde::{Deserialize, Serialize};

use crate::canonicalize::{canonicalize, ContentHash};
use crate::dsig::DSIG_NAMESPACE;
use crate::error::CanonicalizationError;
use crate::xml::{Document, NodeId, QName};

const PROPERTIES: &str = "properties";
const PROPERTY: &str = "property";

/// A JUnit XML document whose root is `testsuites` or `testsuite`.
#[derive(Debug, Clone)]
pub struct RawReport {
    doc: Document,
}

impl RawReport {
    pub fn parse(xml: &str) -> Result<Self, CanonicalizationError> {
        Self::from_document(Document::parse(xml)?)
    }

    pub fn from_bytes(xml: &[u8]) -> Result<Self, CanonicalizationError> {
        Self::from_document(Document::parse_bytes(xml)?)
    }

    pub fn from_document(doc: Document) -> Result<Self, CanonicalizationError> {
        let root = doc.root();
        let is_report = doc.element(root).is_some_and(|e| {
            e.name.prefix.is_none() && matches!(e.name.local.as_str(), "testsuites" | "testsuite")
        }) && doc.namespace_uri(root).is_none();
        if !is_report {
            let root_name = doc
                .element(root)
                .map(|e| e.name.to_string())
                .unwrap_or_default();
            return Err(CanonicalizationError::NotATestReport { root: root_name });
        }
        Ok(Self { doc })
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn into_document(self) -> Document {
        self.doc
    }

    /// Whether any XML-DSig `Signature` element is present.
    pub fn is_signed(&self) -> bool {
        !self.doc.find_all(Some(DSIG_NAMESPACE), "Signature").is_empty()
    }

    /// `(name, value)` pairs of the root's `<properties>`, in document order.
    pub fn properties(&self) -> Vec<(String, String)> {
        let Some(properties) = self.doc.find_child(self.doc.root(), PROPERTIES) else {
            return Vec::new();
        };
        self.doc
            .child_elements(properties)
            .filter_map(|id| {
                let element = self.doc.element(id)?;
                if element.name.prefix.is_some() || element.name.local != PROPERTY {
                    return None;
                }
                Some((
                    element.attribute("name")?.to_string(),
                    element.attribute("value").unwrap_or_default().to_string(),
                ))
            })
            .collect()
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.properties()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Set a root-level property, replacing every existing entry with that name.
    pub fn set_property(&mut self, name: &str, value: &str) {
        let properties = self.properties_element();
        let existing: Vec<NodeId> = self
            .doc
            .child_elements(properties)
            .filter(|id| {
                self.doc.element(*id).is_some_and(|e| {
                    e.name.prefix.is_none()
                        && e.name.local == PROPERTY
                        && e.attribute("name") == Some(name)
                })
            })
            .collect();

        let target = match existing.split_first() {
            Some((first, duplicates)) => {
                for duplicate in duplicates {
                    self.doc.detach(*duplicate);
                }
                *first
            }
            None => self.doc.append_element(properties, QName::new(PROPERTY)),
        };
        self.doc.set_attribute(target, QName::new("name"), name);
        self.doc.set_attribute(target, QName::new("value"), value);
    }

    /// The root's `<properties>` element, created as the first child if absent.
    fn properties_element(&mut self) -> NodeId {
        let root = self.doc.root();
        if let Some(existing) = self.doc.find_child(root, PROPERTIES) {
            return existing;
        }
        let properties = self.doc.create_element(QName::new(PROPERTIES));
        // Leaf roots may hold text; properties go in front of it.
        self.doc.insert_child(root, 0, properties);
        properties
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.doc.to_xml_bytes()
    }

    pub fn summary(&self) -> Result<ReportSummary, CanonicalizationError> {
        summarize(&self.doc)
    }
}

/// Aggregate counters of a report (the `inspect` operation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub suites: u64,
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
    pub signed: bool,
    pub canonical_hash: ContentHash,
}

/// Parse report bytes (signed or not) and summarize them.
pub fn inspect(xml: &[u8]) -> Result<ReportSummary, CanonicalizationError> {
    RawReport::from_bytes(xml)?.summary()
}

fn summarize(doc: &Document) -> Result<ReportSummary, CanonicalizationError> {
    let suites = doc.find_all(None, "testsuite");
    let mut summary = ReportSummary {
        suites: suites.len() as u64,
        tests: 0,
        failures: 0,
        errors: 0,
        skipped: 0,
        signed: !doc.find_all(Some(DSIG_NAMESPACE), "Signature").is_empty(),
        canonical_hash: canonicalize(doc)?.hash(),
    };
    for suite in suites {
        let counts = SuiteCounts::of(doc, suite);
        summary.tests += counts.tests;
        summary.failures += counts.failures;
        summary.errors += counts.errors;
        summary.skipped += counts.skipped;
    }
    Ok(summary)
}

struct SuiteCounts {
    tests: u64,
    failures: u64,
    errors: u64,
    skipped: u64,
}

impl SuiteCounts {
    /// Counters from the suite's attributes, falling back to counting its
    /// `testcase` children when an attribute is missing or unparsable.
    fn of(doc: &Document, suite: NodeId) -> Self {
        let attr = |name: &str| {
            doc.element(suite)
                .and_then(|e| e.attribute(name))
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let cases: Vec<NodeId> = doc
            .child_elements(suite)
            .filter(|id| doc.is_element(*id, None, "testcase"))
            .collect();
        let count_with = |outcome: &str| {
            cases
                .iter()
                .filter(|case| doc.find_child(**case, outcome).is_some())
                .count() as u64
        };
        Self {
            tests: attr("tests").unwrap_or(cases.len() as u64),
            failures: attr("failures").unwrap_or_else(|| count_with("failure")),
            errors: attr("errors").unwrap_or_else(|| count_with("error")),
            skipped: attr("skipped")
                .or_else(|| attr("skips"))
                .unwrap_or_else(|| count_with("skipped")),
        }
    }
}

impl std::fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Suites:         {}", self.suites)?;
        writeln!(f, "Tests:          {}", self.tests)?;
        writeln!(f, "Failures:       {}", self.failures)?;
        writeln!(f, "Errors:         {}", self.errors)?;
        writeln!(f, "Skipped:        {}", self.skipped)?;
        writeln!(f, "Signed:         {}", if self.signed { "yes" } else { "no" })?;
        write!(f, "Canonical Hash: {}", self.canonical_hash)
    }
}

//! Error types for canonicalization, metadata, keys, signing and verification.

use crate::verify::InvalidReason;

/// Canonicalization (and parsing) errors. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalizationError {
    /// XML syntax error reported by the parser.
    #[error("XML syntax error at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    /// Input is not valid UTF-8.
    #[error("invalid encoding: {message}")]
    InvalidEncoding { message: String },

    /// DTDs can define entities and are refused outright.
    #[error("document type declarations are not allowed")]
    DoctypeNotAllowed,

    #[error("unbound namespace prefix '{prefix}'")]
    UnboundPrefix { prefix: String },

    #[error("duplicate attribute '{name}'")]
    DuplicateAttribute { name: String },

    #[error("document has no root element")]
    MissingRoot,

    #[error("document has more than one root element")]
    MultipleRoots,

    #[error("character data outside the root element")]
    ContentOutsideRoot,

    /// Nesting exceeds the depth limit.
    #[error("nesting depth {depth} exceeds limit {limit}")]
    DepthExceeded { depth: usize, limit: usize },

    /// Input exceeds the size limit.
    #[error("input size {size} bytes exceeds limit {limit}")]
    InputTooLarge { size: usize, limit: usize },

    /// Root element is not `testsuites` or `testsuite`.
    #[error("not a JUnit report: root element is '{root}'")]
    NotATestReport { root: String },
}

impl CanonicalizationError {
    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "syntax",
            Self::InvalidEncoding { .. } => "invalid_encoding",
            Self::DoctypeNotAllowed => "doctype_not_allowed",
            Self::UnboundPrefix { .. } => "unbound_prefix",
            Self::DuplicateAttribute { .. } => "duplicate_attribute",
            Self::MissingRoot => "missing_root",
            Self::MultipleRoots => "multiple_roots",
            Self::ContentOutsideRoot => "content_outside_root",
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::InputTooLarge { .. } => "input_too_large",
            Self::NotATestReport { .. } => "not_a_test_report",
        }
    }
}

/// Metadata injection errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    /// Key contains characters outside `[A-Za-z0-9_.-]`.
    #[error("invalid metadata key '{key}'")]
    InvalidKey { key: String },

    /// An extra names a reserved namespace.
    #[error("metadata key '{key}' collides with reserved namespace '{namespace}'")]
    NamespaceCollision { key: String, namespace: String },
}

impl MetadataError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "invalid_key",
            Self::NamespaceCollision { .. } => "namespace_collision",
        }
    }
}

/// Key loading and generation errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Key or certificate file could not be read.
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    /// PEM is not a supported private key, public key or certificate.
    #[error("invalid key material: {message}")]
    InvalidKey { message: String },

    /// Key type parsed but not supported for signing.
    #[error("unsupported key type: {message}")]
    UnsupportedKeyType { message: String },

    #[error("invalid certificate: {message}")]
    InvalidCertificate { message: String },

    /// Certificate public key does not belong to the signing key.
    #[error("certificate does not match the signing key")]
    CertificateMismatch,

    #[error("key generation failed: {message}")]
    Generation { message: String },
}

impl KeyError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::InvalidKey { .. } => "invalid_key",
            Self::UnsupportedKeyType { .. } => "unsupported_key_type",
            Self::InvalidCertificate { .. } => "invalid_certificate",
            Self::CertificateMismatch => "certificate_mismatch",
            Self::Generation { .. } => "generation",
        }
    }
}

/// Signing errors. No partial artifact is produced when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),

    /// Report already carries a signature element.
    #[error("report is already signed")]
    AlreadySigned,

    /// The canonical form passed in does not belong to the report.
    #[error("canonical form does not match the report (expected {expected}, got {actual})")]
    CanonicalFormMismatch { expected: String, actual: String },

    /// Signature primitive failed.
    #[error("signature computation failed: {message}")]
    Crypto { message: String },
}

impl SigningError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Key(e) => e.kind(),
            Self::Canonicalization(e) => e.kind(),
            Self::AlreadySigned => "already_signed",
            Self::CanonicalFormMismatch { .. } => "canonical_form_mismatch",
            Self::Crypto { .. } => "crypto",
        }
    }
}

/// Verification failure as an error value.
///
/// Produced by [`crate::VerificationResult::into_result`]; verification
/// itself reports through the result enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("signature invalid ({kind}): {reason}")]
    Invalid { kind: InvalidReason, reason: String },

    #[error("malformed signed document: {reason}")]
    Malformed { reason: String },
}

impl VerificationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalid { kind, .. } => kind.as_str(),
            Self::Malformed { .. } => "malformed",
        }
    }

    /// Exit code for CLI, matching the registry's security band.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Invalid { .. } => 4,
            Self::Malformed { .. } => 1,
        }
    }
}

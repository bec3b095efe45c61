//! Enveloped XML-DSig verification.
//!
//! Verification never fails with an error value; every outcome is a
//! [`VerificationResult`]:
//!
//! - `Malformed`: the bytes are not XML, or the signature element is
//!   structurally broken (missing children, bad base64, stray content).
//! - `Invalid`: the structure is fine but the signature must not be trusted
//!   (see [`InvalidReason`]).
//! - `Valid`: digest and signature check out against the trusted key.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonicalize::{canonicalize, canonicalize_subtree, ContentHash};
use crate::dsig::{
    is_weak_algorithm, SignatureAlgorithm, CONTENT_C14N, DIGEST_SHA256, DSIG_NAMESPACE,
    ENVELOPED_SIGNATURE, EXC_C14N, KEY_INFO_ID,
};
use crate::error::VerificationError;
use crate::keys::TrustedKey;
use crate::xml::{Document, NodeId, NodeKind};

/// Why a structurally sound signature is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// No signature element.
    Unsigned,
    /// More than one signature element.
    DuplicateSignature,
    /// Signature is not a direct child of the root element.
    SignatureWrapping,
    /// References other than `URI=""` plus, with a KeyInfo, one to the KeyInfo.
    UnexpectedReference,
    UnexpectedTransforms,
    UnsupportedAlgorithm,
    /// SHA-1, MD5 and friends.
    WeakAlgorithm,
    /// Trusted key type does not match the declared algorithm.
    KeyMismatch,
    DigestMismatch,
    SignatureMismatch,
    /// Embedded certificate was altered, or does not match the trusted key or
    /// certificate.
    CertificateMismatch,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::DuplicateSignature => "duplicate_signature",
            Self::SignatureWrapping => "signature_wrapping",
            Self::UnexpectedReference => "unexpected_reference",
            Self::UnexpectedTransforms => "unexpected_transforms",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::WeakAlgorithm => "weak_algorithm",
            Self::KeyMismatch => "key_mismatch",
            Self::DigestMismatch => "digest_mismatch",
            Self::SignatureMismatch => "signature_mismatch",
            Self::CertificateMismatch => "certificate_mismatch",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of a valid signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedSignature {
    pub algorithm: SignatureAlgorithm,
    pub content_hash: ContentHash,
    pub certificate_embedded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Valid(VerifiedSignature),
    Invalid { kind: InvalidReason, reason: String },
    Malformed { reason: String },
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn into_result(self) -> Result<VerifiedSignature, VerificationError> {
        match self {
            Self::Valid(verified) => Ok(verified),
            Self::Invalid { kind, reason } => Err(VerificationError::Invalid { kind, reason }),
            Self::Malformed { reason } => Err(VerificationError::Malformed { reason }),
        }
    }
}

enum Failure {
    Invalid(InvalidReason, String),
    Malformed(String),
}

fn invalid(kind: InvalidReason, reason: impl Into<String>) -> Failure {
    Failure::Invalid(kind, reason.into())
}

fn malformed(reason: impl Into<String>) -> Failure {
    Failure::Malformed(reason.into())
}

/// Verify signed report bytes against trusted key material.
pub fn verify(signed: &[u8], trusted: &TrustedKey) -> VerificationResult {
    match verify_document(signed, trusted) {
        Ok(verified) => {
            tracing::debug!(
                hash = %verified.content_hash,
                algorithm = %verified.algorithm,
                "signature valid"
            );
            VerificationResult::Valid(verified)
        }
        Err(Failure::Invalid(kind, reason)) => {
            tracing::debug!(kind = %kind, reason = %reason, "signature invalid");
            VerificationResult::Invalid { kind, reason }
        }
        Err(Failure::Malformed(reason)) => {
            tracing::debug!(reason = %reason, "signed document malformed");
            VerificationResult::Malformed { reason }
        }
    }
}

fn verify_document(signed: &[u8], trusted: &TrustedKey) -> Result<VerifiedSignature, Failure> {
    let doc = Document::parse_bytes(signed).map_err(|e| malformed(e.to_string()))?;

    let signatures = doc.find_all(Some(DSIG_NAMESPACE), "Signature");
    let signature = match signatures.as_slice() {
        [] => return Err(invalid(InvalidReason::Unsigned, "document has no signature")),
        [one] => *one,
        many => {
            return Err(invalid(
                InvalidReason::DuplicateSignature,
                format!("document has {} signatures", many.len()),
            ))
        }
    };
    if doc.parent(signature) != Some(doc.root()) {
        return Err(invalid(
            InvalidReason::SignatureWrapping,
            "signature is not a direct child of the root element",
        ));
    }
    check_no_stray_nodes(&doc, signature)?;

    let parts = SignatureElements::locate(&doc, signature)?;
    let info = SignedInfoElements::locate(&doc, parts.signed_info)?;

    let c14n_method = algorithm_attr(&doc, info.canonicalization_method)?;
    if c14n_method != EXC_C14N {
        return Err(invalid(
            InvalidReason::UnsupportedAlgorithm,
            format!("unsupported canonicalization method '{c14n_method}'"),
        ));
    }

    let method = algorithm_attr(&doc, info.signature_method)?;
    let algorithm = SignatureAlgorithm::from_uri(method).ok_or_else(|| {
        if is_weak_algorithm(method) {
            invalid(
                InvalidReason::WeakAlgorithm,
                format!("weak signature algorithm '{method}'"),
            )
        } else {
            invalid(
                InvalidReason::UnsupportedAlgorithm,
                format!("unsupported signature algorithm '{method}'"),
            )
        }
    })?;

    let (content_reference, key_info_reference) =
        match (info.references.as_slice(), parts.key_info) {
            ([content], None) => (*content, None),
            ([content, key_ref], Some(key_info)) => (*content, Some((key_info, *key_ref))),
            (references, key_info) => {
                return Err(invalid(
                    InvalidReason::UnexpectedReference,
                    format!(
                        "expected {} Reference elements, found {}",
                        1 + usize::from(key_info.is_some()),
                        references.len()
                    ),
                ))
            }
        };
    let expected_digest = check_reference(
        &doc,
        content_reference,
        "",
        &[ENVELOPED_SIGNATURE, CONTENT_C14N],
    )?;
    let key_info_uri = format!("#{KEY_INFO_ID}");
    let key_info = match key_info_reference {
        Some((key_info, reference)) => Some((
            key_info,
            check_reference(&doc, reference, &key_info_uri, &[EXC_C14N])?,
        )),
        None => None,
    };

    if trusted.algorithm() != algorithm {
        return Err(invalid(
            InvalidReason::KeyMismatch,
            format!(
                "signature declares {algorithm} but the trusted key is {}",
                trusted.algorithm()
            ),
        ));
    }

    let content = canonicalize(&doc).map_err(|e| malformed(e.to_string()))?;
    let actual_digest = Sha256::digest(content.as_bytes());
    if actual_digest.as_slice() != expected_digest.as_slice() {
        return Err(invalid(
            InvalidReason::DigestMismatch,
            "document content does not match the signed digest",
        ));
    }

    let signature_value = decode_base64(&doc.text_content(parts.signature_value))
        .map_err(|e| malformed(format!("invalid SignatureValue: {e}")))?;
    let signed_info =
        canonicalize_subtree(&doc, parts.signed_info).map_err(|e| malformed(e.to_string()))?;
    if !trusted.verify_bytes(signed_info.as_bytes(), &signature_value) {
        return Err(invalid(
            InvalidReason::SignatureMismatch,
            "signature does not verify with the trusted key",
        ));
    }

    let certificate_embedded = match key_info {
        Some((key_info, expected_digest)) => {
            check_key_info_digest(&doc, key_info, &expected_digest)?;
            let der = embedded_certificate(&doc, key_info)?;
            trusted
                .accepts_certificate(&der)
                .map_err(|reason| invalid(InvalidReason::CertificateMismatch, reason))?;
            true
        }
        None => false,
    };

    Ok(VerifiedSignature {
        algorithm,
        content_hash: content.hash(),
        certificate_embedded,
    })
}

/// The signature subtree holds only elements, plus text in leaf elements.
fn check_no_stray_nodes(doc: &Document, signature: NodeId) -> Result<(), Failure> {
    for id in doc.descendants(signature) {
        match doc.kind(id) {
            NodeKind::Element(_) => {
                if doc.namespace_uri(id) != Some(DSIG_NAMESPACE) {
                    return Err(malformed("foreign element inside signature"));
                }
            }
            NodeKind::Text(_) => {
                let in_mixed_content = doc
                    .parent(id)
                    .is_some_and(|parent| doc.has_element_children(parent));
                if in_mixed_content {
                    return Err(malformed("unexpected text inside signature"));
                }
            }
            NodeKind::Comment(_) | NodeKind::ProcessingInstruction { .. } => {
                return Err(malformed("comment or processing instruction inside signature"));
            }
        }
    }
    Ok(())
}

struct SignatureElements {
    signed_info: NodeId,
    signature_value: NodeId,
    key_info: Option<NodeId>,
}

impl SignatureElements {
    fn locate(doc: &Document, signature: NodeId) -> Result<Self, Failure> {
        let children: Vec<NodeId> = doc.child_elements(signature).collect();
        let local = |id: NodeId| doc.element(id).map(|e| e.name.local.as_str());
        match children.as_slice() {
            [signed_info, signature_value]
                if local(*signed_info) == Some("SignedInfo")
                    && local(*signature_value) == Some("SignatureValue") =>
            {
                Ok(Self {
                    signed_info: *signed_info,
                    signature_value: *signature_value,
                    key_info: None,
                })
            }
            [signed_info, signature_value, key_info]
                if local(*signed_info) == Some("SignedInfo")
                    && local(*signature_value) == Some("SignatureValue")
                    && local(*key_info) == Some("KeyInfo") =>
            {
                Ok(Self {
                    signed_info: *signed_info,
                    signature_value: *signature_value,
                    key_info: Some(*key_info),
                })
            }
            _ => Err(malformed(
                "signature must contain SignedInfo, SignatureValue and optional KeyInfo",
            )),
        }
    }
}

struct SignedInfoElements {
    canonicalization_method: NodeId,
    signature_method: NodeId,
    references: Vec<NodeId>,
}

impl SignedInfoElements {
    fn locate(doc: &Document, signed_info: NodeId) -> Result<Self, Failure> {
        let children: Vec<NodeId> = doc.child_elements(signed_info).collect();
        let local = |id: &NodeId| doc.element(*id).map(|e| e.name.local.as_str());
        let [c14n, method, references @ ..] = children.as_slice() else {
            return Err(malformed("SignedInfo is incomplete"));
        };
        if local(c14n) != Some("CanonicalizationMethod") || local(method) != Some("SignatureMethod")
        {
            return Err(malformed("SignedInfo children out of order"));
        }
        if references.iter().any(|r| local(r) != Some("Reference")) {
            return Err(malformed("unexpected element in SignedInfo"));
        }
        if references.is_empty() {
            return Err(malformed("SignedInfo has no Reference"));
        }
        Ok(Self {
            canonicalization_method: *c14n,
            signature_method: *method,
            references: references.to_vec(),
        })
    }
}

/// Validate a reference against its expected URI and transforms, and
/// return its decoded digest.
fn check_reference(
    doc: &Document,
    reference: NodeId,
    expected_uri: &str,
    expected_transforms: &[&str],
) -> Result<Vec<u8>, Failure> {
    let uri = doc.element(reference).and_then(|e| e.attribute("URI"));
    if uri != Some(expected_uri) {
        return Err(invalid(
            InvalidReason::UnexpectedReference,
            format!("reference URI must be {expected_uri:?}, found {uri:?}"),
        ));
    }

    let children: Vec<NodeId> = doc.child_elements(reference).collect();
    let local = |id: &NodeId| doc.element(*id).map(|e| e.name.local.as_str());
    let [transforms, digest_method, digest_value] = children.as_slice() else {
        return Err(malformed(
            "Reference must contain Transforms, DigestMethod and DigestValue",
        ));
    };
    if local(transforms) != Some("Transforms")
        || local(digest_method) != Some("DigestMethod")
        || local(digest_value) != Some("DigestValue")
    {
        return Err(malformed("Reference children out of order"));
    }

    let mut declared = Vec::new();
    for transform in doc.child_elements(*transforms) {
        if local(&transform) != Some("Transform") || doc.has_element_children(transform) {
            return Err(invalid(
                InvalidReason::UnexpectedTransforms,
                "transforms may not carry parameters",
            ));
        }
        declared.push(algorithm_attr(doc, transform)?.to_string());
    }
    if declared != expected_transforms {
        return Err(invalid(
            InvalidReason::UnexpectedTransforms,
            format!("unexpected transforms {declared:?}"),
        ));
    }

    let digest_algorithm = algorithm_attr(doc, *digest_method)?;
    if digest_algorithm != DIGEST_SHA256 {
        let kind = if is_weak_algorithm(digest_algorithm) {
            InvalidReason::WeakAlgorithm
        } else {
            InvalidReason::UnsupportedAlgorithm
        };
        return Err(invalid(
            kind,
            format!("unsupported digest method '{digest_algorithm}'"),
        ));
    }

    let digest = decode_base64(&doc.text_content(*digest_value))
        .map_err(|e| malformed(format!("invalid DigestValue: {e}")))?;
    if digest.len() != 32 {
        return Err(invalid(
            InvalidReason::DigestMismatch,
            format!("digest has {} bytes, expected 32", digest.len()),
        ));
    }
    Ok(digest)
}

/// The KeyInfo carries the expected `Id` and hashes to its signed digest.
fn check_key_info_digest(
    doc: &Document,
    key_info: NodeId,
    expected: &[u8],
) -> Result<(), Failure> {
    let id = doc.element(key_info).and_then(|e| e.attribute("Id"));
    if id != Some(KEY_INFO_ID) {
        return Err(invalid(
            InvalidReason::UnexpectedReference,
            format!("KeyInfo Id must be {KEY_INFO_ID:?}, found {id:?}"),
        ));
    }
    let form = canonicalize_subtree(doc, key_info).map_err(|e| malformed(e.to_string()))?;
    if Sha256::digest(form.as_bytes()).as_slice() != expected {
        return Err(invalid(
            InvalidReason::CertificateMismatch,
            "KeyInfo does not match its signed digest",
        ));
    }
    Ok(())
}

fn embedded_certificate(doc: &Document, key_info: NodeId) -> Result<Vec<u8>, Failure> {
    let local = |id: NodeId| doc.element(id).map(|e| e.name.local.as_str());
    let children: Vec<NodeId> = doc.child_elements(key_info).collect();
    let [x509_data] = children.as_slice() else {
        return Err(malformed("KeyInfo must contain exactly one X509Data"));
    };
    let certs: Vec<NodeId> = doc.child_elements(*x509_data).collect();
    match certs.as_slice() {
        [cert]
            if local(*x509_data) == Some("X509Data")
                && local(*cert) == Some("X509Certificate") =>
        {
            decode_base64(&doc.text_content(*cert))
                .map_err(|e| malformed(format!("invalid X509Certificate: {e}")))
        }
        _ => Err(malformed("X509Data must contain exactly one X509Certificate")),
    }
}

fn algorithm_attr(doc: &Document, id: NodeId) -> Result<&str, Failure> {
    doc.element(id)
        .and_then(|e| e.attribute("Algorithm"))
        .ok_or_else(|| malformed("missing Algorithm attribute"))
}

fn decode_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64.decode(compact)
}

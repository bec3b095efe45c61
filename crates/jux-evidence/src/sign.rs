//! Enveloped XML-DSig signing.
//!
//! # Signing Process
//!
//! ```text
//! 1. Reject reports that already carry a ds:Signature
//! 2. Check the supplied canonical form against the report
//! 3. DigestValue   = base64(SHA-256(canonical form))
//! 4. Append ds:Signature (SignedInfo, empty SignatureValue, KeyInfo?) to the root
//! 5. With a certificate, add a Reference to #jux-key-info whose
//!    DigestValue = base64(SHA-256(exc-c14n(KeyInfo)))
//! 6. SignatureValue = base64(sign(exc-c14n(SignedInfo)))
//! 7. Serialize the document; those bytes are the artifact
//! ```
//!
//! Signing works on an owned report, so a failure never leaves a
//! half-signed document behind.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

use crate::canonicalize::{canonicalize, canonicalize_subtree, CanonicalForm, ContentHash};
use crate::dsig::{
    SignatureAlgorithm, CONTENT_C14N, DIGEST_SHA256, DSIG_NAMESPACE, DSIG_PREFIX,
    ENVELOPED_SIGNATURE, EXC_C14N, KEY_INFO_ID,
};
use crate::error::SigningError;
use crate::keys::SigningKey;
use crate::report::RawReport;
use crate::xml::{Document, NodeId, QName};

/// A signed report. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedArtifact {
    bytes: Vec<u8>,
    hash: ContentHash,
    algorithm: SignatureAlgorithm,
}

impl SignedArtifact {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Content hash of the canonical form the signature covers.
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }
}

/// Produces enveloped signatures with one key.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Load a PEM key and, optionally, a PEM certificate to embed.
    pub fn from_pem_files(
        key_path: impl AsRef<Path>,
        certificate_path: Option<&Path>,
    ) -> Result<Self, SigningError> {
        let mut key = SigningKey::from_pem_file(key_path)?;
        if let Some(path) = certificate_path {
            key = key.with_certificate_file(path)?;
        }
        Ok(Self::new(key))
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.key.algorithm()
    }

    /// Canonicalize and sign in one step.
    pub fn sign_report(&self, report: RawReport) -> Result<SignedArtifact, SigningError> {
        let form = canonicalize(report.document())?;
        self.sign(&form, report)
    }

    /// Sign `report`, whose canonical form is `form`.
    pub fn sign(
        &self,
        form: &CanonicalForm,
        report: RawReport,
    ) -> Result<SignedArtifact, SigningError> {
        if report.is_signed() {
            return Err(SigningError::AlreadySigned);
        }
        let expected = canonicalize(report.document())?;
        if expected != *form {
            return Err(SigningError::CanonicalFormMismatch {
                expected: expected.hash().to_string(),
                actual: form.hash().to_string(),
            });
        }

        let hash = form.hash();
        let digest = Sha256::digest(form.as_bytes());
        let algorithm = self.key.algorithm();

        let mut doc = report.into_document();
        let parts = append_signature(&mut doc, algorithm, &BASE64.encode(digest));

        if let Some(der) = self.key.certificate_der() {
            let key_info = doc.append_element(parts.signature, ds("KeyInfo"));
            doc.set_attribute(key_info, QName::new("Id"), KEY_INFO_ID);
            let x509_data = doc.append_element(key_info, ds("X509Data"));
            let certificate = doc.append_element(x509_data, ds("X509Certificate"));
            doc.set_text(certificate, BASE64.encode(der));

            let key_info_form = canonicalize_subtree(&doc, key_info)?;
            let key_info_digest = Sha256::digest(key_info_form.as_bytes());
            append_reference(
                &mut doc,
                parts.signed_info,
                &format!("#{KEY_INFO_ID}"),
                &[EXC_C14N],
                &BASE64.encode(key_info_digest),
            );
        }

        let signed_info = canonicalize_subtree(&doc, parts.signed_info)?;
        let signature = self
            .key
            .sign_bytes(signed_info.as_bytes())
            .map_err(|message| SigningError::Crypto { message })?;
        doc.set_text(parts.signature_value, BASE64.encode(signature));

        tracing::debug!(hash = %hash, algorithm = %algorithm, "signed report");
        Ok(SignedArtifact {
            bytes: doc.to_xml_bytes(),
            hash,
            algorithm,
        })
    }
}

struct SignatureParts {
    signature: NodeId,
    signed_info: NodeId,
    signature_value: NodeId,
}

fn ds(local: &str) -> QName {
    QName::prefixed(DSIG_PREFIX, local)
}

fn append_signature(
    doc: &mut Document,
    algorithm: SignatureAlgorithm,
    digest_b64: &str,
) -> SignatureParts {
    let root = doc.root();
    let signature = doc.append_element(root, ds("Signature"));
    doc.declare_namespace(signature, Some(DSIG_PREFIX), DSIG_NAMESPACE);

    let signed_info = doc.append_element(signature, ds("SignedInfo"));
    let c14n = doc.append_element(signed_info, ds("CanonicalizationMethod"));
    doc.set_attribute(c14n, QName::new("Algorithm"), EXC_C14N);
    let method = doc.append_element(signed_info, ds("SignatureMethod"));
    doc.set_attribute(method, QName::new("Algorithm"), algorithm.uri());

    append_reference(
        doc,
        signed_info,
        "",
        &[ENVELOPED_SIGNATURE, CONTENT_C14N],
        digest_b64,
    );

    let signature_value = doc.append_element(signature, ds("SignatureValue"));

    SignatureParts {
        signature,
        signed_info,
        signature_value,
    }
}

fn append_reference(
    doc: &mut Document,
    signed_info: NodeId,
    uri: &str,
    transform_uris: &[&str],
    digest_b64: &str,
) {
    let reference = doc.append_element(signed_info, ds("Reference"));
    doc.set_attribute(reference, QName::new("URI"), uri);
    let transforms = doc.append_element(reference, ds("Transforms"));
    for algorithm in transform_uris {
        let transform = doc.append_element(transforms, ds("Transform"));
        doc.set_attribute(transform, QName::new("Algorithm"), *algorithm);
    }
    let digest_method = doc.append_element(reference, ds("DigestMethod"));
    doc.set_attribute(digest_method, QName::new("Algorithm"), DIGEST_SHA256);
    let digest_value = doc.append_element(reference, ds("DigestValue"));
    doc.set_text(digest_value, digest_b64);
}

//! Canonical, signed, tamper-evident JUnit XML test reports.
//!
//! This crate covers the document side of the Jux pipeline:
//!
//! - Arena XML document model with a hardened parser
//! - Exclusive canonicalization and SHA-256 content addressing
//! - Metadata capture (env, git, CI, project, extras) and injection
//! - Enveloped XML-DSig signing (RSA, ECDSA P-256, Ed25519) and verification
//! - Report inspection and key generation
//!
//! # Quick Start
//!
//! ```no_run
//! use jux_evidence::{
//!     canonicalize, generate_signing_key, verify, DetectOptions, KeyAlgorithm,
//!     MetadataInjector, RawReport, Signer,
//! };
//!
//! # fn example() -> anyhow::Result<()> {
//! let mut report = RawReport::parse(&std::fs::read_to_string("junit.xml")?)?;
//! MetadataInjector::detect(DetectOptions::default()).inject(&mut report)?;
//!
//! let key = generate_signing_key(KeyAlgorithm::Ed25519)?;
//! let trusted = key.trusted_key();
//! let form = canonicalize(report.document())?;
//! let artifact = Signer::new(key).sign(&form, report)?;
//!
//! assert!(verify(artifact.bytes(), &trusted).is_valid());
//! println!("stored as {}", artifact.hash());
//! # Ok(())
//! # }
//! ```

pub mod canonicalize;
pub mod dsig;
pub mod error;
pub mod keys;
pub mod metadata;
pub mod report;
pub mod sign;
pub mod verify;
pub mod xml;

pub use canonicalize::{
    canonicalize, canonicalize_subtree, hash, CanonicalForm, ContentHash, ContentHashParseError,
};
pub use dsig::SignatureAlgorithm;
pub use error::{CanonicalizationError, KeyError, MetadataError, SigningError, VerificationError};
pub use keys::{generate_signing_key, KeyAlgorithm, SigningKey, TrustedKey};
pub use metadata::{
    CiProvider, DetectOptions, EnvSnapshot, EnvironmentProvider, GitProvider, Metadata,
    MetadataInjector, MetadataProvider, Namespace, ProjectProvider, StaticProvider,
};
pub use report::{inspect, RawReport, ReportSummary};
pub use sign::{SignedArtifact, Signer};
pub use verify::{verify, InvalidReason, VerificationResult, VerifiedSignature};
pub use xml::Document;

//! XML-DSig identifiers and the signature algorithms we accept.

use serde::{Deserialize, Serialize};

pub const DSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const DSIG_PREFIX: &str = "ds";

/// Exclusive XML Canonicalization 1.0, without comments.
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Enveloped-signature transform.
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// Content canonicalization: exclusive C14N with normalized namespace prefixes.
pub const CONTENT_C14N: &str = "urn:jux:c14n:exc-normalized-prefixes:1";

/// `Id` of the embedded `ds:KeyInfo`, signed through a second reference.
pub const KEY_INFO_ID: &str = "jux-key-info";

pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
const EDDSA_ED25519: &str = "http://www.w3.org/2021/04/xmldsig-more#eddsa-ed25519";

/// Algorithm URIs that are recognized but refused.
const WEAK_ALGORITHMS: &[&str] = &[
    "http://www.w3.org/2000/09/xmldsig#sha1",
    "http://www.w3.org/2001/04/xmldsig-more#md5",
    "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
    "http://www.w3.org/2000/09/xmldsig#dsa-sha1",
    "http://www.w3.org/2000/09/xmldsig#hmac-sha1",
    "http://www.w3.org/2001/04/xmldsig-more#rsa-md5",
    "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha1",
    "http://www.w3.org/2001/04/xmldsig-more#hmac-md5",
];

pub(crate) fn is_weak_algorithm(uri: &str) -> bool {
    WEAK_ALGORITHMS.contains(&uri)
}

/// Signature algorithm of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    RsaSha256,
    EcdsaSha256,
    #[serde(rename = "eddsa-ed25519")]
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::RsaSha256 => RSA_SHA256,
            Self::EcdsaSha256 => ECDSA_SHA256,
            Self::Ed25519 => EDDSA_ED25519,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            RSA_SHA256 => Some(Self::RsaSha256),
            ECDSA_SHA256 => Some(Self::EcdsaSha256),
            EDDSA_ED25519 => Some(Self::Ed25519),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-sha256",
            Self::EcdsaSha256 => "ecdsa-sha256",
            Self::Ed25519 => "eddsa-ed25519",
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

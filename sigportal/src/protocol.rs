// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Types exchanged with the signing portal.
//!
//! The portal speaks JSON with camelCase field names. Binary values (certificates, data to be
//! signed, signatures) are standard base64 strings.

use std::time::Duration;

use asn1::{ObjectIdentifier, oid};
use openssl::{
    hash::MessageDigest,
    md::{Md, MdRef},
};
use serde::{Deserialize, Serialize};

// Algorithm identifiers for RSA PKCS v1.5 DigestInfo structures.
// SHA OID references: https://www.ietf.org/rfc/rfc4055.html#section-6
const OID_SHA256: ObjectIdentifier = oid!(2, 16, 840, 1, 101, 3, 4, 2, 1);
const OID_SHA384: ObjectIdentifier = oid!(2, 16, 840, 1, 101, 3, 4, 2, 2);
const OID_SHA512: ObjectIdentifier = oid!(2, 16, 840, 1, 101, 3, 4, 2, 3);

/// The kind of work the portal is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Select a certificate (and its key) for later signing.
    GetCertificate,
    /// Produce a signature with a previously selected key.
    Sign,
    /// Do nothing; the portal is waiting on something else.
    Wait,
    /// Any operation this agent doesn't know about.
    #[serde(other)]
    Unknown,
}

/// A unit of work handed to the agent by the portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub operation: Operation,
    /// Human-readable description shown in the progress notification.
    #[serde(default)]
    pub description: String,
    pub session: SessionValue,
    /// Smart cards the portal knows how to drive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smartcards: Option<Vec<SmartcardDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_filter: Option<CertificateFilter>,
    /// The token holding the key to sign with; set on `SIGN` requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// The key to sign with; set on `SIGN` requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// The digest to sign; set on `SIGN` requests.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes::option"
    )]
    pub to_be_signed: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_algorithm: Option<DigestAlgorithm>,
    /// The portal's current hardware support dataset, which the agent stores locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_hardware: Option<serde_json::Value>,
}

/// Proof that a work request was issued by the portal for a particular exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionValue {
    /// Formatted as `<opaque id>+<milliseconds since the Unix epoch>`.
    pub session_id: String,
    /// Base64-encoded raw RSA signature over the SHA-512 digest of `session_id`.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartcardDescriptor {
    /// The card's answer-to-reset, hex-encoded.
    pub atr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The PKCS #11 module the card works with, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs11_library: Option<String>,
}

/// Constraints on which certificates the portal is willing to accept.
///
/// Each enabled constraint is checked independently; see [`crate::filter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateFilter {
    pub allow_expired: bool,
    /// DER-encoded certificate of the CA that must have issued the certificate.
    #[serde(skip_serializing_if = "Option::is_none", with = "base64_bytes::option")]
    pub issuer_certificate: Option<Vec<u8>>,
    /// Hex-encoded SHA-256 fingerprint of the exact certificate to use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_sha256: Option<String>,
    pub non_repudiation_bit: bool,
    pub digital_signature_bit: bool,
}

/// Digest algorithms the portal may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// All supported algorithms, strongest last.
    pub const ALL: [DigestAlgorithm; 3] = [
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];

    /// The digest size in bytes.
    pub fn size(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// The digest for use with `PkeyCtx`.
    pub(crate) fn md(&self) -> &'static MdRef {
        match self {
            DigestAlgorithm::Sha256 => Md::sha256(),
            DigestAlgorithm::Sha384 => Md::sha384(),
            DigestAlgorithm::Sha512 => Md::sha512(),
        }
    }

    pub(crate) fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha256 => OID_SHA256,
            DigestAlgorithm::Sha384 => OID_SHA384,
            DigestAlgorithm::Sha512 => OID_SHA512,
        }
    }
}

impl From<DigestAlgorithm> for MessageDigest {
    fn from(value: DigestAlgorithm) -> Self {
        match value {
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// Why an [`Execution`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UserCancelled,
    InvalidSession,
    NoProductFound,
    NoKeyFound,
    TokenFailure,
    InvalidRequest,
    Failure,
}

/// Context the portal records about the agent that did the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInfo {
    pub agent_version: String,
    pub os_name: String,
    pub os_arch: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

impl AuditInfo {
    /// Audit information for this agent, for work that took `duration`.
    pub fn new(duration: Duration, product: Option<String>) -> Self {
        Self {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            os_name: std::env::consts::OS.to_string(),
            os_arch: std::env::consts::ARCH.to_string(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            product,
        }
    }
}

/// The outcome of a [`WorkRequest`], posted back to the portal as-is.
///
/// Failures carry an [`ErrorCode`] and a short message. Error details stay in the local logs;
/// the agent never fills in `exceptionTrace`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_info: Option<AuditInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl<T> Execution<T> {
    pub fn success(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_code: None,
            error_message: None,
            exception_trace: None,
            audit_info: None,
            step_id: None,
        }
    }

    pub fn failure(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error_code: Some(error_code),
            error_message: Some(message.into()),
            exception_trace: None,
            audit_info: None,
            step_id: None,
        }
    }

    pub fn with_step_id(mut self, step_id: Option<String>) -> Self {
        self.step_id = step_id;
        self
    }

    pub fn with_audit_info(mut self, audit_info: AuditInfo) -> Self {
        self.audit_info = Some(audit_info);
        self
    }
}

impl<T: Serialize> Execution<T> {
    /// Erase the result type so executions of different operations can be handled uniformly.
    pub fn into_json(self) -> Result<Execution<serde_json::Value>, serde_json::Error> {
        let result = self.result.map(serde_json::to_value).transpose()?;
        Ok(Execution {
            success: self.success,
            result,
            error_code: self.error_code,
            error_message: self.error_message,
            exception_trace: self.exception_trace,
            audit_info: self.audit_info,
            step_id: self.step_id,
        })
    }
}

/// The result of a `GET_CERTIFICATE` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateResult {
    pub token_id: String,
    pub key_id: String,
    #[serde(with = "base64_bytes")]
    pub certificate: Vec<u8>,
    #[serde(with = "base64_bytes::list")]
    pub certificate_chain: Vec<Vec<u8>>,
    /// `RSA` or `ECDSA`.
    pub encryption_algorithm: String,
    pub supported_digests: Vec<DigestAlgorithm>,
}

/// The result of a `SIGN` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResult {
    #[serde(with = "base64_bytes")]
    pub signature_value: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub certificate: Vec<u8>,
    #[serde(with = "base64_bytes::list")]
    pub certificate_chain: Vec<Vec<u8>>,
}

/// Used for RSA PKCS1 v1.5 signatures.
/// Reference: https://www.ietf.org/rfc/rfc8017.html#section-9.2
#[derive(asn1::Asn1Write, asn1::Asn1Read)]
struct DigestInfo<'a> {
    digest_algorithm: AlgorithmIdentifier,
    digest: &'a [u8],
}

#[derive(asn1::Asn1Write, asn1::Asn1Read)]
struct AlgorithmIdentifier {
    algorithm: ObjectIdentifier,
    parameters: (),
}

/// Encode a digest into a DigestInfo structure for RSA PKCS #1 v1.5 signatures.
pub(crate) fn encode_digest_info(
    algorithm: DigestAlgorithm,
    digest: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let digest_info = DigestInfo {
        digest_algorithm: AlgorithmIdentifier {
            algorithm: algorithm.oid(),
            parameters: (),
        },
        digest,
    };

    asn1::write_single(&digest_info)
        .map_err(|e| anyhow::anyhow!("Failed to encode DigestInfo: {e}"))
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => super::serialize(bytes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    pub mod list {
        use serde::ser::SerializeSeq;

        use super::*;

        pub fn serialize<S: Serializer>(
            list: &[Vec<u8>],
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(list.len()))?;
            for bytes in list {
                seq.serialize_element(&STANDARD.encode(bytes))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<Vec<u8>>, D::Error> {
            Vec::<String>::deserialize(deserializer)?
                .into_iter()
                .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn sign_execution_keeps_step_and_error() -> Result<()> {
        let execution: Execution<SignatureResult> =
            Execution::failure(ErrorCode::UserCancelled, "the PIN prompt was dismissed")
                .with_step_id(Some("step-7".into()));

        let json = serde_json::to_value(&execution)?;
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], "USER_CANCELLED");
        assert_eq!(json["stepId"], "step-7");
        assert!(json.get("exceptionTrace").is_none());

        let parsed: Execution<SignatureResult> = serde_json::from_value(json)?;
        assert_eq!(parsed, execution);
        Ok(())
    }

    #[test]
    fn work_request_from_portal_json() -> Result<()> {
        let body = r#"{
            "operation": "SIGN",
            "description": "Sign contract.pdf",
            "session": {"sessionId": "abc+1700000000000", "signature": "AAEC"},
            "stepId": "s1",
            "tokenId": "token",
            "keyId": "0a0b",
            "toBeSigned": "3q2+7w==",
            "digestAlgorithm": "SHA256",
            "certificateFilter": {"nonRepudiationBit": true}
        }"#;

        let request: WorkRequest = serde_json::from_str(body)?;
        assert_eq!(request.operation, Operation::Sign);
        assert_eq!(request.to_be_signed.as_deref(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
        assert_eq!(request.digest_algorithm, Some(DigestAlgorithm::Sha256));
        let filter = request.certificate_filter.expect("filter is present");
        assert!(filter.non_repudiation_bit);
        assert!(!filter.allow_expired);
        assert!(request.smartcards.is_none());
        Ok(())
    }

    #[test]
    fn unknown_operations_parse() -> Result<()> {
        let operation: Operation = serde_json::from_str("\"ENCRYPT\"")?;
        assert_eq!(operation, Operation::Unknown);
        Ok(())
    }

    #[test]
    fn digest_info_matches_openssl() -> Result<()> {
        let digest = openssl::hash::hash(MessageDigest::sha256(), b"data")?;
        let encoded = encode_digest_info(DigestAlgorithm::Sha256, &digest)?;

        // The fixed SHA-256 prefix from RFC 8017, section 9.2, note 1.
        let prefix = hex::decode("3031300d060960864801650304020105000420")?;
        assert_eq!(&encoded[..prefix.len()], prefix.as_slice());
        assert_eq!(&encoded[prefix.len()..], &digest[..]);
        Ok(())
    }
}

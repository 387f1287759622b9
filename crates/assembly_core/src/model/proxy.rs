//! Proxy (delegation) records and one-time code challenges.
//!
//! # Responsibility
//! - Define delegation type/status tags and their storage names.
//! - Describe which evidence each delegation type requires.
//!
//! # Invariants
//! - At most one `ProxyStatus::Approved` proxy per principal.
//! - An approved proxy created through a complete registration always has an
//!   `evidence_ref`; a missing one marks an interrupted write.

use crate::model::holder::Representative;
use crate::model::{ChallengeId, MemberId, ProxyId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// How the principal signed the delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationType {
    /// Signed in-app, confirmed with a one-time code.
    SignedDigital,
    /// Paper form without a specific agenda.
    SignedDocumentGeneric,
    /// Paper form naming specific agenda items.
    SignedDocumentSpecific,
    /// Free-form document uploaded by the principal.
    UploadedDocument,
}

impl DelegationType {
    pub const ALL: [DelegationType; 4] = [
        Self::SignedDigital,
        Self::SignedDocumentGeneric,
        Self::SignedDocumentSpecific,
        Self::UploadedDocument,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SignedDigital => "signed_digital",
            Self::SignedDocumentGeneric => "signed_document_generic",
            Self::SignedDocumentSpecific => "signed_document_specific",
            Self::UploadedDocument => "uploaded_document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Evidence method this type must be registered with.
    pub fn required_method(self) -> VerificationMethod {
        match self {
            Self::SignedDigital => VerificationMethod::OneTimeCode,
            Self::SignedDocumentGeneric
            | Self::SignedDocumentSpecific
            | Self::UploadedDocument => VerificationMethod::Document,
        }
    }
}

/// Delegation lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyStatus {
    Pending,
    Approved,
    Rejected,
    Revoked,
}

impl ProxyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Identity verification method recorded on a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    OneTimeCode,
    Document,
}

impl VerificationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneTimeCode => "one_time_code",
            Self::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "one_time_code" => Some(Self::OneTimeCode),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

/// Evidence supplied with a registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    /// A challenge the principal already verified with the correct code.
    VerifiedCode(ChallengeId),
    /// Locator of an attached document or photo held by external storage.
    Document { locator: String },
}

impl Evidence {
    pub fn method(&self) -> VerificationMethod {
        match self {
            Self::VerifiedCode(_) => VerificationMethod::OneTimeCode,
            Self::Document { .. } => VerificationMethod::Document,
        }
    }

    /// Reference stored in `proxies.evidence_ref`.
    pub fn reference(&self) -> String {
        match self {
            Self::VerifiedCode(challenge) => format!("otp:{challenge}"),
            Self::Document { locator } => locator.trim().to_string(),
        }
    }
}

/// Delegation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub uuid: ProxyId,
    pub principal: MemberId,
    pub representative: Representative,
    pub kind: DelegationType,
    pub status: ProxyStatus,
    pub evidence_ref: Option<String>,
    pub verification_method: Option<VerificationMethod>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Proxy {
    /// Builds a new proxy row with a generated id.
    pub fn new(
        principal: MemberId,
        representative: Representative,
        kind: DelegationType,
        status: ProxyStatus,
        evidence: Option<&Evidence>,
        now_ms: i64,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            principal,
            representative,
            kind,
            status,
            evidence_ref: evidence.map(Evidence::reference),
            verification_method: evidence.map(Evidence::method),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

/// One-time code attempt keyed by (principal, attempt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationChallenge {
    pub uuid: ChallengeId,
    pub principal: MemberId,
    /// `hash_code(uuid, code)`; the plain code is never stored.
    pub code_hash: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub failed_attempts: u32,
    pub verified_at: Option<i64>,
    pub consumed_at: Option<i64>,
    pub superseded: bool,
}

impl VerificationChallenge {
    /// Open means it can still be verified or consumed.
    pub fn is_open(&self) -> bool {
        !self.superseded && self.consumed_at.is_none()
    }

    pub fn matches(&self, code: &str) -> bool {
        hash_code(self.uuid, code) == self.code_hash
    }
}

/// SHA-256 of a one-time code salted with its attempt id, lowercase hex.
pub fn hash_code(attempt: ChallengeId, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(attempt.as_bytes());
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-principal delegation state machine position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationState {
    /// Principal holds the rights of all owned units.
    NoDelegation,
    /// Evidence is being collected; nothing transferred yet.
    PendingVerification {
        challenge: Option<ChallengeId>,
        pending_proxy: Option<ProxyId>,
    },
    /// Rights moved to the representative of this approved proxy.
    Delegated(Proxy),
}

#[cfg(test)]
mod tests {
    use super::{
        hash_code, DelegationType, Evidence, ProxyStatus, VerificationChallenge,
        VerificationMethod,
    };
    use uuid::Uuid;

    #[test]
    fn delegation_type_names_parse_back() {
        for kind in DelegationType::ALL {
            assert_eq!(DelegationType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(DelegationType::parse("PDF"), None);
    }

    #[test]
    fn only_digital_type_uses_one_time_codes() {
        assert_eq!(
            DelegationType::SignedDigital.required_method(),
            VerificationMethod::OneTimeCode
        );
        assert_eq!(
            DelegationType::UploadedDocument.required_method(),
            VerificationMethod::Document
        );
    }

    #[test]
    fn evidence_reference_is_stable() {
        let challenge = Uuid::new_v4();
        assert_eq!(
            Evidence::VerifiedCode(challenge).reference(),
            format!("otp:{challenge}")
        );
        let doc = Evidence::Document {
            locator: "  proxies/abc.pdf ".to_string(),
        };
        assert_eq!(doc.reference(), "proxies/abc.pdf");
        assert_eq!(ProxyStatus::parse("approved"), Some(ProxyStatus::Approved));
    }

    #[test]
    fn code_hash_is_salted_per_attempt() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let hash = hash_code(first, "123456");
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("123456"));
        assert_ne!(hash, hash_code(second, "123456"));

        let challenge = VerificationChallenge {
            uuid: first,
            principal: Uuid::new_v4(),
            code_hash: hash,
            issued_at: 0,
            expires_at: 1,
            failed_attempts: 0,
            verified_at: None,
            consumed_at: None,
            superseded: false,
        };
        assert!(challenge.matches("123456"));
        assert!(!challenge.matches("123457"));
    }
}

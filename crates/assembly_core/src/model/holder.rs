//! Rights holder and representative variants.
//!
//! # Responsibility
//! - Model who may exercise a unit's voting rights at a point in time.
//! - Normalize identity fields of external (unregistered) representatives.
//!
//! # Invariants
//! - A unit always has exactly one `RightsHolder`.
//! - `Representative::External` carries a non-blank name and a normalized
//!   document number.

use crate::model::{MemberId, ModelValidationError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static DOCUMENT_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Z-]{4,20}$").expect("valid document number regex"));
static DOCUMENT_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s.]+").expect("valid document separator regex"));

/// Party that can receive delegated rights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Representative {
    /// Registered member with an account.
    Internal { member: MemberId },
    /// Unregistered person identified only by name and document number.
    External {
        name: String,
        document_number: String,
    },
}

impl Representative {
    /// Builds an external representative with trimmed name and normalized
    /// document number.
    pub fn external(
        name: impl Into<String>,
        document_number: &str,
    ) -> Result<Self, ModelValidationError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ModelValidationError::BlankField("representative.name"));
        }
        Ok(Self::External {
            name,
            document_number: normalize_document_number(document_number)?,
        })
    }

    /// Checks field-level invariants for persisted or caller-built values.
    pub fn validate(&self) -> Result<(), ModelValidationError> {
        match self {
            Self::Internal { .. } => Ok(()),
            Self::External {
                name,
                document_number,
            } => {
                if name.trim().is_empty() {
                    return Err(ModelValidationError::BlankField("representative.name"));
                }
                if !DOCUMENT_NUMBER_RE.is_match(document_number) {
                    return Err(ModelValidationError::InvalidDocumentNumber(
                        document_number.clone(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Returns the member id when this representative has an account.
    pub fn member(&self) -> Option<MemberId> {
        match self {
            Self::Internal { member } => Some(*member),
            Self::External { .. } => None,
        }
    }
}

/// Current holder of a unit's exercise rights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "holder", rename_all = "snake_case")]
pub enum RightsHolder {
    /// The owner holds the rights (no active delegation).
    Principal { member: MemberId },
    /// Rights were delegated through an approved proxy.
    Representative { representative: Representative },
}

impl RightsHolder {
    pub fn principal(member: MemberId) -> Self {
        Self::Principal { member }
    }

    pub fn delegated(representative: Representative) -> Self {
        Self::Representative { representative }
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self, Self::Representative { .. })
    }
}

/// Normalizes a document number: strips whitespace and dots, uppercases and
/// checks the allowed shape.
pub fn normalize_document_number(value: &str) -> Result<String, ModelValidationError> {
    let compact = DOCUMENT_SEPARATOR_RE
        .replace_all(value.trim(), "")
        .to_ascii_uppercase();
    if compact.is_empty() {
        return Err(ModelValidationError::BlankField("document_number"));
    }
    if !DOCUMENT_NUMBER_RE.is_match(&compact) {
        return Err(ModelValidationError::InvalidDocumentNumber(
            value.trim().to_string(),
        ));
    }
    Ok(compact)
}

//! Assembly, member, unit and attendance records.
//!
//! # Responsibility
//! - Define the entities quorum and vote weighting are computed over.
//! - Validate unit weights and holder consistency before persistence.
//!
//! # Invariants
//! - `Unit::coefficient` is finite and strictly positive.
//! - `RightsHolder::Principal` on a unit always names the unit owner.
//! - Units are never deleted while their assembly exists.

use crate::model::holder::{normalize_document_number, RightsHolder};
use crate::model::{AssemblyId, MemberId, ModelValidationError, UnitId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A quorum-based meeting scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assembly {
    pub uuid: AssemblyId,
    pub name: String,
    pub created_at: i64,
}

impl Assembly {
    pub fn new(name: impl Into<String>, created_at: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            created_at,
        }
    }
}

/// Registered identity. Acts as principal (owner) and/or internal
/// representative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub uuid: MemberId,
    pub full_name: String,
    /// Normalized through `normalize_document_number`.
    pub document_number: String,
}

impl Member {
    /// Creates a member with a generated id and normalized document number.
    pub fn new(
        full_name: impl Into<String>,
        document_number: &str,
    ) -> Result<Self, ModelValidationError> {
        let full_name = full_name.into().trim().to_string();
        if full_name.is_empty() {
            return Err(ModelValidationError::BlankField("member.full_name"));
        }
        Ok(Self {
            uuid: Uuid::new_v4(),
            full_name,
            document_number: normalize_document_number(document_number)?,
        })
    }
}

/// Voting entity with a fixed weight in quorum and vote totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub uuid: UnitId,
    pub assembly: AssemblyId,
    /// Display number, e.g. apartment label.
    pub number: String,
    pub coefficient: f64,
    /// Default rights holder.
    pub owner: MemberId,
    /// Who may exercise the unit's rights right now.
    pub rights_holder: RightsHolder,
}

impl Unit {
    /// Creates a unit held by its owner.
    pub fn new(
        assembly: AssemblyId,
        number: impl Into<String>,
        coefficient: f64,
        owner: MemberId,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            assembly,
            number: number.into(),
            coefficient,
            owner,
            rights_holder: RightsHolder::principal(owner),
        }
    }

    /// Checks weight, label and holder invariants.
    pub fn validate(&self) -> Result<(), ModelValidationError> {
        if self.number.trim().is_empty() {
            return Err(ModelValidationError::BlankField("unit.number"));
        }
        validate_coefficient(self.coefficient)?;
        match &self.rights_holder {
            RightsHolder::Principal { member } if *member != self.owner => {
                Err(ModelValidationError::InconsistentHolder(self.uuid))
            }
            RightsHolder::Representative { representative } => {
                if representative.member() == Some(self.owner) {
                    return Err(ModelValidationError::InconsistentHolder(self.uuid));
                }
                representative.validate()
            }
            RightsHolder::Principal { .. } => Ok(()),
        }
    }
}

/// Rejects coefficients that cannot weight a unit.
pub fn validate_coefficient(value: f64) -> Result<(), ModelValidationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ModelValidationError::InvalidCoefficient(value))
    }
}

/// First check-in of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub unit: UnitId,
    pub checked_in_at: i64,
}

//! Domain model for assemblies, delegations and votes.
//!
//! # Responsibility
//! - Define canonical data structures used by core business logic.
//! - Provide field-level validation shared by repositories and services.
//!
//! # Invariants
//! - Every entity is identified by a stable UUID.
//! - Units are the root: proxies, attendance and ballots all point at them.
//! - Timestamps are Unix epoch milliseconds.

use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod assembly;
pub mod holder;
pub mod proxy;
pub mod vote;

pub type AssemblyId = Uuid;
pub type MemberId = Uuid;
pub type UnitId = Uuid;
pub type ProxyId = Uuid;
pub type ChallengeId = Uuid;
pub type VoteId = Uuid;
pub type OptionId = Uuid;
pub type BallotId = Uuid;

/// Field-level validation failure for model values.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelValidationError {
    /// Required text field is empty after trim.
    BlankField(&'static str),
    /// Coefficient is not a finite positive number.
    InvalidCoefficient(f64),
    /// Document number has an unsupported shape.
    InvalidDocumentNumber(String),
    /// Rights holder stored on a unit contradicts its owner.
    InconsistentHolder(UnitId),
}

impl Display for ModelValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankField(field) => write!(f, "{field} must not be blank"),
            Self::InvalidCoefficient(value) => {
                write!(f, "coefficient must be finite and greater than zero, got {value}")
            }
            Self::InvalidDocumentNumber(value) => {
                write!(f, "invalid document number `{value}`")
            }
            Self::InconsistentHolder(unit) => {
                write!(f, "unit {unit} names its owner through a delegated holder")
            }
        }
    }
}

impl Error for ModelValidationError {}

//! Attendance and coefficient-weighted quorum.
//!
//! # Invariants
//! - Quorum is recomputed from units and attendance on every call; nothing is
//!   cached between calls.
//! - The denominator is the coefficient sum of the assembly's units, and the
//!   fraction is 0 when that sum is 0.
//! - Attendance belongs to the unit, whoever checked it in.

use crate::model::assembly::{AttendanceRecord, Unit};
use crate::model::{AssemblyId, UnitId};
use crate::notify::StateChange;
use crate::repo::unit_repo::UnitRepository;
use crate::service::{ServiceContext, ServiceError, ServiceResult};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuorumStatus {
    Reached,
    Waiting,
}

impl QuorumStatus {
    /// Label shown on the assembly dashboard.
    pub fn label(self) -> &'static str {
        match self {
            Self::Reached => "Quórum Alcanzado",
            Self::Waiting => "Esperando Quórum",
        }
    }
}

/// Weighted attendance at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuorumSnapshot {
    pub assembly: AssemblyId,
    pub present_units: usize,
    pub total_units: usize,
    pub present_coefficient: f64,
    pub total_coefficient: f64,
    /// In `[0, 1]`.
    pub fraction: f64,
    pub threshold: f64,
    pub reached: bool,
    pub status: QuorumStatus,
}

impl QuorumSnapshot {
    pub fn percentage(&self) -> f64 {
        self.fraction * 100.0
    }
}

/// Pure quorum computation over one assembly's units and attendance.
///
/// Attendance rows for units outside `units` are ignored.
pub fn compute_quorum(
    assembly: AssemblyId,
    units: &[Unit],
    attendance: &[AttendanceRecord],
    threshold: f64,
) -> QuorumSnapshot {
    let present: HashSet<UnitId> = attendance.iter().map(|record| record.unit).collect();

    let total_coefficient: f64 = units.iter().map(|unit| unit.coefficient).sum();
    let (present_units, present_coefficient) = units
        .iter()
        .filter(|unit| present.contains(&unit.uuid))
        .fold((0usize, 0.0f64), |(count, weight), unit| {
            (count + 1, weight + unit.coefficient)
        });

    let fraction = if total_coefficient > 0.0 {
        present_coefficient / total_coefficient
    } else {
        0.0
    };
    let reached = fraction > threshold;

    QuorumSnapshot {
        assembly,
        present_units,
        total_units: units.len(),
        present_coefficient,
        total_coefficient,
        fraction,
        threshold,
        reached,
        status: if reached {
            QuorumStatus::Reached
        } else {
            QuorumStatus::Waiting
        },
    }
}

pub struct QuorumService<S> {
    store: S,
    ctx: ServiceContext,
}

impl<S: UnitRepository> QuorumService<S> {
    pub fn new(store: S, ctx: ServiceContext) -> Self {
        Self { store, ctx }
    }

    /// Records a unit as present. Returns `false` when it already was.
    pub fn check_in(&self, unit_id: UnitId) -> ServiceResult<bool> {
        let unit = self
            .store
            .get_unit(unit_id)?
            .ok_or(ServiceError::NotFound {
                entity: "unit",
                id: unit_id,
            })?;

        let inserted = self.store.append_attendance(unit_id, self.ctx.now_ms())?;
        if inserted {
            info!(
                "event=attendance_check_in module=service status=ok unit_id={}",
                unit_id
            );
            self.ctx.notify(StateChange::Attendance {
                assembly: unit.assembly,
            });
        } else {
            debug!(
                "event=attendance_check_in module=service status=skip unit_id={}",
                unit_id
            );
        }
        Ok(inserted)
    }

    pub fn compute(&self, assembly: AssemblyId) -> ServiceResult<QuorumSnapshot> {
        if self.store.get_assembly(assembly)?.is_none() {
            return Err(ServiceError::NotFound {
                entity: "assembly",
                id: assembly,
            });
        }
        let units = self.store.list_units(assembly)?;
        let attendance = self.store.list_attendance(assembly)?;
        Ok(compute_quorum(
            assembly,
            &units,
            &attendance,
            self.ctx.config.quorum.threshold,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{compute_quorum, QuorumStatus};
    use crate::model::assembly::{AttendanceRecord, Unit};
    use uuid::Uuid;

    fn units(assembly: Uuid, coefficients: &[f64]) -> Vec<Unit> {
        coefficients
            .iter()
            .enumerate()
            .map(|(idx, coefficient)| {
                Unit::new(assembly, format!("{}", 101 + idx), *coefficient, Uuid::new_v4())
            })
            .collect()
    }

    fn present(unit: &Unit) -> AttendanceRecord {
        AttendanceRecord {
            unit: unit.uuid,
            checked_in_at: 1_000,
        }
    }

    #[test]
    fn no_units_means_zero_fraction() {
        let snapshot = compute_quorum(Uuid::new_v4(), &[], &[], 0.5);
        assert_eq!(snapshot.fraction, 0.0);
        assert!(!snapshot.reached);
        assert_eq!(snapshot.status, QuorumStatus::Waiting);
    }

    #[test]
    fn fraction_uses_real_denominator() {
        let assembly = Uuid::new_v4();
        let units = units(assembly, &[0.5, 0.5, 1.0]);
        let snapshot = compute_quorum(assembly, &units, &[present(&units[2])], 0.5);
        assert!((snapshot.fraction - 0.5).abs() < 1e-12);
        assert!(!snapshot.reached, "exactly the threshold is not quorum");
        assert_eq!(snapshot.total_coefficient, 2.0);
    }

    #[test]
    fn adding_a_unit_raises_fraction_by_its_share() {
        let assembly = Uuid::new_v4();
        let units = units(assembly, &[0.2, 0.3, 0.5]);
        let before = compute_quorum(assembly, &units, &[present(&units[0])], 0.5);
        let after = compute_quorum(
            assembly,
            &units,
            &[present(&units[0]), present(&units[1])],
            0.5,
        );
        assert!((after.fraction - before.fraction - 0.3).abs() < 1e-12);
    }

    #[test]
    fn duplicate_and_foreign_attendance_rows_do_not_count_twice() {
        let assembly = Uuid::new_v4();
        let units = units(assembly, &[0.6, 0.4]);
        let foreign = AttendanceRecord {
            unit: Uuid::new_v4(),
            checked_in_at: 5,
        };
        let snapshot = compute_quorum(
            assembly,
            &units,
            &[present(&units[0]), present(&units[0]), foreign],
            0.5,
        );
        assert_eq!(snapshot.present_units, 1);
        assert!((snapshot.fraction - 0.6).abs() < 1e-12);
        assert!(snapshot.reached);
        assert_eq!(snapshot.status.label(), "Quórum Alcanzado");
    }
}

//! Repair of delegations left half-written.
//!
//! # Responsibility
//! - Phase 1: approved proxies without evidence, older than the grace window.
//!   Their units go back to the principal and the proxy row is deleted.
//! - Phase 2: units held by a representative while the owner has no approved
//!   proxy. They go back to the owner.
//!
//! # Invariants
//! - Every unit write is conditional on the holder the sweep observed.
//! - A unit already back with its owner counts as skipped, not failed.
//! - A proxy row is deleted only after all of its units were repaired, so a
//!   partially repaired proxy is picked up again by the next sweep.
//! - The delete is conditional on the row still being an unevidenced approved
//!   proxy; revoked history is never removed.
//! - Sweeping twice in a row changes nothing the second time.

use crate::model::assembly::Unit;
use crate::model::holder::RightsHolder;
use crate::model::proxy::Proxy;
use crate::model::{ProxyId, UnitId};
use crate::notify::StateChange;
use crate::repo::proxy_repo::ProxyRepository;
use crate::repo::unit_repo::UnitRepository;
use crate::repo::RepoError;
use crate::service::{duration_ms, ServiceContext, ServiceResult};
use log::{error, info, warn};
use serde::Serialize;

/// A unit handed back to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitRepair {
    pub unit: UnitId,
    /// Broken proxy the unit was attached to; `None` for orphaned units.
    pub proxy: Option<ProxyId>,
}

/// A unit the sweep could not repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: UnitId,
    pub proxy: Option<ProxyId>,
    pub reason: String,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub repaired: Vec<UnitRepair>,
    /// Units found already back with their owner.
    pub skipped: Vec<UnitId>,
    pub failed: Vec<UnitFailure>,
    pub deleted_proxies: Vec<ProxyId>,
    /// Broken proxies kept for the next sweep because a repair failed.
    pub retained_proxies: Vec<ProxyId>,
}

impl SweepReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty() || !self.retained_proxies.is_empty()
    }

    /// Nothing was broken.
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
            && self.skipped.is_empty()
            && self.failed.is_empty()
            && self.deleted_proxies.is_empty()
            && self.retained_proxies.is_empty()
    }
}

enum RepairOutcome {
    Repaired,
    Skipped,
    Failed(String),
}

pub struct ReconcileService<S> {
    store: S,
    ctx: ServiceContext,
}

impl<S> ReconcileService<S>
where
    S: UnitRepository + ProxyRepository,
{
    pub fn new(store: S, ctx: ServiceContext) -> Self {
        Self { store, ctx }
    }

    /// Runs both phases once.
    ///
    /// Only the initial scans can fail the whole sweep; per-unit failures are
    /// collected in the report.
    pub fn sweep(&self) -> ServiceResult<SweepReport> {
        let now = self.ctx.now_ms();
        let cutoff = now.saturating_sub(duration_ms(self.ctx.config.sweep_grace()));
        info!(
            "event=reconcile_sweep module=service status=start cutoff={}",
            cutoff
        );

        let mut report = SweepReport::default();
        for proxy in self.store.list_unevidenced_approved(cutoff)? {
            self.repair_proxy(&proxy, &mut report);
        }
        for unit in self.store.list_orphaned_units()? {
            self.repair_orphan(&unit, &mut report);
        }

        if report.has_failures() {
            error!(
                "event=reconcile_sweep module=service status=partial repaired={} skipped={} failed={} deleted_proxies={} retained_proxies={}",
                report.repaired.len(),
                report.skipped.len(),
                report.failed.len(),
                report.deleted_proxies.len(),
                report.retained_proxies.len()
            );
        } else {
            info!(
                "event=reconcile_sweep module=service status=ok repaired={} skipped={} deleted_proxies={}",
                report.repaired.len(),
                report.skipped.len(),
                report.deleted_proxies.len()
            );
        }
        Ok(report)
    }

    fn repair_proxy(&self, proxy: &Proxy, report: &mut SweepReport) {
        let units = match self.store.list_units_owned_by(proxy.principal) {
            Ok(units) => units,
            Err(err) => {
                warn!(
                    "event=reconcile_proxy module=service status=error proxy_id={} error={}",
                    proxy.uuid, err
                );
                report.retained_proxies.push(proxy.uuid);
                return;
            }
        };

        let delegated = RightsHolder::delegated(proxy.representative.clone());
        let mut all_repaired = true;
        for unit in units.iter().filter(|unit| unit.rights_holder == delegated) {
            match self.revert_unit(unit, &delegated) {
                RepairOutcome::Repaired => report.repaired.push(UnitRepair {
                    unit: unit.uuid,
                    proxy: Some(proxy.uuid),
                }),
                RepairOutcome::Skipped => report.skipped.push(unit.uuid),
                RepairOutcome::Failed(reason) => {
                    all_repaired = false;
                    report.failed.push(UnitFailure {
                        unit: unit.uuid,
                        proxy: Some(proxy.uuid),
                        reason,
                    });
                }
            }
        }

        if !all_repaired {
            warn!(
                "event=reconcile_proxy module=service status=retained proxy_id={}",
                proxy.uuid
            );
            report.retained_proxies.push(proxy.uuid);
            return;
        }

        match self.store.delete_unevidenced_proxy(proxy.uuid) {
            Ok(true) => {
                info!(
                    "event=reconcile_proxy module=service status=deleted proxy_id={}",
                    proxy.uuid
                );
                report.deleted_proxies.push(proxy.uuid);
            }
            Ok(false) => {
                info!(
                    "event=reconcile_proxy module=service status=skip proxy_id={}",
                    proxy.uuid
                );
            }
            Err(err) => {
                warn!(
                    "event=reconcile_proxy module=service status=error proxy_id={} error={}",
                    proxy.uuid, err
                );
                report.retained_proxies.push(proxy.uuid);
            }
        }
        self.ctx.notify(StateChange::Delegation {
            principal: proxy.principal,
        });
    }

    fn repair_orphan(&self, unit: &Unit, report: &mut SweepReport) {
        // A registration may have completed since the scan.
        match self.store.find_active_proxy(unit.owner) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => {
                report.failed.push(UnitFailure {
                    unit: unit.uuid,
                    proxy: None,
                    reason: err.to_string(),
                });
                return;
            }
        }

        match self.revert_unit(unit, &unit.rights_holder) {
            RepairOutcome::Repaired => {
                report.repaired.push(UnitRepair {
                    unit: unit.uuid,
                    proxy: None,
                });
                self.ctx.notify(StateChange::Delegation {
                    principal: unit.owner,
                });
            }
            RepairOutcome::Skipped => report.skipped.push(unit.uuid),
            RepairOutcome::Failed(reason) => report.failed.push(UnitFailure {
                unit: unit.uuid,
                proxy: None,
                reason,
            }),
        }
    }

    fn revert_unit(&self, unit: &Unit, expected: &RightsHolder) -> RepairOutcome {
        let owner = RightsHolder::principal(unit.owner);
        match self
            .store
            .update_unit_rights_holder(unit.uuid, expected, &owner)
        {
            Ok(()) => {
                info!(
                    "event=reconcile_unit module=service status=ok unit_id={}",
                    unit.uuid
                );
                RepairOutcome::Repaired
            }
            Err(RepoError::Conflict(message)) => match self.store.get_unit(unit.uuid) {
                Ok(Some(current)) if current.rights_holder == owner => {
                    info!(
                        "event=reconcile_unit module=service status=skip unit_id={}",
                        unit.uuid
                    );
                    RepairOutcome::Skipped
                }
                Ok(_) => {
                    warn!(
                        "event=reconcile_unit module=service status=conflict unit_id={}",
                        unit.uuid
                    );
                    RepairOutcome::Failed(message)
                }
                Err(err) => RepairOutcome::Failed(err.to_string()),
            },
            Err(err) => {
                warn!(
                    "event=reconcile_unit module=service status=error unit_id={} error={}",
                    unit.uuid, err
                );
                RepairOutcome::Failed(err.to_string())
            }
        }
    }
}

//! Typed report rows for the assembly dashboard.
//!
//! Rows serialize with serde; rendering (PDF, HTML, JSON) is the caller's
//! concern. Every report is recomputed from the store.

use crate::model::assembly::{Member, Unit};
use crate::model::holder::{Representative, RightsHolder};
use crate::model::proxy::{DelegationType, ProxyStatus};
use crate::model::{AssemblyId, MemberId, ProxyId, UnitId};
use crate::repo::proxy_repo::{ProxyListQuery, ProxyRepository};
use crate::repo::unit_repo::UnitRepository;
use crate::repo::vote_repo::VoteRepository;
use crate::service::vote_service::{tabulate_ballots, VoteTally};
use crate::service::{ServiceError, ServiceResult};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub unit: UnitId,
    pub unit_number: String,
    pub coefficient: f64,
    /// Whoever currently holds the unit's rights.
    pub representative_name: String,
    pub check_in_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceReport {
    pub assembly: AssemblyId,
    /// Newest check-in first.
    pub rows: Vec<AttendanceRow>,
    pub total_coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceRow {
    pub unit: UnitId,
    pub unit_number: String,
    pub coefficient: f64,
    pub representative_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceReport {
    pub assembly: AssemblyId,
    pub rows: Vec<AbsenceRow>,
    pub total_coefficient: f64,
}

/// One row per unit owned by a delegating principal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyReportRow {
    pub proxy_id: ProxyId,
    pub kind: DelegationType,
    pub status: ProxyStatus,
    pub principal_name: String,
    pub principal_doc: String,
    pub unit: UnitId,
    pub unit_number: String,
    pub coefficient: f64,
    pub representative_name: String,
    pub representative_doc: String,
    pub created_at: i64,
}

pub struct ReportService<S> {
    store: S,
    members: RefCell<HashMap<MemberId, Member>>,
}

impl<S> ReportService<S>
where
    S: UnitRepository + ProxyRepository + VoteRepository,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            members: RefCell::new(HashMap::new()),
        }
    }

    pub fn attendance(&self, assembly: AssemblyId) -> ServiceResult<AttendanceReport> {
        let units = self.assembly_units(assembly)?;
        let by_id: HashMap<UnitId, &Unit> = units.iter().map(|unit| (unit.uuid, unit)).collect();

        let mut rows = Vec::new();
        for record in self.store.list_attendance(assembly)? {
            let Some(unit) = by_id.get(&record.unit) else {
                continue;
            };
            rows.push(AttendanceRow {
                unit: unit.uuid,
                unit_number: unit.number.clone(),
                coefficient: unit.coefficient,
                representative_name: self.holder_name(&unit.rights_holder)?,
                check_in_at: record.checked_in_at,
            });
        }
        let total_coefficient = rows.iter().map(|row| row.coefficient).sum();
        Ok(AttendanceReport {
            assembly,
            rows,
            total_coefficient,
        })
    }

    pub fn absence(&self, assembly: AssemblyId) -> ServiceResult<AbsenceReport> {
        let units = self.assembly_units(assembly)?;
        let present: HashSet<UnitId> = self
            .store
            .list_attendance(assembly)?
            .into_iter()
            .map(|record| record.unit)
            .collect();

        let mut rows = Vec::new();
        for unit in units.iter().filter(|unit| !present.contains(&unit.uuid)) {
            rows.push(AbsenceRow {
                unit: unit.uuid,
                unit_number: unit.number.clone(),
                coefficient: unit.coefficient,
                representative_name: self.holder_name(&unit.rights_holder)?,
            });
        }
        let total_coefficient = rows.iter().map(|row| row.coefficient).sum();
        Ok(AbsenceReport {
            assembly,
            rows,
            total_coefficient,
        })
    }

    /// Tallies of every vote in the assembly, newest first.
    pub fn votes(&self, assembly: AssemblyId) -> ServiceResult<Vec<VoteTally>> {
        self.ensure_assembly(assembly)?;
        let mut tallies = Vec::new();
        for vote in self.store.list_votes(assembly)? {
            let ballots = self.store.list_ballots(vote.uuid)?;
            tallies.push(tabulate_ballots(&vote, &ballots));
        }
        Ok(tallies)
    }

    /// Approved proxies of principals owning units in the assembly.
    pub fn proxies(&self, assembly: AssemblyId) -> ServiceResult<Vec<ProxyReportRow>> {
        let units = self.assembly_units(assembly)?;
        let proxies = self.store.list_proxies(&ProxyListQuery {
            assembly: Some(assembly),
            principal: None,
            status: Some(ProxyStatus::Approved),
        })?;

        let mut rows = Vec::new();
        for proxy in proxies {
            let principal = self.member(proxy.principal)?;
            let (representative_name, representative_doc) = match &proxy.representative {
                Representative::Internal { member } => {
                    let member = self.member(*member)?;
                    (member.full_name, member.document_number)
                }
                Representative::External {
                    name,
                    document_number,
                } => (name.clone(), document_number.clone()),
            };
            for unit in units.iter().filter(|unit| unit.owner == proxy.principal) {
                rows.push(ProxyReportRow {
                    proxy_id: proxy.uuid,
                    kind: proxy.kind,
                    status: proxy.status,
                    principal_name: principal.full_name.clone(),
                    principal_doc: principal.document_number.clone(),
                    unit: unit.uuid,
                    unit_number: unit.number.clone(),
                    coefficient: unit.coefficient,
                    representative_name: representative_name.clone(),
                    representative_doc: representative_doc.clone(),
                    created_at: proxy.created_at,
                });
            }
        }
        Ok(rows)
    }

    fn ensure_assembly(&self, assembly: AssemblyId) -> ServiceResult<()> {
        match self.store.get_assembly(assembly)? {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotFound {
                entity: "assembly",
                id: assembly,
            }),
        }
    }

    fn assembly_units(&self, assembly: AssemblyId) -> ServiceResult<Vec<Unit>> {
        self.ensure_assembly(assembly)?;
        Ok(self.store.list_units(assembly)?)
    }

    fn holder_name(&self, holder: &RightsHolder) -> ServiceResult<String> {
        match holder {
            RightsHolder::Principal { member }
            | RightsHolder::Representative {
                representative: Representative::Internal { member },
            } => Ok(self.member(*member)?.full_name),
            RightsHolder::Representative {
                representative: Representative::External { name, .. },
            } => Ok(name.clone()),
        }
    }

    fn member(&self, id: MemberId) -> ServiceResult<Member> {
        if let Some(member) = self.members.borrow().get(&id) {
            return Ok(member.clone());
        }
        let member = self
            .store
            .get_member(id)?
            .ok_or(ServiceError::NotFound { entity: "member", id })?;
        self.members.borrow_mut().insert(id, member.clone());
        Ok(member)
    }
}

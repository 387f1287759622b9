//! Vote lifecycle, ballot casting and weighted tabulation.
//!
//! # Invariants
//! - One ballot per (vote, unit); the second cast is a `Conflict`.
//! - Ballot weight is the unit coefficient at cast time.
//! - Tallies are recomputed from stored ballots on every call.

use crate::model::assembly::Unit;
use crate::model::vote::{Ballot, Vote, VoteStatus};
use crate::model::{AssemblyId, OptionId, UnitId, VoteId};
use crate::notify::StateChange;
use crate::repo::unit_repo::UnitRepository;
use crate::repo::vote_repo::VoteRepository;
use crate::service::{ServiceContext, ServiceError, ServiceResult};
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Per-option aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionTally {
    pub option: OptionId,
    pub label: String,
    pub count: usize,
    pub weight: f64,
    pub percentage: f64,
}

/// Weighted result of one vote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteTally {
    pub vote_id: VoteId,
    pub title: String,
    pub status: VoteStatus,
    pub total_ballots: usize,
    pub total_weight: f64,
    /// In declared option order.
    pub results: Vec<OptionTally>,
}

/// Pure tabulation. Ballots for options the vote does not declare are
/// skipped.
pub fn tabulate_ballots(vote: &Vote, ballots: &[Ballot]) -> VoteTally {
    let mut per_option: HashMap<OptionId, (usize, f64)> = vote
        .options
        .iter()
        .map(|option| (option.uuid, (0, 0.0)))
        .collect();

    let mut skipped = 0usize;
    for ballot in ballots.iter().filter(|ballot| ballot.vote == vote.uuid) {
        match per_option.get_mut(&ballot.option) {
            Some((count, weight)) => {
                *count += 1;
                *weight += ballot.weight;
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            "event=vote_tabulate module=service status=skip vote_id={} unknown_option_ballots={}",
            vote.uuid, skipped
        );
    }

    let total_weight: f64 = per_option.values().map(|(_, weight)| weight).sum();
    let total_ballots: usize = per_option.values().map(|(count, _)| count).sum();
    let results = vote
        .options
        .iter()
        .map(|option| {
            let (count, weight) = per_option.get(&option.uuid).copied().unwrap_or((0, 0.0));
            OptionTally {
                option: option.uuid,
                label: option.label.clone(),
                count,
                weight,
                percentage: if total_weight > 0.0 {
                    weight / total_weight * 100.0
                } else {
                    0.0
                },
            }
        })
        .collect();

    VoteTally {
        vote_id: vote.uuid,
        title: vote.title.clone(),
        status: vote.status,
        total_ballots,
        total_weight,
        results,
    }
}

pub struct VoteService<S> {
    store: S,
    ctx: ServiceContext,
}

impl<S> VoteService<S>
where
    S: UnitRepository + VoteRepository,
{
    pub fn new(store: S, ctx: ServiceContext) -> Self {
        Self { store, ctx }
    }

    /// Creates an open vote with at least two distinct option labels.
    pub fn create_vote(
        &self,
        assembly: AssemblyId,
        title: &str,
        options: &[String],
    ) -> ServiceResult<Vote> {
        if title.trim().is_empty() {
            return Err(ServiceError::Validation(
                "vote title must not be blank".to_string(),
            ));
        }
        if options.len() < 2 {
            return Err(ServiceError::Validation(
                "a vote needs at least two options".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for label in options {
            let label = label.trim();
            if label.is_empty() {
                return Err(ServiceError::Validation(
                    "option labels must not be blank".to_string(),
                ));
            }
            if !seen.insert(label.to_lowercase()) {
                return Err(ServiceError::Validation(format!(
                    "duplicate option label `{label}`"
                )));
            }
        }
        if self.store.get_assembly(assembly)?.is_none() {
            return Err(ServiceError::NotFound {
                entity: "assembly",
                id: assembly,
            });
        }

        let vote = Vote::new(assembly, title, options, self.ctx.now_ms());
        self.store.create_vote(&vote)?;
        info!(
            "event=vote_create module=service status=ok vote_id={} options={}",
            vote.uuid,
            vote.options.len()
        );
        Ok(vote)
    }

    pub fn close_vote(&self, vote_id: VoteId) -> ServiceResult<()> {
        let vote = self.load_vote(vote_id)?;
        if vote.status == VoteStatus::Closed {
            return Err(ServiceError::Validation(format!(
                "vote {vote_id} is already closed"
            )));
        }
        self.store
            .update_vote_status(vote_id, VoteStatus::Closed, VoteStatus::Open)?;
        info!(
            "event=vote_close module=service status=ok vote_id={}",
            vote_id
        );
        self.ctx.notify(StateChange::Ballots { vote: vote_id });
        Ok(())
    }

    /// Casts the ballot of one unit, weighted by its current coefficient.
    pub fn cast(&self, vote_id: VoteId, unit_id: UnitId, option: OptionId) -> ServiceResult<Ballot> {
        let vote = self.load_vote(vote_id)?;
        if vote.status != VoteStatus::Open {
            return Err(ServiceError::Validation(format!(
                "vote {vote_id} is not open"
            )));
        }
        if vote.option(option).is_none() {
            return Err(ServiceError::Validation(format!(
                "option {option} does not belong to vote {vote_id}"
            )));
        }
        let unit = self.load_unit(unit_id)?;
        if unit.assembly != vote.assembly {
            return Err(ServiceError::Validation(format!(
                "unit {unit_id} does not belong to the assembly of vote {vote_id}"
            )));
        }

        let ballot = Ballot {
            uuid: Uuid::new_v4(),
            vote: vote_id,
            option,
            unit: unit_id,
            weight: unit.coefficient,
            cast_by: unit.rights_holder,
            cast_at: self.ctx.now_ms(),
        };
        if let Err(err) = self.store.create_ballot(&ballot) {
            let err = ServiceError::from(err);
            warn!(
                "event=vote_cast module=service status={} vote_id={} unit_id={}",
                err.kind(),
                vote_id,
                unit_id
            );
            return Err(err);
        }

        info!(
            "event=vote_cast module=service status=ok vote_id={} unit_id={}",
            vote_id, unit_id
        );
        self.ctx.notify(StateChange::Ballots { vote: vote_id });
        Ok(ballot)
    }

    pub fn tabulate(&self, vote_id: VoteId) -> ServiceResult<VoteTally> {
        let vote = self.load_vote(vote_id)?;
        let ballots = self.store.list_ballots(vote_id)?;
        Ok(tabulate_ballots(&vote, &ballots))
    }

    pub fn get_vote(&self, vote_id: VoteId) -> ServiceResult<Vote> {
        self.load_vote(vote_id)
    }

    pub fn list_votes(&self, assembly: AssemblyId) -> ServiceResult<Vec<Vote>> {
        Ok(self.store.list_votes(assembly)?)
    }

    fn load_vote(&self, vote_id: VoteId) -> ServiceResult<Vote> {
        self.store.get_vote(vote_id)?.ok_or(ServiceError::NotFound {
            entity: "vote",
            id: vote_id,
        })
    }

    fn load_unit(&self, unit_id: UnitId) -> ServiceResult<Unit> {
        self.store.get_unit(unit_id)?.ok_or(ServiceError::NotFound {
            entity: "unit",
            id: unit_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::tabulate_ballots;
    use crate::model::holder::RightsHolder;
    use crate::model::vote::{Ballot, Vote};
    use uuid::Uuid;

    fn ballot(vote: &Vote, option: Uuid, weight: f64) -> Ballot {
        Ballot {
            uuid: Uuid::new_v4(),
            vote: vote.uuid,
            option,
            unit: Uuid::new_v4(),
            weight,
            cast_by: RightsHolder::principal(Uuid::new_v4()),
            cast_at: 1,
        }
    }

    fn yes_no() -> Vote {
        Vote::new(
            Uuid::new_v4(),
            "Approve budget",
            &["Yes".to_string(), "No".to_string()],
            0,
        )
    }

    #[test]
    fn empty_vote_reports_zero_everywhere() {
        let vote = yes_no();
        let tally = tabulate_ballots(&vote, &[]);
        assert_eq!(tally.total_weight, 0.0);
        assert!(tally.results.iter().all(|row| row.percentage == 0.0));
        assert_eq!(tally.results[0].label, "Yes");
    }

    #[test]
    fn percentages_follow_weight_not_headcount() {
        let vote = yes_no();
        let yes = vote.options[0].uuid;
        let no = vote.options[1].uuid;
        let ballots = [
            ballot(&vote, yes, 0.1),
            ballot(&vote, yes, 0.2),
            ballot(&vote, no, 0.7),
        ];
        let tally = tabulate_ballots(&vote, &ballots);
        assert_eq!(tally.results[0].count, 2);
        assert!((tally.results[0].percentage - 30.0).abs() < 1e-9);
        assert!((tally.results[1].percentage - 70.0).abs() < 1e-9);
        let sum: f64 = tally.results.iter().map(|row| row.percentage).sum();
        assert!((sum - 100.0).abs() < 1e-9);
    }

    #[test]
    fn ballots_for_unknown_options_are_ignored() {
        let vote = yes_no();
        let yes = vote.options[0].uuid;
        let ballots = [ballot(&vote, yes, 0.4), ballot(&vote, Uuid::new_v4(), 0.6)];
        let tally = tabulate_ballots(&vote, &ballots);
        assert_eq!(tally.total_ballots, 1);
        assert!((tally.total_weight - 0.4).abs() < 1e-12);
        assert!((tally.results[0].percentage - 100.0).abs() < 1e-9);
    }
}

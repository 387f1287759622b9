//! Proxy rights lifecycle.
//!
//! # Responsibility
//! - Register, review and revoke delegations of a principal's unit rights.
//! - Report where a principal sits in the delegation state machine.
//!
//! # Invariants
//! - Every request is validated before the store is written.
//! - Rights move only through `ProxyRepository` delegation transactions, so a
//!   unit is never left without a holder or with two.
//! - An existing approved proxy, whether seen up front or lost as a race
//!   inside the store transaction, surfaces as `Conflict`.

use crate::model::holder::Representative;
use crate::model::proxy::{
    DelegationState, DelegationType, Evidence, Proxy, ProxyStatus, VerificationMethod,
};
use crate::model::{ChallengeId, MemberId, ProxyId, UnitId};
use crate::notify::StateChange;
use crate::repo::proxy_repo::ProxyRepository;
use crate::repo::unit_repo::UnitRepository;
use crate::repo::verification_repo::VerificationRepository;
use crate::service::{ServiceContext, ServiceError, ServiceResult};
use log::{info, warn};

/// Result of a call that moved unit rights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationOutcome {
    pub proxy: Proxy,
    /// Units whose rights holder changed.
    pub units: Vec<UnitId>,
}

/// Delegation service over any store implementing the needed repositories.
pub struct ProxyService<S> {
    store: S,
    ctx: ServiceContext,
}

impl<S> ProxyService<S>
where
    S: UnitRepository + ProxyRepository + VerificationRepository,
{
    pub fn new(store: S, ctx: ServiceContext) -> Self {
        Self { store, ctx }
    }

    /// Registers an approved delegation and transfers rights immediately.
    ///
    /// Digital delegations need a verified challenge of the same principal;
    /// document delegations need a non-blank locator.
    pub fn register(
        &self,
        principal: MemberId,
        representative: Representative,
        kind: DelegationType,
        evidence: Evidence,
    ) -> ServiceResult<DelegationOutcome> {
        let representative = self.check_parties(principal, representative)?;
        self.ensure_not_delegated(principal)?;
        self.ensure_owns_units(principal)?;
        let challenge = self.check_evidence(principal, kind, &evidence)?;

        let now = self.ctx.now_ms();
        let proxy = Proxy::new(
            principal,
            representative,
            kind,
            ProxyStatus::Approved,
            Some(&evidence),
            now,
        );

        let units = match self.store.register_delegation(&proxy, challenge) {
            Ok(units) => units,
            Err(err) => {
                let err = ServiceError::from(err);
                warn!(
                    "event=proxy_register module=service status={} proxy_id={} principal={}",
                    err.kind(),
                    proxy.uuid,
                    principal
                );
                return Err(err);
            }
        };

        info!(
            "event=proxy_register module=service status=ok proxy_id={} kind={} units={}",
            proxy.uuid,
            kind.as_str(),
            units.len()
        );
        self.ctx.notify(StateChange::Delegation { principal });
        Ok(DelegationOutcome { proxy, units })
    }

    /// Revokes an approved delegation and hands rights back to the principal.
    pub fn revoke(&self, proxy_id: ProxyId) -> ServiceResult<DelegationOutcome> {
        let now = self.ctx.now_ms();
        let (proxy, units) = self.store.revoke_delegation(proxy_id, now)?;
        info!(
            "event=proxy_revoke module=service status=ok proxy_id={} units={}",
            proxy.uuid,
            units.len()
        );
        self.ctx.notify(StateChange::Delegation {
            principal: proxy.principal,
        });
        Ok(DelegationOutcome { proxy, units })
    }

    /// Stores a document delegation for operator review without moving rights.
    pub fn submit(
        &self,
        principal: MemberId,
        representative: Representative,
        kind: DelegationType,
        evidence: Evidence,
    ) -> ServiceResult<Proxy> {
        if kind.required_method() != VerificationMethod::Document {
            return Err(ServiceError::Validation(format!(
                "{} delegations cannot go through document review",
                kind.as_str()
            )));
        }
        let representative = self.check_parties(principal, representative)?;
        self.ensure_not_delegated(principal)?;
        if let Some(pending) = self.store.find_pending_proxy(principal)? {
            return Err(ServiceError::Validation(format!(
                "principal {principal} already has pending proxy {}",
                pending.uuid
            )));
        }
        self.ensure_owns_units(principal)?;
        self.check_evidence(principal, kind, &evidence)?;

        let proxy = Proxy::new(
            principal,
            representative,
            kind,
            ProxyStatus::Pending,
            Some(&evidence),
            self.ctx.now_ms(),
        );
        self.store.create_proxy(&proxy)?;
        info!(
            "event=proxy_submit module=service status=ok proxy_id={} kind={}",
            proxy.uuid,
            kind.as_str()
        );
        self.ctx.notify(StateChange::Delegation { principal });
        Ok(proxy)
    }

    /// Approves a pending delegation and transfers rights in one transaction.
    pub fn approve(&self, proxy_id: ProxyId) -> ServiceResult<DelegationOutcome> {
        let (proxy, units) = self
            .store
            .approve_delegation(proxy_id, self.ctx.now_ms())?;
        info!(
            "event=proxy_approve module=service status=ok proxy_id={} units={}",
            proxy.uuid,
            units.len()
        );
        self.ctx.notify(StateChange::Delegation {
            principal: proxy.principal,
        });
        Ok(DelegationOutcome { proxy, units })
    }

    /// Rejects a pending delegation. No rights ever moved, so none move back.
    pub fn reject(&self, proxy_id: ProxyId) -> ServiceResult<Proxy> {
        let mut proxy = self
            .store
            .get_proxy(proxy_id)?
            .filter(|proxy| proxy.status == ProxyStatus::Pending)
            .ok_or(ServiceError::NotFound {
                entity: "pending proxy",
                id: proxy_id,
            })?;

        let now = self.ctx.now_ms();
        self.store
            .update_proxy_status(proxy_id, ProxyStatus::Rejected, ProxyStatus::Pending, now)?;
        proxy.status = ProxyStatus::Rejected;
        proxy.updated_at = now;

        info!(
            "event=proxy_reject module=service status=ok proxy_id={}",
            proxy.uuid
        );
        self.ctx.notify(StateChange::Delegation {
            principal: proxy.principal,
        });
        Ok(proxy)
    }

    pub fn get(&self, proxy_id: ProxyId) -> ServiceResult<Proxy> {
        self.store
            .get_proxy(proxy_id)?
            .ok_or(ServiceError::NotFound {
                entity: "proxy",
                id: proxy_id,
            })
    }

    /// The approved proxy of a principal, if any.
    pub fn active_for(&self, principal: MemberId) -> ServiceResult<Option<Proxy>> {
        Ok(self.store.find_active_proxy(principal)?)
    }

    pub fn delegation_state(&self, principal: MemberId) -> ServiceResult<DelegationState> {
        if let Some(proxy) = self.store.find_active_proxy(principal)? {
            return Ok(DelegationState::Delegated(proxy));
        }

        let now = self.ctx.now_ms();
        let challenge = self
            .store
            .latest_open_challenge(principal)?
            .filter(|challenge| now < challenge.expires_at)
            .map(|challenge| challenge.uuid);
        let pending_proxy = self
            .store
            .find_pending_proxy(principal)?
            .map(|proxy| proxy.uuid);

        if challenge.is_none() && pending_proxy.is_none() {
            return Ok(DelegationState::NoDelegation);
        }
        Ok(DelegationState::PendingVerification {
            challenge,
            pending_proxy,
        })
    }

    fn check_parties(
        &self,
        principal: MemberId,
        representative: Representative,
    ) -> ServiceResult<Representative> {
        if self.store.get_member(principal)?.is_none() {
            return Err(ServiceError::NotFound {
                entity: "member",
                id: principal,
            });
        }

        match representative {
            Representative::Internal { member } => {
                if member == principal {
                    return Err(ServiceError::Validation(
                        "a principal cannot represent themselves".to_string(),
                    ));
                }
                if self.store.get_member(member)?.is_none() {
                    return Err(ServiceError::NotFound {
                        entity: "member",
                        id: member,
                    });
                }
                Ok(Representative::Internal { member })
            }
            Representative::External {
                name,
                document_number,
            } => {
                let external = Representative::external(name, &document_number)
                    .map_err(|err| ServiceError::Validation(err.to_string()))?;
                Ok(external)
            }
        }
    }

    fn ensure_not_delegated(&self, principal: MemberId) -> ServiceResult<()> {
        match self.store.find_active_proxy(principal)? {
            Some(active) => Err(ServiceError::Conflict(format!(
                "principal {principal} already delegated through proxy {}",
                active.uuid
            ))),
            None => Ok(()),
        }
    }

    fn ensure_owns_units(&self, principal: MemberId) -> ServiceResult<()> {
        if self.store.list_units_owned_by(principal)?.is_empty() {
            return Err(ServiceError::Validation(format!(
                "principal {principal} owns no units to delegate"
            )));
        }
        Ok(())
    }

    /// Returns the challenge to consume, when the evidence is a code.
    fn check_evidence(
        &self,
        principal: MemberId,
        kind: DelegationType,
        evidence: &Evidence,
    ) -> ServiceResult<Option<ChallengeId>> {
        if evidence.method() != kind.required_method() {
            return Err(ServiceError::Validation(format!(
                "{} delegations require {} evidence",
                kind.as_str(),
                kind.required_method().as_str()
            )));
        }

        match evidence {
            Evidence::Document { locator } => {
                if locator.trim().is_empty() {
                    return Err(ServiceError::Validation(
                        "document locator must not be blank".to_string(),
                    ));
                }
                Ok(None)
            }
            Evidence::VerifiedCode(challenge_id) => {
                let challenge = self
                    .store
                    .get_challenge(*challenge_id)?
                    .filter(|challenge| challenge.principal == principal)
                    .ok_or(ServiceError::NotFound {
                        entity: "verification challenge",
                        id: *challenge_id,
                    })?;
                if !challenge.is_open() {
                    return Err(ServiceError::Validation(format!(
                        "verification challenge {challenge_id} was superseded or already used"
                    )));
                }
                if challenge.verified_at.is_none() {
                    return Err(ServiceError::Validation(format!(
                        "verification challenge {challenge_id} is not verified"
                    )));
                }
                if self.ctx.now_ms() >= challenge.expires_at {
                    return Err(ServiceError::Validation(format!(
                        "verification challenge {challenge_id} expired"
                    )));
                }
                Ok(Some(*challenge_id))
            }
        }
    }
}

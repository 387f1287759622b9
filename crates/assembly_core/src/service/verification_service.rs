//! One-time code verification for digital delegations.
//!
//! # Responsibility
//! - Ask the external `CodeIssuer` for a fresh code per attempt.
//! - Check submitted codes against the open challenge.
//!
//! # Invariants
//! - Codes are per (principal, attempt), expire after the configured TTL and
//!   are consumed at most once by registration.
//! - A new request supersedes the previous open challenge.
//! - Wrong or malformed codes only bump the failure counter; the attempt stays
//!   usable until it expires.
//! - Codes never reach log lines and are stored only as salted hashes.

use crate::model::proxy::{hash_code, VerificationChallenge};
use crate::model::{ChallengeId, MemberId};
use crate::notify::StateChange;
use crate::repo::proxy_repo::ProxyRepository;
use crate::repo::unit_repo::UnitRepository;
use crate::repo::verification_repo::VerificationRepository;
use crate::service::{duration_ms, ServiceContext, ServiceError, ServiceResult};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use uuid::Uuid;

static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{6}$").expect("valid code regex"));

/// Issues and delivers one-time codes (SMS, e-mail, ...).
pub trait CodeIssuer: Send + Sync {
    /// Generates a six-digit code for this attempt and delivers it to the
    /// principal. The returned code is what `verify_code` compares against.
    fn issue_code(&self, principal: MemberId, attempt: ChallengeId) -> Result<String, String>;
}

/// What the caller learns after requesting a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeTicket {
    pub challenge: ChallengeId,
    pub expires_at: i64,
    /// Earliest time another code may be requested.
    pub resend_after: i64,
}

pub struct VerificationService<S> {
    store: S,
    ctx: ServiceContext,
    issuer: Arc<dyn CodeIssuer>,
}

impl<S> VerificationService<S>
where
    S: UnitRepository + ProxyRepository + VerificationRepository,
{
    pub fn new(store: S, ctx: ServiceContext, issuer: Arc<dyn CodeIssuer>) -> Self {
        Self { store, ctx, issuer }
    }

    /// Opens a new challenge for a principal about to delegate digitally.
    pub fn request_code(&self, principal: MemberId) -> ServiceResult<ChallengeTicket> {
        if self.store.get_member(principal)?.is_none() {
            return Err(ServiceError::NotFound {
                entity: "member",
                id: principal,
            });
        }
        if let Some(active) = self.store.find_active_proxy(principal)? {
            return Err(ServiceError::Validation(format!(
                "principal {principal} already delegated through proxy {}",
                active.uuid
            )));
        }

        let now = self.ctx.now_ms();
        let cooldown = duration_ms(self.ctx.config.resend_cooldown());
        if let Some(previous) = self.store.latest_open_challenge(principal)? {
            let resend_after = previous.issued_at.saturating_add(cooldown);
            if now < resend_after {
                return Err(ServiceError::Validation(format!(
                    "a code was sent recently; retry after {resend_after}"
                )));
            }
        }

        let attempt = Uuid::new_v4();
        let code = self
            .issuer
            .issue_code(principal, attempt)
            .map_err(ServiceError::Collaborator)?;
        if !CODE_RE.is_match(&code) {
            return Err(ServiceError::Collaborator(
                "code issuer returned a code that is not six digits".to_string(),
            ));
        }

        let expires_at = now.saturating_add(duration_ms(self.ctx.config.code_ttl()));
        let challenge = VerificationChallenge {
            uuid: attempt,
            principal,
            code_hash: hash_code(attempt, &code),
            issued_at: now,
            expires_at,
            failed_attempts: 0,
            verified_at: None,
            consumed_at: None,
            superseded: false,
        };
        self.store.create_challenge(&challenge)?;

        info!(
            "event=code_request module=service status=ok challenge_id={} expires_at={}",
            attempt, expires_at
        );
        self.ctx.notify(StateChange::Delegation { principal });
        Ok(ChallengeTicket {
            challenge: attempt,
            expires_at,
            resend_after: now.saturating_add(cooldown),
        })
    }

    /// Checks a submitted code. Resubmitting the correct code for an already
    /// verified challenge is a no-op; a wrong one still counts as a failure.
    pub fn verify_code(&self, challenge_id: ChallengeId, code: &str) -> ServiceResult<()> {
        let challenge = self
            .store
            .get_challenge(challenge_id)?
            .ok_or(ServiceError::NotFound {
                entity: "verification challenge",
                id: challenge_id,
            })?;

        if !challenge.is_open() {
            return Err(ServiceError::Validation(format!(
                "verification challenge {challenge_id} was superseded or already used"
            )));
        }

        let now = self.ctx.now_ms();
        if now >= challenge.expires_at {
            return Err(ServiceError::Validation(format!(
                "verification challenge {challenge_id} expired"
            )));
        }

        let submitted = code.trim();
        if !CODE_RE.is_match(submitted) {
            let attempts = self.store.record_failed_attempt(challenge_id)?;
            warn!(
                "event=code_verify module=service status=malformed challenge_id={} failed_attempts={}",
                challenge_id, attempts
            );
            return Err(ServiceError::Validation(
                "code must be exactly six digits".to_string(),
            ));
        }
        if !challenge.matches(submitted) {
            let attempts = self.store.record_failed_attempt(challenge_id)?;
            warn!(
                "event=code_verify module=service status=mismatch challenge_id={} failed_attempts={}",
                challenge_id, attempts
            );
            return Err(ServiceError::Validation("incorrect code".to_string()));
        }
        if challenge.verified_at.is_some() {
            return Ok(());
        }

        self.store.mark_verified(challenge_id, now)?;
        info!(
            "event=code_verify module=service status=ok challenge_id={}",
            challenge_id
        );
        self.ctx.notify(StateChange::Delegation {
            principal: challenge.principal,
        });
        Ok(())
    }

    pub fn get_challenge(&self, challenge_id: ChallengeId) -> ServiceResult<VerificationChallenge> {
        self.store
            .get_challenge(challenge_id)?
            .ok_or(ServiceError::NotFound {
                entity: "verification challenge",
                id: challenge_id,
            })
    }
}

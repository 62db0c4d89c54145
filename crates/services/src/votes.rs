//! # Vote Ledger
//!
//! One vote per (user, post); post counters are a cache of the ledger.
//! The read-then-write for a pair happens inside the store's
//! [`VoteRepository::cast_vote`] transaction, never across two calls here.
//!
//! A post whose counters are found to diverge from the ledger is quarantined
//! in the store itself, so every replica refuses votes on it until
//! [`VoteLedger::reconcile`] rewrites the counters from the ledger.

use std::sync::Arc;

use domains::{
    Clock, DomainError, DomainResult, Vote, VoteKind, VoteOutcome, VoteRepository, VoteTally,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub struct VoteLedger {
    votes: Arc<dyn VoteRepository>,
    clock: Arc<dyn Clock>,
}

impl VoteLedger {
    pub fn new(votes: Arc<dyn VoteRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { votes, clock }
    }

    #[instrument(skip(self))]
    pub async fn cast_vote(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        kind: VoteKind,
    ) -> DomainResult<VoteOutcome> {
        let vote = Vote::new(user_id, post_id, kind, self.clock.now());
        match self.votes.cast_vote(vote).await {
            Ok(outcome) => {
                debug!(
                    upvotes = outcome.upvotes,
                    downvotes = outcome.downvotes,
                    "vote applied"
                );
                Ok(outcome)
            }
            Err(DomainError::InvariantViolation { post_id, detail }) => {
                error!(%post_id, %detail, "vote refused: counters quarantined");
                Err(DomainError::InvariantViolation { post_id, detail })
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "vote rolled back");
                Err(err)
            }
            Err(err) => {
                debug!(error = %err, "vote rejected");
                Err(err)
            }
        }
    }

    /// Compares stored counters with the ledger. On divergence the store has
    /// already quarantined the post.
    #[instrument(skip(self))]
    pub async fn audit(&self, post_id: Uuid) -> DomainResult<VoteTally> {
        let audit = self
            .votes
            .audit_counters(post_id)
            .await?
            .ok_or_else(|| DomainError::not_found("post", post_id))?;

        if !audit.is_consistent() {
            let detail = format!(
                "stored {}/{} but ledger holds {}/{} (up/down)",
                audit.stored.upvotes,
                audit.stored.downvotes,
                audit.ledger.upvotes,
                audit.ledger.downvotes
            );
            error!(%post_id, %detail, "vote counters diverge from ledger; refusing further votes");
            return Err(DomainError::InvariantViolation { post_id, detail });
        }
        Ok(audit.ledger)
    }

    /// Recomputes counters from the ledger and lifts any quarantine.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, post_id: Uuid) -> DomainResult<VoteTally> {
        let tally = self.votes.recount(post_id).await?;
        info!(
            upvotes = tally.upvotes,
            downvotes = tally.downvotes,
            "counters reconciled"
        );
        Ok(tally)
    }
}

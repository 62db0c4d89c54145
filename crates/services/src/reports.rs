//! # Report & Flagging Policy
//!
//! Every report is stored, including repeats from the same user, and each one
//! counts toward [`FLAG_THRESHOLD`]. Once reached, the post is flagged. This path
//! only ever moves `is_flagged` from false to true.

use std::sync::Arc;

use domains::{Clock, DomainResult, Report, ReportOutcome, ReportRepository};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::validation;

/// Reports at which a post is hidden pending moderation.
pub const FLAG_THRESHOLD: i64 = 3;

pub struct ReportPolicy {
    reports: Arc<dyn ReportRepository>,
    clock: Arc<dyn Clock>,
}

impl ReportPolicy {
    pub fn new(reports: Arc<dyn ReportRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { reports, clock }
    }

    #[instrument(skip(self, reason))]
    pub async fn file_report(
        &self,
        post_id: Uuid,
        user_id: Uuid,
        reason: &str,
    ) -> DomainResult<ReportOutcome> {
        validation::reason(reason)?;

        let report = Report {
            id: Uuid::now_v7(),
            post_id,
            user_id,
            reason: reason.to_string(),
            created_at: self.clock.now(),
        };
        let outcome = self.reports.file_report(report, FLAG_THRESHOLD).await?;

        if outcome.newly_flagged {
            info!(
                report_count = outcome.report_count,
                "report threshold reached, post flagged"
            );
        }
        Ok(outcome)
    }

    pub async fn report_count(&self, post_id: Uuid) -> DomainResult<i64> {
        self.reports.count_reports(post_id).await
    }
}

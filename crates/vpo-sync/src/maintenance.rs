//! Scheduled maintenance over stale inspection entries.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vpo_core::{Clock, InspectionEntry, InspectionStatus};
use vpo_storage::InspectionQueue;

pub const DEFAULT_STALE_AFTER_HOURS: i64 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenancePass {
    FollowUpEscalation,
    UnassignedAlert,
    AutoUnassignment,
}

impl MaintenancePass {
    pub const ALL: [MaintenancePass; 3] = [
        Self::FollowUpEscalation,
        Self::UnassignedAlert,
        Self::AutoUnassignment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FollowUpEscalation => "follow_up_escalation",
            Self::UnassignedAlert => "unassigned_alert",
            Self::AutoUnassignment => "auto_unassignment",
        }
    }

    pub fn selects(&self) -> InspectionStatus {
        match self {
            Self::FollowUpEscalation => InspectionStatus::OfferSent,
            Self::UnassignedAlert => InspectionStatus::Unassigned,
            Self::AutoUnassignment => InspectionStatus::Assigned,
        }
    }

    fn moves_to(&self) -> Option<InspectionStatus> {
        match self {
            Self::FollowUpEscalation => Some(InspectionStatus::FollowUp),
            Self::UnassignedAlert => None,
            Self::AutoUnassignment => Some(InspectionStatus::Unassigned),
        }
    }

    fn recipient(&self, entry: &InspectionEntry) -> Option<String> {
        match self {
            Self::FollowUpEscalation => entry.sales_consultant_email.clone(),
            Self::UnassignedAlert => None,
            Self::AutoUnassignment => entry.inspector_email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub pass: MaintenancePass,
    pub entry_id: Uuid,
    pub external_id: String,
    /// `None` goes to the shared operations channel.
    pub recipient: Option<String>,
}

/// Outbound notification delivery (email/SMS) lives outside this workspace.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notice: &Notice) -> anyhow::Result<()> {
        info!(
            pass = notice.pass.as_str(),
            entry_id = %notice.entry_id,
            external_id = %notice.external_id,
            recipient = notice.recipient.as_deref().unwrap_or("operations"),
            "maintenance notice"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass: MaintenancePass,
    pub selected: usize,
    pub processed: usize,
    pub failed_entries: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceSummary {
    pub passes: Vec<PassReport>,
}

impl MaintenanceSummary {
    pub fn report(&self, pass: MaintenancePass) -> Option<&PassReport> {
        self.passes.iter().find(|r| r.pass == pass)
    }
}

pub struct MaintenanceRunner {
    queue: Arc<dyn InspectionQueue>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl MaintenanceRunner {
    pub fn new(
        queue: Arc<dyn InspectionQueue>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            notifier,
            clock,
            stale_after: Duration::hours(DEFAULT_STALE_AFTER_HOURS),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Run every pass. A failing pass is recorded and logged; the rest still run.
    pub async fn run_all(&self) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::default();
        for pass in MaintenancePass::ALL {
            let span = info_span!("maintenance_pass", pass = pass.as_str());
            let report = self.run_pass(pass).instrument(span).await;
            summary.passes.push(report);
        }
        summary
    }

    pub async fn run_pass(&self, pass: MaintenancePass) -> PassReport {
        let mut report = PassReport {
            pass,
            selected: 0,
            processed: 0,
            failed_entries: 0,
            error: None,
        };
        let now = self.clock.now();
        let cutoff = now - self.stale_after;

        let entries = match self.queue.stale_entries(pass.selects(), cutoff).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(error = %err, "maintenance pass could not select entries");
                report.error = Some(format!("{err:#}"));
                return report;
            }
        };
        report.selected = entries.len();

        for entry in &entries {
            match self.process(pass, entry, now).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    warn!(entry_id = %entry.id, error = %err, "maintenance step failed");
                    report.failed_entries += 1;
                }
            }
        }

        info!(
            selected = report.selected,
            processed = report.processed,
            failed = report.failed_entries,
            "maintenance pass finished"
        );
        report
    }

    async fn process(
        &self,
        pass: MaintenancePass,
        entry: &InspectionEntry,
        now: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        let notice = Notice {
            pass,
            entry_id: entry.id,
            external_id: entry.external_id.clone(),
            recipient: pass.recipient(entry),
        };
        if let Some(to) = pass.moves_to() {
            let clear_inspector = pass == MaintenancePass::AutoUnassignment;
            self.queue
                .transition(entry.id, to, clear_inspector, now)
                .await
                .with_context(|| format!("moving {} to {to}", entry.id))?;
        }
        self.notifier
            .notify(&notice)
            .await
            .with_context(|| format!("notifying about {}", entry.id))
    }
}

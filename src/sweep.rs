//! Periodic sweeps: missed review deadlines and due activity reminders
//!
//! Both sweeps scan outside any transaction and then handle each row in its
//! own transaction, re-checking the row's conditions first. A row handled by
//! an earlier (or concurrent) run no longer matches, so re-running a sweep is
//! always safe. A failure on one lead is logged and the sweep moves on.

use crate::allocator::{self, Pool};
use crate::audit::{self, Trigger};
use crate::clock::{day_prefix, parse_stamp, stamp};
use crate::db::Activity;
use crate::error::Result;
use crate::lifecycle::{load_user, open_assignment, status_of, LeadEngine};
use crate::schema::*;
use crate::state::LeadStatus;
use crate::types::{ActivityType, AssignmentStatus, NoteType, NotificationKind};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const DEADLINE_REASON: &str = "Automatic reassignment due to missed deadline";

/// Outcome counts of one sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub acted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} scanned, {} acted, {} skipped, {} failed",
            self.scanned, self.acted, self.skipped, self.failed
        )
    }
}

enum Handled {
    Acted,
    Skipped,
}

impl SweepReport {
    fn record(&mut self, outcome: Result<Handled>, context: &str, id: i32) {
        match outcome {
            Ok(Handled::Acted) => self.acted += 1,
            Ok(Handled::Skipped) => self.skipped += 1,
            Err(e) => {
                self.failed += 1;
                tracing::warn!(id, error = %e, "{} failed", context);
            }
        }
    }
}

/// Reminder text; the trailing tag is what deduplication looks for
pub fn reminder_message(activity: &Activity, company: &str) -> String {
    let title = activity.title.clone().unwrap_or_else(|| {
        ActivityType::parse(&activity.activity_type)
            .map(|t| t.label().to_string())
            .unwrap_or_else(|| activity.activity_type.clone())
    });
    let due = activity
        .due_at
        .as_deref()
        .and_then(parse_stamp)
        .map(|d| format!(" (Due: {})", day_prefix(d)))
        .unwrap_or_default();
    format!("Reminder: {} for {}{} {}", title, company, due, activity_tag(activity.id))
}

fn activity_tag(activity_id: i32) -> String {
    format!("[Activity #{}]", activity_id)
}

/// Lowest-id manager other than `incumbent`
fn fallback_manager(candidates: &[i32], incumbent: i32) -> Option<i32> {
    candidates.iter().copied().find(|&id| id != incumbent)
}

impl LeadEngine {
    /// Reassign every overdue review, up to the configured batch size
    pub fn run_deadline_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let batch = self.sweep_config().deadline_batch;
        self.run_deadline_sweep_with(now, batch, &CancellationToken::new())
    }

    pub fn run_deadline_sweep_with(
        &self,
        now: DateTime<Utc>,
        batch: i64,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        let cutoff = stamp(now);
        let overdue = self.read("deadline_scan", |conn| {
            Ok(lead_assignments::table
                .inner_join(leads::table)
                .filter(lead_assignments::status.eq(AssignmentStatus::Pending.as_str()))
                .filter(lead_assignments::deadline_at.lt(&cutoff))
                .filter(leads::status.eq_any([LeadStatus::Pending.as_str(), LeadStatus::Resubmitted.as_str()]))
                .filter(leads::is_deleted.eq(false))
                .order((lead_assignments::deadline_at.asc(), lead_assignments::id.asc()))
                .limit(batch)
                .select((lead_assignments::id, lead_assignments::lead_id))
                .load::<(i32, i32)>(conn)?)
        })?;

        let mut report = SweepReport {
            scanned: overdue.len(),
            ..Default::default()
        };
        for (assignment_id, lead_id) in overdue {
            if cancel.is_cancelled() {
                tracing::info!("deadline sweep cancelled");
                break;
            }
            let outcome = self.reassign_overdue(assignment_id, now);
            report.record(outcome, "deadline reassignment", lead_id);
        }

        if report.scanned > 0 {
            tracing::info!(%report, "deadline sweep finished");
        }
        Ok(report)
    }

    fn reassign_overdue(&self, assignment_id: i32, now: DateTime<Utc>) -> Result<Handled> {
        let followup_hours = self.sla().followup_hours;
        self.transact_at("deadline_reassign", Some(now), |tx| {
            let Some(assignment) = lead_assignments::table
                .find(assignment_id)
                .first::<crate::db::Assignment>(tx.conn)
                .optional()?
            else {
                return Ok(Handled::Skipped);
            };
            if assignment.status != AssignmentStatus::Pending.as_str() || assignment.deadline_at >= tx.stamp {
                return Ok(Handled::Skipped);
            }
            let Some(lead) = leads::table
                .find(assignment.lead_id)
                .filter(leads::is_deleted.eq(false))
                .first::<crate::db::Lead>(tx.conn)
                .optional()?
            else {
                return Ok(Handled::Skipped);
            };
            if !status_of(&lead)?.awaiting_review() {
                return Ok(Handled::Skipped);
            }

            let incumbent = assignment.manager_id;
            let managers = allocator::candidates(tx.conn, Pool::Managers)?;
            let next = match allocator::peek_next(tx.conn, Pool::Managers)? {
                Some(id) if id != incumbent => Some(id),
                _ => fallback_manager(&managers, incumbent),
            };
            let Some(new_manager) = next else {
                tracing::warn!(lead_id = lead.id, "no other manager to take an overdue lead");
                return Ok(Handled::Skipped);
            };
            allocator::commit_choice(tx.conn, Pool::Managers, new_manager, &tx.stamp)?;

            open_assignment(tx, lead.id, new_manager, followup_hours, false, AssignmentStatus::Expired)?;
            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::current_manager_id.eq(Some(new_manager)),
                    leads::assigned_at.eq(Some(tx.stamp.as_str())),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;
            audit::manager_change(
                tx.conn,
                lead.id,
                Some(assignment.id),
                Some(incumbent),
                new_manager,
                DEADLINE_REASON,
                Trigger::System,
                &tx.stamp,
            )?;

            let old_name = load_user(tx.conn, incumbent)?.name;
            let new_name = load_user(tx.conn, new_manager)?.name;
            tx.note(
                lead.id,
                None,
                NoteType::System,
                &format!("Lead auto-reassigned from {} to {} due to missed deadline", old_name, new_name),
            )?;
            tx.notify(
                new_manager,
                Some(lead.id),
                &format!(
                    "Lead for {} has been reassigned to you (previous manager missed deadline)",
                    lead.company
                ),
                NotificationKind::Assignment,
                true,
            )?;
            tx.notify(
                incumbent,
                Some(lead.id),
                &format!("Lead for {} was reassigned (deadline missed)", lead.company),
                NotificationKind::Warning,
                true,
            )?;
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "auto_reassigned", "current_manager_id": new_manager }),
            );
            tracing::info!(lead_id = lead.id, from = incumbent, to = new_manager, "overdue lead reassigned");
            Ok(Handled::Acted)
        })
    }

    /// Notify owners of open activities whose reminder time has passed
    pub fn run_reminder_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let batch = self.sweep_config().reminder_batch;
        self.run_reminder_sweep_with(now, batch, &CancellationToken::new())
    }

    pub fn run_reminder_sweep_with(
        &self,
        now: DateTime<Utc>,
        batch: i64,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        let cutoff = stamp(now);
        let due = self.read("reminder_scan", |conn| {
            Ok(lead_activities::table
                .inner_join(leads::table)
                .filter(lead_activities::reminder_at.is_not_null())
                .filter(lead_activities::reminder_at.le(&cutoff))
                .filter(lead_activities::completed_at.is_null())
                .filter(leads::is_deleted.eq(false))
                .order((lead_activities::reminder_at.asc(), lead_activities::id.asc()))
                .limit(batch)
                .select((Activity::as_select(), leads::company))
                .load::<(Activity, String)>(conn)?)
        })?;

        let today = day_prefix(now);
        let mut report = SweepReport {
            scanned: due.len(),
            ..Default::default()
        };
        for (activity, company) in due {
            if cancel.is_cancelled() {
                tracing::info!("reminder sweep cancelled");
                break;
            }
            let outcome = self.send_reminder(&activity, &company, &today, now);
            report.record(outcome, "activity reminder", activity.id);
        }

        if report.acted > 0 {
            tracing::info!(%report, "reminder sweep finished");
        }
        Ok(report)
    }

    fn send_reminder(&self, activity: &Activity, company: &str, today: &str, now: DateTime<Utc>) -> Result<Handled> {
        let tag_pattern = format!("%{}", activity_tag(activity.id));
        let day_pattern = format!("{}%", today);
        let message = reminder_message(activity, company);
        self.transact_at("activity_reminder", Some(now), |tx| {
            let still_open = lead_activities::table
                .find(activity.id)
                .filter(lead_activities::completed_at.is_null())
                .count()
                .get_result::<i64>(tx.conn)?
                > 0;
            if !still_open {
                return Ok(Handled::Skipped);
            }
            let already_sent = notifications::table
                .filter(notifications::user_id.eq(activity.actor_id))
                .filter(notifications::message.like(&tag_pattern))
                .filter(notifications::created_at.like(&day_pattern))
                .count()
                .get_result::<i64>(tx.conn)?
                > 0;
            if already_sent {
                return Ok(Handled::Skipped);
            }
            tx.notify(
                activity.actor_id,
                Some(activity.lead_id),
                &message,
                NotificationKind::Reminder,
                true,
            )?;
            Ok(Handled::Acted)
        })
    }
}

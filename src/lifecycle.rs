//! Lead lifecycle engine
//!
//! [`LeadEngine`] owns every write to a lead. Each operation runs as one
//! immediate SQLite transaction wrapped in the retry policy: lead update,
//! audit rows, allocator pointer and notification rows commit together or
//! not at all. Real-time pushes are published only after commit.
//!
//! Guards run in a fixed order: input validation, then existence of actor
//! and lead, then the actor's role, then the status transition table
//! ([`LeadStatus::apply`]), then ownership of the lead. Nothing is written
//! until every guard has passed.

use crate::allocator::{self, Pool};
use crate::audit::{self, Trigger};
use crate::blob::{BlobStore, LocalBlobStore};
use crate::clock::{stamp, Clock, SystemClock};
use crate::config::{Config, SlaConfig, SweepConfig};
use crate::db::{
    last_insert_id, Assignment, Database, Lead, NewAssignment, NewLead, NewSocialProfile, SocialProfile, User,
};
use crate::error::{LeadError, Result};
use crate::notify::{self, Notice, NoPush, Outbox, PushChannel};
use crate::retry::RetryPolicy;
use crate::schema::*;
use crate::state::{LeadEvent, LeadStatus};
use crate::types::{ActivityType, AssignmentStatus, NoteType, NotificationKind, Role};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const COMMENT_MIN_CHARS: usize = 10;
pub const COMMENT_MAX_CHARS: usize = 1000;

/// One open transaction plus the pushes it will publish on commit
pub struct Tx<'a> {
    pub conn: &'a mut SqliteConnection,
    pub outbox: Outbox,
    pub now: DateTime<Utc>,
    pub stamp: String,
}

impl Tx<'_> {
    pub fn hours_from_now(&self, hours: i64) -> String {
        stamp(self.now + Duration::hours(hours))
    }

    pub fn note(&mut self, lead_id: i32, author: Option<i32>, note_type: NoteType, message: &str) -> Result<i32> {
        audit::note(self.conn, lead_id, author, note_type, message, &self.stamp)
    }

    pub fn notify(
        &mut self,
        user_id: i32,
        lead_id: Option<i32>,
        message: &str,
        kind: NotificationKind,
        play_sound: bool,
    ) -> Result<i32> {
        let notice = Notice {
            user_id,
            lead_id,
            message,
            kind,
            play_sound,
        };
        notify::dispatch(self.conn, &mut self.outbox, &notice, &self.stamp)
    }
}

/// Contact and company fields of a new lead
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadFields {
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    pub company: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub linkedin: Option<String>,
    #[serde(default)]
    pub twitter: Option<String>,
    #[serde(default)]
    pub facebook: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

/// Longest profile URL accepted
const MAX_PROFILE_URL: usize = 500;

impl LeadFields {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("full name", &self.full_name),
            ("email", &self.email),
            ("company", &self.company),
        ] {
            if value.trim().is_empty() {
                return Err(LeadError::Validation(format!("{} is required", field)));
            }
        }
        validate_email(&self.email)?;
        for (platform, url) in self.social_profiles() {
            validate_profile_url(platform, url)?;
        }
        Ok(())
    }

    /// Profile links that were filled in, as `(platform, url)`
    pub fn social_profiles(&self) -> Vec<(&'static str, &str)> {
        [
            ("linkedin", &self.linkedin),
            ("twitter", &self.twitter),
            ("facebook", &self.facebook),
            ("website", &self.website),
        ]
        .into_iter()
        .filter_map(|(platform, url)| {
            let url = url.as_deref()?.trim();
            (!url.is_empty()).then_some((platform, url))
        })
        .collect()
    }

    pub fn services_csv(&self) -> String {
        self.services
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn validate_profile_url(platform: &str, url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or_default();
    if rest.is_empty() || url.len() > MAX_PROFILE_URL || url.chars().any(char::is_whitespace) {
        return Err(LeadError::Validation(format!("{} profile '{}' is not a valid URL", platform, url)));
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(LeadError::Validation(format!("'{}' is not a valid email address", email))),
    }
}

/// How a submitted lead found its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Distribution {
    RoundRobin,
    Random,
}

pub struct LeadEngine {
    db: Database,
    clock: Arc<dyn Clock>,
    push: Arc<dyn PushChannel>,
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    sla: SlaConfig,
    sweeps: SweepConfig,
}

impl LeadEngine {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
            push: Arc::new(NoPush),
            blobs: Arc::new(LocalBlobStore::new(&config.storage.upload_dir)),
            retry: RetryPolicy::from(&config.retry),
            sla: config.sla.clone(),
            sweeps: config.sweeps.clone(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushChannel>) -> Self {
        self.push = push;
        self
    }

    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn sla(&self) -> &SlaConfig {
        &self.sla
    }

    pub fn sweep_config(&self) -> &SweepConfig {
        &self.sweeps
    }

    pub(crate) fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    /// Run `op` in an immediate transaction, retrying transient failures,
    /// then publish whatever it queued in the outbox.
    pub fn transact<T, F>(&self, context: &str, op: F) -> Result<T>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T>,
    {
        self.transact_at(context, None, op)
    }

    /// [`transact`](Self::transact) with an explicit "now" instead of the clock
    pub fn transact_at<T, F>(&self, context: &str, at: Option<DateTime<Utc>>, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T>,
    {
        let (value, outbox) = self.retry.run(context, |_attempt| {
            let mut conn = self.db.conn()?;
            let now = at.unwrap_or_else(|| self.clock.now());
            conn.immediate_transaction::<_, LeadError, _>(|conn| {
                let mut tx = Tx {
                    conn,
                    outbox: Outbox::default(),
                    now,
                    stamp: stamp(now),
                };
                let value = op(&mut tx)?;
                Ok((value, tx.outbox))
            })
        })?;
        outbox.flush(self.push.as_ref());
        Ok(value)
    }

    /// Read-only access, retried like a transition
    pub fn read<T, F>(&self, context: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&mut SqliteConnection) -> Result<T>,
    {
        self.retry.run(context, |_attempt| {
            let mut conn = self.db.conn()?;
            op(&mut *conn)
        })
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Create a lead and hand it to a manager.
    ///
    /// A marketer's lead goes to the next manager in rotation; a manager's
    /// lead goes to a random other manager without moving the pointer. With
    /// no eligible manager the lead stays unassigned.
    pub fn submit_lead(&self, submitter_id: i32, fields: &LeadFields) -> Result<i32> {
        fields.validate()?;
        let services_csv = fields.services_csv();
        let initial_hours = self.sla.initial_hours;

        let (lead_id, manager_id) = self.transact("submit_lead", |tx| {
            let submitter = load_user(tx.conn, submitter_id)?;
            let (manager_id, method) = match role_of(&submitter)? {
                Role::Marketer => (
                    allocator::take_next(tx.conn, Pool::Managers, &tx.stamp)?,
                    Distribution::RoundRobin,
                ),
                Role::Manager => (random_other_manager(tx.conn, submitter.id)?, Distribution::Random),
                _ => {
                    return Err(LeadError::Forbidden(
                        "only marketers and managers can submit leads".into(),
                    ))
                }
            };

            let assigned_at = manager_id.map(|_| tx.stamp.clone());
            diesel::insert_into(leads::table)
                .values(&NewLead {
                    submitted_by_user_id: submitter.id,
                    full_name: fields.full_name.trim(),
                    email: fields.email.trim(),
                    phone: fields.phone.trim(),
                    company: fields.company.trim(),
                    domain: fields.domain.trim(),
                    industry: fields.industry.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                    services_csv: &services_csv,
                    country: fields.country.trim(),
                    state: fields.state.trim(),
                    city: fields.city.trim(),
                    status: LeadStatus::Pending.as_str(),
                    current_manager_id: manager_id,
                    created_at: &tx.stamp,
                    assigned_at: assigned_at.as_deref(),
                    updated_at: &tx.stamp,
                    is_deleted: false,
                })
                .execute(tx.conn)?;
            let lead_id = last_insert_id(tx.conn)?;

            for (platform, url) in fields.social_profiles() {
                diesel::insert_into(lead_social_profiles::table)
                    .values(&NewSocialProfile {
                        lead_id,
                        platform,
                        url,
                        added_by_id: submitter.id,
                        created_at: &tx.stamp,
                    })
                    .execute(tx.conn)?;
            }

            tx.note(
                lead_id,
                Some(submitter.id),
                NoteType::System,
                &format!("Lead created by {}", submitter.name),
            )?;

            if let Some(manager_id) = manager_id {
                let manager = load_user(tx.conn, manager_id)?;
                let mut message = format!("Auto-assigned to {}", manager.name);
                if method == Distribution::RoundRobin {
                    message.push_str(" (round-robin distribution)");
                }
                tx.note(lead_id, Some(submitter.id), NoteType::System, &message)?;
                open_assignment(tx, lead_id, manager_id, initial_hours, true, AssignmentStatus::Reassigned)?;
                tx.notify(
                    manager_id,
                    Some(lead_id),
                    &format!(
                        "New lead from {} has been assigned to you: {}",
                        submitter.name,
                        fields.company.trim()
                    ),
                    NotificationKind::Assignment,
                    true,
                )?;
            }

            tx.outbox.lead_event(
                "lead_created",
                lead_id,
                json!({ "status": LeadStatus::Pending, "current_manager_id": manager_id }),
            );
            Ok((lead_id, manager_id))
        })?;

        tracing::info!(lead_id, submitter_id, manager_id = ?manager_id, "lead submitted");
        Ok(lead_id)
    }

    pub fn accept_lead(&self, lead_id: i32, actor_id: i32) -> Result<()> {
        self.transact("accept_lead", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            let role = role_of(&actor)?;
            require_reviewer(role, "accept leads")?;
            let next = check_event(&lead, LeadEvent::Accept)?;

            let pending = pending_assignment(tx.conn, lead.id)?;
            if role == Role::Manager {
                if let Some(p) = &pending {
                    if p.manager_id != actor.id {
                        return Err(LeadError::Forbidden(format!(
                            "lead {} is waiting on another manager",
                            lead.id
                        )));
                    }
                }
            }

            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::status.eq(next.as_str()),
                    leads::accepted_at.eq(Some(tx.stamp.as_str())),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;

            if let Some(p) = pending {
                diesel::update(lead_assignments::table.find(p.id))
                    .set((
                        lead_assignments::status.eq(AssignmentStatus::Acted.as_str()),
                        lead_assignments::acted_at.eq(Some(tx.stamp.as_str())),
                    ))
                    .execute(tx.conn)?;
            }

            tx.note(lead.id, Some(actor.id), NoteType::System, &format!("Lead accepted by {}", actor.name))?;
            tx.notify(
                lead.submitted_by_user_id,
                Some(lead.id),
                &format!("Your lead for {} has been accepted!", lead.company),
                NotificationKind::Success,
                true,
            )?;
            tx.outbox.lead_event("lead_updated", lead.id, json!({ "update_type": "accepted", "status": next }));
            Ok(())
        })?;
        tracing::info!(lead_id, actor_id, "lead accepted");
        Ok(())
    }

    /// Reject a pending lead. The open assignment stays pending; it is
    /// picked up by the deadline sweep only once the lead is resubmitted.
    pub fn reject_lead(&self, lead_id: i32, actor_id: i32, comment: &str) -> Result<()> {
        let comment = require_comment(comment)?;
        self.transact("reject_lead", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_reviewer(role_of(&actor)?, "reject leads")?;
            let next = check_event(&lead, LeadEvent::Reject)?;

            diesel::update(leads::table.find(lead.id))
                .set((leads::status.eq(next.as_str()), leads::updated_at.eq(&tx.stamp)))
                .execute(tx.conn)?;

            tx.note(lead.id, Some(actor.id), NoteType::Rejection, comment)?;
            tx.notify(
                lead.submitted_by_user_id,
                Some(lead.id),
                &format!("Your lead for {} has been rejected. Please review the comments.", lead.company),
                NotificationKind::Warning,
                true,
            )?;
            tx.outbox.lead_event("lead_updated", lead.id, json!({ "update_type": "rejected", "status": next }));
            Ok(())
        })?;
        tracing::info!(lead_id, actor_id, "lead rejected");
        Ok(())
    }

    /// Send an accepted lead back to Rejected and reopen review by the actor
    pub fn revert_lead(&self, lead_id: i32, actor_id: i32, comment: &str) -> Result<()> {
        let comment = require_comment(comment)?;
        let revert_hours = self.sla.revert_hours;
        self.transact("revert_lead", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_reviewer(role_of(&actor)?, "revert leads")?;
            let next = check_event(&lead, LeadEvent::Revert)?;

            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::status.eq(next.as_str()),
                    leads::accepted_at.eq(None::<String>),
                    leads::current_manager_id.eq(Some(actor.id)),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;

            diesel::update(
                lead_assignments::table
                    .filter(lead_assignments::lead_id.eq(lead.id))
                    .filter(lead_assignments::status.eq(AssignmentStatus::Acted.as_str())),
            )
            .set(lead_assignments::status.eq(AssignmentStatus::Reverted.as_str()))
            .execute(tx.conn)?;

            open_assignment(tx, lead.id, actor.id, revert_hours, false, AssignmentStatus::Expired)?;

            tx.note(
                lead.id,
                Some(actor.id),
                NoteType::Reversion,
                &format!(
                    "Lead reverted from 'Accepted' to 'Rejected' by {}.\nReason: {}",
                    actor.name, comment
                ),
            )?;
            tx.notify(
                lead.submitted_by_user_id,
                Some(lead.id),
                &format!(
                    "Your accepted lead for {} has been re-rejected by {}. Please review the comments.",
                    lead.company, actor.name
                ),
                NotificationKind::Warning,
                true,
            )?;
            tx.outbox.lead_event("lead_updated", lead.id, json!({ "update_type": "reverted", "status": next }));
            Ok(())
        })?;
        tracing::info!(lead_id, actor_id, "lead reverted");
        Ok(())
    }

    pub fn resubmit_lead(&self, lead_id: i32, actor_id: i32, comment: &str) -> Result<()> {
        let comment = require_comment(comment)?;
        self.transact("resubmit_lead", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            let next = check_event(&lead, LeadEvent::Resubmit)?;
            if lead.submitted_by_user_id != actor.id {
                return Err(LeadError::Forbidden("you can only resubmit your own leads".into()));
            }

            diesel::update(leads::table.find(lead.id))
                .set((leads::status.eq(next.as_str()), leads::updated_at.eq(&tx.stamp)))
                .execute(tx.conn)?;
            tx.note(lead.id, Some(actor.id), NoteType::Resubmission, comment)?;

            let reviewers = users::table
                .filter(users::role.eq_any([Role::Admin.as_str(), Role::Manager.as_str()]))
                .order(users::id.asc())
                .select(users::id)
                .load::<i32>(tx.conn)?;
            let message = format!(
                "Lead for {} has been resubmitted by {} for re-review.",
                lead.company, actor.name
            );
            for reviewer in reviewers {
                tx.notify(reviewer, Some(lead.id), &message, NotificationKind::Info, true)?;
            }
            tx.outbox.lead_event("lead_updated", lead.id, json!({ "update_type": "resubmitted", "status": next }));
            Ok(())
        })?;
        tracing::info!(lead_id, actor_id, "lead resubmitted");
        Ok(())
    }

    /// Put an accepted lead in a BD user's pipeline at the first stage.
    /// Also used to move the lead to another BD user.
    pub fn assign_bd(&self, lead_id: i32, actor_id: i32, bd_user_id: i32, note: Option<&str>) -> Result<()> {
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        self.transact("assign_bd", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            if !matches!(role_of(&actor)?, Role::Admin | Role::Manager | Role::BdSales) {
                return Err(LeadError::Forbidden("you do not have permission to assign leads".into()));
            }
            check_event(&lead, LeadEvent::AssignBd)?;

            let bd_user = load_user(tx.conn, bd_user_id)?;
            if role_of(&bd_user)? != Role::BdSales {
                return Err(LeadError::Validation(format!("{} is not a BD sales user", bd_user.name)));
            }
            let first_stage = pipeline_stages::table
                .order((pipeline_stages::position.asc(), pipeline_stages::id.asc()))
                .select(pipeline_stages::id)
                .first::<i32>(tx.conn)
                .optional()?
                .ok_or_else(|| LeadError::InvalidState("no pipeline stages are configured".into()))?;

            let previous_bd = lead.assigned_bd_id;
            let action = if previous_bd.is_some() { "Reassigned" } else { "Assigned" };

            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::assigned_bd_id.eq(Some(bd_user.id)),
                    leads::current_stage_id.eq(Some(first_stage)),
                    leads::assigned_to_bd_at.eq(Some(tx.stamp.as_str())),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;

            let default_reason = format!("{} by {}", action, actor.name);
            audit::bd_change(
                tx.conn,
                lead.id,
                previous_bd,
                bd_user.id,
                actor.id,
                Some(note.unwrap_or(&default_reason)),
                &tx.stamp,
            )?;
            if lead.current_stage_id != Some(first_stage) {
                audit::stage_change(tx.conn, lead.id, lead.current_stage_id, first_stage, actor.id, None, &tx.stamp)?;
            }
            if previous_bd != Some(bd_user.id) {
                allocator::commit_choice(tx.conn, Pool::BdSales, bd_user.id, &tx.stamp)?;
            }

            let mut description = format!("{} {} this lead to {}", actor.name, action.to_lowercase(), bd_user.name);
            if let Some(note) = note {
                description.push_str(&format!("\n\nNote: {}", note));
            }
            let title = format!("{} to BD Sales", action);
            crate::activities::record(
                tx.conn,
                lead.id,
                actor.id,
                ActivityType::Assignment,
                Some(title.as_str()),
                Some(description.as_str()),
                None,
                None,
                &tx.stamp,
            )?;

            let prefix = if previous_bd.is_some() { "Reassigned" } else { "New" };
            tx.notify(
                bd_user.id,
                Some(lead.id),
                &format!("{} lead assigned to you: {}", prefix, lead.company),
                NotificationKind::Assignment,
                true,
            )?;
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "bd_assigned", "assigned_bd_id": bd_user.id, "stage_id": first_stage }),
            );
            Ok(())
        })?;
        tracing::info!(lead_id, actor_id, bd_user_id, "lead assigned to BD");
        Ok(())
    }

    /// Move a BD-assigned lead to another pipeline stage. Moving to the
    /// current stage succeeds without writing anything.
    pub fn move_stage(&self, lead_id: i32, actor_id: i32, stage_id: i32) -> Result<()> {
        let moved = self.transact("move_stage", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            let role = role_of(&actor)?;
            if !matches!(role, Role::Admin | Role::Manager | Role::BdSales) {
                return Err(LeadError::Forbidden("you do not have permission to move leads".into()));
            }
            let stage = pipeline_stages::table
                .find(stage_id)
                .select((pipeline_stages::id, pipeline_stages::name))
                .first::<(i32, String)>(tx.conn)
                .optional()?
                .ok_or_else(|| LeadError::not_found(format!("stage {}", stage_id)))?;
            check_event(&lead, LeadEvent::MoveStage)?;
            if role == Role::BdSales && lead.assigned_bd_id != Some(actor.id) {
                return Err(LeadError::Forbidden("you can only update your assigned leads".into()));
            }

            if lead.current_stage_id == Some(stage.0) {
                return Ok(false);
            }

            let old_name = match lead.current_stage_id {
                Some(id) => pipeline_stages::table
                    .find(id)
                    .select(pipeline_stages::name)
                    .first::<String>(tx.conn)
                    .optional()?,
                None => None,
            };

            diesel::update(leads::table.find(lead.id))
                .set((leads::current_stage_id.eq(Some(stage.0)), leads::updated_at.eq(&tx.stamp)))
                .execute(tx.conn)?;
            let history_note = format!(
                "Stage changed from {} to {}",
                old_name.as_deref().unwrap_or("None"),
                stage.1
            );
            audit::stage_change(
                tx.conn,
                lead.id,
                lead.current_stage_id,
                stage.0,
                actor.id,
                Some(history_note.as_str()),
                &tx.stamp,
            )?;

            if let Some(bd_id) = lead.assigned_bd_id.filter(|&bd| bd != actor.id) {
                let label = if lead.company.is_empty() { &lead.full_name } else { &lead.company };
                tx.notify(
                    bd_id,
                    Some(lead.id),
                    &format!("{} moved lead \"{}\" to {}", actor.name, label, stage.1),
                    NotificationKind::StageChange,
                    false,
                )?;
            }
            tx.outbox.lead_event(
                "lead_stage_updated",
                lead.id,
                json!({
                    "new_stage_id": stage.0,
                    "new_stage_name": stage.1,
                    "old_stage_id": lead.current_stage_id,
                    "old_stage_name": old_name,
                    "changed_by": actor.name,
                }),
            );
            Ok(true)
        })?;
        if moved {
            tracing::info!(lead_id, actor_id, stage_id, "lead stage moved");
        }
        Ok(())
    }

    /// Admin override of the manager currently reviewing a lead
    pub fn reassign_manager(&self, lead_id: i32, admin_id: i32, new_manager_id: i32, reason: &str) -> Result<()> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LeadError::Validation("a reason is required".into()));
        }
        let followup_hours = self.sla.followup_hours;
        self.transact("reassign_manager", |tx| {
            let admin = load_user(tx.conn, admin_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            if role_of(&admin)? != Role::Admin {
                return Err(LeadError::Forbidden("only admins can reassign managers".into()));
            }
            check_event(&lead, LeadEvent::Reassign)?;
            let manager = load_user(tx.conn, new_manager_id)?;
            if role_of(&manager)? != Role::Manager {
                return Err(LeadError::Validation(format!("{} is not a manager", manager.name)));
            }
            if lead.current_manager_id == Some(manager.id) {
                return Err(LeadError::InvalidState(format!(
                    "lead {} is already assigned to {}",
                    lead.id, manager.name
                )));
            }

            let (previous, _) =
                open_assignment(tx, lead.id, manager.id, followup_hours, false, AssignmentStatus::Reassigned)?;
            let from_manager = previous.as_ref().map(|p| p.manager_id).or(lead.current_manager_id);
            audit::manager_change(
                tx.conn,
                lead.id,
                previous.as_ref().map(|p| p.id),
                from_manager,
                manager.id,
                reason,
                Trigger::Admin,
                &tx.stamp,
            )?;
            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::current_manager_id.eq(Some(manager.id)),
                    leads::assigned_at.eq(Some(tx.stamp.as_str())),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;

            let old_name = match from_manager {
                Some(id) => Some(load_user(tx.conn, id)?.name),
                None => None,
            };
            tx.note(
                lead.id,
                Some(admin.id),
                NoteType::System,
                &format!(
                    "Lead reassigned from {} to {} by {}: {}",
                    old_name.as_deref().unwrap_or("nobody"),
                    manager.name,
                    admin.name,
                    reason
                ),
            )?;
            tx.notify(
                manager.id,
                Some(lead.id),
                &format!("Lead for {} has been reassigned to you by {}", lead.company, admin.name),
                NotificationKind::Assignment,
                true,
            )?;
            if let Some(old) = from_manager.filter(|&id| id != manager.id) {
                tx.notify(
                    old,
                    Some(lead.id),
                    &format!("Lead for {} was reassigned to {}", lead.company, manager.name),
                    NotificationKind::Warning,
                    true,
                )?;
            }
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "reassigned", "current_manager_id": manager.id }),
            );
            Ok(())
        })?;
        tracing::info!(lead_id, admin_id, new_manager_id, "manager reassigned by admin");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// BD user the next assignment would suggest, pointer untouched
    pub fn peek_suggested_bd(&self) -> Result<Option<i32>> {
        self.read("peek_suggested_bd", |conn| allocator::peek_next(conn, Pool::BdSales))
    }

    pub fn peek_next_manager(&self) -> Result<Option<i32>> {
        self.read("peek_next_manager", |conn| allocator::peek_next(conn, Pool::Managers))
    }

    pub fn get_lead(&self, lead_id: i32) -> Result<Lead> {
        self.read("get_lead", |conn| load_lead(conn, lead_id))
    }

    /// Leads, newest first, optionally filtered by status
    pub fn list_leads(&self, status: Option<LeadStatus>, limit: i64) -> Result<Vec<Lead>> {
        self.read("list_leads", |conn| {
            let mut query = leads::table
                .filter(leads::is_deleted.eq(false))
                .order(leads::id.desc())
                .limit(limit)
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(leads::status.eq(status.as_str()));
            }
            Ok(query.load::<Lead>(conn)?)
        })
    }

    pub fn assignments(&self, lead_id: i32) -> Result<Vec<Assignment>> {
        self.read("assignments", |conn| {
            load_lead(conn, lead_id)?;
            Ok(lead_assignments::table
                .filter(lead_assignments::lead_id.eq(lead_id))
                .order(lead_assignments::id.asc())
                .load::<Assignment>(conn)?)
        })
    }

    pub fn social_profiles(&self, lead_id: i32) -> Result<Vec<SocialProfile>> {
        self.read("social_profiles", |conn| {
            load_lead(conn, lead_id)?;
            Ok(lead_social_profiles::table
                .filter(lead_social_profiles::lead_id.eq(lead_id))
                .order(lead_social_profiles::id.asc())
                .load::<SocialProfile>(conn)?)
        })
    }

    pub fn timeline(&self, lead_id: i32) -> Result<Vec<audit::TimelineEntry>> {
        self.read("timeline", |conn| {
            load_lead(conn, lead_id)?;
            audit::timeline(conn, lead_id)
        })
    }
}

// ============================================================================
// Shared guards and helpers
// ============================================================================

pub(crate) fn load_lead(conn: &mut SqliteConnection, lead_id: i32) -> Result<Lead> {
    leads::table
        .find(lead_id)
        .filter(leads::is_deleted.eq(false))
        .first::<Lead>(conn)
        .optional()?
        .ok_or_else(|| LeadError::not_found(format!("lead {}", lead_id)))
}

pub(crate) fn load_user(conn: &mut SqliteConnection, user_id: i32) -> Result<User> {
    users::table
        .find(user_id)
        .first::<User>(conn)
        .optional()?
        .ok_or_else(|| LeadError::not_found(format!("user {}", user_id)))
}

pub(crate) fn role_of(user: &User) -> Result<Role> {
    Role::parse(&user.role)
        .ok_or_else(|| LeadError::Validation(format!("user {} has unknown role '{}'", user.id, user.role)))
}

pub(crate) fn status_of(lead: &Lead) -> Result<LeadStatus> {
    LeadStatus::parse(&lead.status)
        .ok_or_else(|| LeadError::InvalidState(format!("lead {} has unknown status '{}'", lead.id, lead.status)))
}

/// Target status for `event`, or `InvalidState`
pub(crate) fn check_event(lead: &Lead, event: LeadEvent) -> Result<LeadStatus> {
    let status = status_of(lead)?;
    let bd_assigned = lead.assigned_bd_id.is_some();
    status.apply(event, bd_assigned).ok_or_else(|| {
        if event == LeadEvent::MoveStage && status == LeadStatus::Accepted && !bd_assigned {
            LeadError::InvalidState(format!("lead {} has not been assigned to BD sales", lead.id))
        } else {
            LeadError::InvalidState(format!("cannot {} lead {} while it is {}", event.verb(), lead.id, status))
        }
    })
}

fn require_reviewer(role: Role, what: &str) -> Result<()> {
    if role.is_reviewer() {
        Ok(())
    } else {
        Err(LeadError::Forbidden(format!("only admins and managers can {}", what)))
    }
}

pub(crate) fn require_comment(comment: &str) -> Result<&str> {
    let trimmed = comment.trim();
    if trimmed.is_empty() {
        return Err(LeadError::Validation("a comment is required".into()));
    }
    let len = trimmed.chars().count();
    if !(COMMENT_MIN_CHARS..=COMMENT_MAX_CHARS).contains(&len) {
        return Err(LeadError::Validation(format!(
            "comment must be between {} and {} characters",
            COMMENT_MIN_CHARS, COMMENT_MAX_CHARS
        )));
    }
    Ok(trimmed)
}

pub(crate) fn pending_assignment(conn: &mut SqliteConnection, lead_id: i32) -> Result<Option<Assignment>> {
    Ok(lead_assignments::table
        .filter(lead_assignments::lead_id.eq(lead_id))
        .filter(lead_assignments::status.eq(AssignmentStatus::Pending.as_str()))
        .first::<Assignment>(conn)
        .optional()?)
}

/// Open a new pending assignment, closing any open one as `supersede`.
/// Returns the superseded row and the new row's id.
pub(crate) fn open_assignment(
    tx: &mut Tx<'_>,
    lead_id: i32,
    manager_id: i32,
    hours: i64,
    initial: bool,
    supersede: AssignmentStatus,
) -> Result<(Option<Assignment>, i32)> {
    let previous = pending_assignment(tx.conn, lead_id)?;
    if let Some(prev) = &previous {
        diesel::update(lead_assignments::table.find(prev.id))
            .set(lead_assignments::status.eq(supersede.as_str()))
            .execute(tx.conn)?;
    }

    let deadline = tx.hours_from_now(hours);
    diesel::insert_into(lead_assignments::table)
        .values(&NewAssignment {
            lead_id,
            manager_id,
            assigned_at: &tx.stamp,
            deadline_at: &deadline,
            status: AssignmentStatus::Pending.as_str(),
            is_initial_assignment: initial,
        })
        .execute(tx.conn)?;
    let id = last_insert_id(tx.conn)?;
    Ok((previous, id))
}

fn random_other_manager(conn: &mut SqliteConnection, submitter_id: i32) -> Result<Option<i32>> {
    let others: Vec<i32> = allocator::candidates(conn, Pool::Managers)?
        .into_iter()
        .filter(|&id| id != submitter_id)
        .collect();
    Ok(others.choose(&mut rand::thread_rng()).copied())
}

//! Lead activities: notes, tasks, follow-ups and reminders
//!
//! Activities are the one audit table whose rows change after insert: the
//! completion flag can be toggled. A reminder is due once `reminder_at` has
//! passed and the activity is still open; see [`crate::sweep`].

use crate::clock::stamp;
use crate::db::{last_insert_id, Activity, Lead, NewActivity, User};
use crate::error::{LeadError, Result};
use crate::lifecycle::{load_lead, load_user, role_of, LeadEngine};
use crate::schema::lead_activities;
use crate::types::{ActivityType, Role};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Deserialize;
use serde_json::json;

/// Activity as entered by a user
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityInput {
    pub activity_type: ActivityType,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reminder_at: Option<DateTime<Utc>>,
}

/// Insert an activity row inside the caller's transaction
pub(crate) fn record(
    conn: &mut SqliteConnection,
    lead_id: i32,
    actor_id: i32,
    activity_type: ActivityType,
    title: Option<&str>,
    description: Option<&str>,
    due_at: Option<&str>,
    reminder_at: Option<&str>,
    now: &str,
) -> Result<i32> {
    diesel::insert_into(lead_activities::table)
        .values(&NewActivity {
            lead_id,
            actor_id,
            activity_type: activity_type.as_str(),
            title,
            description,
            due_at,
            reminder_at,
            created_at: now,
        })
        .execute(conn)?;
    Ok(last_insert_id(conn)?)
}

/// Admins and managers work on any lead, BD sales only on their own
fn require_activity_access(actor: &User, lead: &Lead) -> Result<()> {
    match role_of(actor)? {
        Role::Admin | Role::Manager => Ok(()),
        Role::BdSales if lead.assigned_bd_id == Some(actor.id) => Ok(()),
        Role::BdSales => Err(LeadError::Forbidden(
            "you can only manage activities for your assigned leads".into(),
        )),
        Role::Marketer => Err(LeadError::Forbidden(
            "you do not have permission to manage activities".into(),
        )),
    }
}

fn load_activity(conn: &mut SqliteConnection, lead_id: i32, activity_id: i32) -> Result<Activity> {
    lead_activities::table
        .find(activity_id)
        .filter(lead_activities::lead_id.eq(lead_id))
        .first::<Activity>(conn)
        .optional()?
        .ok_or_else(|| LeadError::not_found(format!("activity {}", activity_id)))
}

impl LeadEngine {
    pub fn add_activity(&self, lead_id: i32, actor_id: i32, input: &ActivityInput) -> Result<i32> {
        let title = input.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let description = input.description.as_deref().map(str::trim).filter(|d| !d.is_empty());
        if title.is_none() && description.is_none() {
            return Err(LeadError::Validation("an activity needs a title or a description".into()));
        }
        let due_at = input.due_at.map(stamp);
        let reminder_at = input.reminder_at.map(stamp);

        let id = self.transact("add_activity", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_activity_access(&actor, &lead)?;
            let id = record(
                tx.conn,
                lead.id,
                actor.id,
                input.activity_type,
                title,
                description,
                due_at.as_deref(),
                reminder_at.as_deref(),
                &tx.stamp,
            )?;
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "activity_added", "activity_id": id, "updated_by": actor.name }),
            );
            Ok(id)
        })?;
        tracing::info!(lead_id, actor_id, activity_id = id, kind = input.activity_type.as_str(), "activity added");
        Ok(id)
    }

    /// Flip an activity between open and completed; returns the new state
    pub fn toggle_activity(&self, lead_id: i32, activity_id: i32, actor_id: i32) -> Result<bool> {
        self.transact("toggle_activity", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_activity_access(&actor, &lead)?;
            let activity = load_activity(tx.conn, lead.id, activity_id)?;

            let completed_at = match activity.completed_at {
                Some(_) => None,
                None => Some(tx.stamp.clone()),
            };
            let completed = completed_at.is_some();
            diesel::update(lead_activities::table.find(activity.id))
                .set(lead_activities::completed_at.eq(completed_at))
                .execute(tx.conn)?;
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "activity_toggled", "activity_id": activity.id, "completed": completed }),
            );
            Ok(completed)
        })
    }

    pub fn delete_activity(&self, lead_id: i32, activity_id: i32, actor_id: i32) -> Result<()> {
        self.transact("delete_activity", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_activity_access(&actor, &lead)?;
            let activity = load_activity(tx.conn, lead.id, activity_id)?;
            diesel::delete(lead_activities::table.find(activity.id)).execute(tx.conn)?;
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "activity_deleted", "activity_id": activity.id, "updated_by": actor.name }),
            );
            Ok(())
        })?;
        tracing::info!(lead_id, activity_id, actor_id, "activity deleted");
        Ok(())
    }

    /// Activities of a lead, newest first
    pub fn activities(&self, lead_id: i32) -> Result<Vec<Activity>> {
        self.read("activities", |conn| {
            load_lead(conn, lead_id)?;
            Ok(lead_activities::table
                .filter(lead_activities::lead_id.eq(lead_id))
                .order((lead_activities::created_at.desc(), lead_activities::id.desc()))
                .load::<Activity>(conn)?)
        })
    }
}

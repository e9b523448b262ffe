//! Append-only audit trail
//!
//! Writers take the caller's connection and run inside the transition's
//! transaction. [`timeline`] merges every trail into one newest-first view.

use crate::db::{
    last_insert_id, Activity, AssignmentHistory, BdHistory, EditChange, NewAssignmentHistory,
    NewBdHistory, NewEditChange, NewNote, NewStageHistory, Note, StageHistory,
};
use crate::error::Result;
use crate::schema::*;
use crate::types::{ActivityType, NoteType};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::collections::HashMap;

/// Who started a manager reassignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Admin,
    System,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Admin => "admin",
            Trigger::System => "system",
        }
    }
}

/// `author` is `None` for notes written by the system itself
pub fn note(
    conn: &mut SqliteConnection,
    lead_id: i32,
    author: Option<i32>,
    note_type: NoteType,
    message: &str,
    now: &str,
) -> Result<i32> {
    diesel::insert_into(lead_notes::table)
        .values(&NewNote {
            lead_id,
            author_user_id: author,
            note_type: note_type.as_str(),
            message,
            created_at: now,
        })
        .execute(conn)?;
    Ok(last_insert_id(conn)?)
}

pub fn stage_change(
    conn: &mut SqliteConnection,
    lead_id: i32,
    from_stage: Option<i32>,
    to_stage: i32,
    changed_by: i32,
    note: Option<&str>,
    now: &str,
) -> Result<()> {
    diesel::insert_into(lead_stage_history::table)
        .values(&NewStageHistory {
            lead_id,
            from_stage_id: from_stage,
            to_stage_id: to_stage,
            changed_by_id: changed_by,
            note,
            changed_at: now,
        })
        .execute(conn)?;
    Ok(())
}

pub fn bd_change(
    conn: &mut SqliteConnection,
    lead_id: i32,
    from_bd: Option<i32>,
    to_bd: i32,
    assigned_by: i32,
    reason: Option<&str>,
    now: &str,
) -> Result<()> {
    diesel::insert_into(bd_assignment_history::table)
        .values(&NewBdHistory {
            lead_id,
            from_bd_id: from_bd,
            to_bd_id: to_bd,
            assigned_by_id: assigned_by,
            reason,
            reassigned_at: now,
        })
        .execute(conn)?;
    Ok(())
}

pub fn manager_change(
    conn: &mut SqliteConnection,
    lead_id: i32,
    assignment_id: Option<i32>,
    from_manager: Option<i32>,
    to_manager: i32,
    reason: &str,
    trigger: Trigger,
    now: &str,
) -> Result<()> {
    diesel::insert_into(lead_assignment_history::table)
        .values(&NewAssignmentHistory {
            lead_id,
            assignment_id,
            from_manager_id: from_manager,
            to_manager_id: to_manager,
            reason,
            triggered_by: trigger.as_str(),
            reassigned_at: now,
        })
        .execute(conn)?;
    Ok(())
}

pub fn field_change(
    conn: &mut SqliteConnection,
    lead_id: i32,
    editor: i32,
    field: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    now: &str,
) -> Result<()> {
    diesel::insert_into(lead_edit_changes::table)
        .values(&NewEditChange {
            lead_id,
            editor_user_id: editor,
            field_name: field,
            old_value,
            new_value,
            created_at: now,
        })
        .execute(conn)?;
    Ok(())
}

// ============================================================================
// Timeline
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Note,
    StageChange,
    BdAssignment,
    ManagerReassignment,
    Activity,
    Edit,
}

/// One line of a lead's history
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimelineEntry {
    pub at: String,
    pub kind: EntryKind,
    pub actor_id: Option<i32>,
    pub actor_name: Option<String>,
    pub summary: String,
}

/// Every audit row of a lead, newest first
pub fn timeline(conn: &mut SqliteConnection, lead_id: i32) -> Result<Vec<TimelineEntry>> {
    let stage_names: HashMap<i32, String> = pipeline_stages::table
        .select((pipeline_stages::id, pipeline_stages::name))
        .load::<(i32, String)>(conn)?
        .into_iter()
        .collect();
    let stage_name = |id: Option<i32>| {
        id.and_then(|id| stage_names.get(&id).cloned())
            .unwrap_or_else(|| "None".to_string())
    };

    let mut entries = Vec::new();

    for n in lead_notes::table
        .filter(lead_notes::lead_id.eq(lead_id))
        .load::<Note>(conn)?
    {
        entries.push(TimelineEntry {
            at: n.created_at,
            kind: EntryKind::Note,
            actor_id: n.author_user_id,
            actor_name: None,
            summary: match n.note_type.as_str() {
                "system" => n.message,
                other => format!("[{}] {}", other, n.message),
            },
        });
    }

    for h in lead_stage_history::table
        .filter(lead_stage_history::lead_id.eq(lead_id))
        .load::<StageHistory>(conn)?
    {
        let summary = h.note.clone().unwrap_or_else(|| {
            format!(
                "Stage changed from {} to {}",
                stage_name(h.from_stage_id),
                stage_name(Some(h.to_stage_id))
            )
        });
        entries.push(TimelineEntry {
            at: h.changed_at,
            kind: EntryKind::StageChange,
            actor_id: Some(h.changed_by_id),
            actor_name: None,
            summary,
        });
    }

    let bd_rows = bd_assignment_history::table
        .filter(bd_assignment_history::lead_id.eq(lead_id))
        .load::<BdHistory>(conn)?;
    let manager_rows = lead_assignment_history::table
        .filter(lead_assignment_history::lead_id.eq(lead_id))
        .load::<AssignmentHistory>(conn)?;

    let mut ids: Vec<i32> = Vec::new();
    for h in &bd_rows {
        ids.extend(h.from_bd_id);
        ids.push(h.to_bd_id);
    }
    for h in &manager_rows {
        ids.extend(h.from_manager_id);
        ids.push(h.to_manager_id);
    }

    let activities = lead_activities::table
        .filter(lead_activities::lead_id.eq(lead_id))
        .load::<Activity>(conn)?;
    let edits = lead_edit_changes::table
        .filter(lead_edit_changes::lead_id.eq(lead_id))
        .load::<EditChange>(conn)?;

    ids.extend(entries.iter().filter_map(|e| e.actor_id));
    ids.extend(bd_rows.iter().map(|h| h.assigned_by_id));
    ids.extend(activities.iter().map(|a| a.actor_id));
    ids.extend(edits.iter().map(|e| e.editor_user_id));
    ids.sort_unstable();
    ids.dedup();

    let names: HashMap<i32, String> = users::table
        .filter(users::id.eq_any(&ids))
        .select((users::id, users::name))
        .load::<(i32, String)>(conn)?
        .into_iter()
        .collect();
    let name_of = |id: Option<i32>| {
        id.and_then(|id| names.get(&id).cloned())
            .unwrap_or_else(|| "System".to_string())
    };

    for h in bd_rows {
        let mut summary = match h.from_bd_id {
            Some(from) => format!("BD reassigned from {} to {}", name_of(Some(from)), name_of(Some(h.to_bd_id))),
            None => format!("Assigned to BD {}", name_of(Some(h.to_bd_id))),
        };
        if let Some(reason) = h.reason.filter(|r| !r.is_empty()) {
            summary.push_str(&format!(": {}", reason));
        }
        entries.push(TimelineEntry {
            at: h.reassigned_at,
            kind: EntryKind::BdAssignment,
            actor_id: Some(h.assigned_by_id),
            actor_name: None,
            summary,
        });
    }

    for h in manager_rows {
        entries.push(TimelineEntry {
            at: h.reassigned_at,
            kind: EntryKind::ManagerReassignment,
            actor_id: None,
            actor_name: Some(h.triggered_by.clone()),
            summary: format!(
                "Manager changed from {} to {}: {}",
                name_of(h.from_manager_id),
                name_of(Some(h.to_manager_id)),
                h.reason
            ),
        });
    }

    for a in activities {
        let label = ActivityType::parse(&a.activity_type)
            .map(|t| t.label().to_string())
            .unwrap_or_else(|| a.activity_type.clone());
        let mut summary = match &a.title {
            Some(title) => format!("{}: {}", label, title),
            None => label,
        };
        if a.completed_at.is_some() {
            summary.push_str(" (completed)");
        }
        entries.push(TimelineEntry {
            at: a.created_at,
            kind: EntryKind::Activity,
            actor_id: Some(a.actor_id),
            actor_name: None,
            summary,
        });
    }

    for e in edits {
        entries.push(TimelineEntry {
            at: e.created_at,
            kind: EntryKind::Edit,
            actor_id: Some(e.editor_user_id),
            actor_name: None,
            summary: format!(
                "{}: {} -> {}",
                e.field_name,
                e.old_value.as_deref().unwrap_or("(empty)"),
                e.new_value.as_deref().unwrap_or("(empty)")
            ),
        });
    }

    for entry in &mut entries {
        if entry.actor_name.is_none() {
            entry.actor_name = Some(name_of(entry.actor_id));
        }
    }

    // Stable sort keeps insertion order among rows written in one transaction
    entries.sort_by(|a, b| b.at.cmp(&a.at));
    Ok(entries)
}

//! Users, pipeline stages and the notification inbox
//!
//! Directory rows change rarely and carry no lifecycle events, but they go
//! through the same retried transactions as transitions.

use crate::db::{NewStage, NewUser, Notification, Stage, User};
use crate::error::{LeadError, Result};
use crate::lifecycle::{load_user, role_of, validate_email, LeadEngine};
use crate::notify;
use crate::schema::*;
use crate::types::Role;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer};
use diesel::sqlite::SqliteConnection;

/// Stages created by `leadflow init`, in pipeline order
pub const DEFAULT_STAGES: [(&str, &str); 6] = [
    ("New Qualified Lead", "#17a2b8"),
    ("Lead Contacted / Discovery Call", "#007bff"),
    ("Needs Identified / Proposal", "#ffc107"),
    ("Negotiation / Follow-Up", "#fd7e14"),
    ("Closed – Won", "#28a745"),
    ("Closed – Lost", "#dc3545"),
];

/// Every column that points at a user. Notifications are owned by the
/// user and handled separately.
const USER_REFERENCES: &[(&str, &str)] = &[
    ("leads", "submitted_by_user_id"),
    ("leads", "current_manager_id"),
    ("leads", "assigned_bd_id"),
    ("leads", "deleted_by_id"),
    ("lead_assignments", "manager_id"),
    ("lead_notes", "author_user_id"),
    ("lead_stage_history", "changed_by_id"),
    ("bd_assignment_history", "from_bd_id"),
    ("bd_assignment_history", "to_bd_id"),
    ("bd_assignment_history", "assigned_by_id"),
    ("lead_assignment_history", "from_manager_id"),
    ("lead_assignment_history", "to_manager_id"),
    ("lead_activities", "actor_id"),
    ("lead_social_profiles", "added_by_id"),
    ("lead_edit_changes", "editor_user_id"),
];

/// Rotation pointers, moved along with the user but never blocking a delete
const POINTER_COLUMNS: &[&str] = &["last_assigned_manager_id", "last_assigned_bd_id"];

#[derive(QueryableByName)]
struct Count {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

fn reference_count(conn: &mut SqliteConnection, user_id: i32) -> Result<i64> {
    let mut total = 0;
    for (table, column) in USER_REFERENCES {
        let row = diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {} WHERE {} = ?", table, column))
            .bind::<Integer, _>(user_id)
            .get_result::<Count>(conn)?;
        total += row.n;
    }
    Ok(total)
}

fn transfer_references(conn: &mut SqliteConnection, from: i32, to: i32) -> Result<usize> {
    let mut moved = 0;
    let columns = USER_REFERENCES
        .iter()
        .copied()
        .chain(POINTER_COLUMNS.iter().map(|c| ("assignment_settings", *c)))
        .chain(std::iter::once(("notifications", "user_id")));
    for (table, column) in columns {
        moved += diesel::sql_query(format!("UPDATE {} SET {} = ? WHERE {} = ?", table, column, column))
            .bind::<Integer, _>(to)
            .bind::<Integer, _>(from)
            .execute(conn)?;
    }
    Ok(moved)
}

/// `#` followed by six hex digits
fn validate_color(color: &str) -> Result<()> {
    let ok = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(LeadError::Validation(format!("'{}' is not a colour like #1a2b3c", color)))
    }
}

fn stage_name_taken(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    let n: i64 = pipeline_stages::table
        .filter(pipeline_stages::name.eq(name))
        .count()
        .get_result(conn)?;
    Ok(n > 0)
}

fn insert_stage(conn: &mut SqliteConnection, name: &str, color: &str, description: Option<&str>, now: &str) -> Result<i32> {
    let max: Option<i32> = pipeline_stages::table
        .select(diesel::dsl::max(pipeline_stages::position))
        .first(conn)?;
    diesel::insert_into(pipeline_stages::table)
        .values(&NewStage {
            name,
            position: max.unwrap_or(0) + 1,
            color,
            description,
            created_at: now,
        })
        .execute(conn)?;
    Ok(crate::db::last_insert_id(conn)?)
}

impl LeadEngine {
    // ========================================================================
    // Users
    // ========================================================================

    pub fn create_user(&self, name: &str, email: &str, role: Role, protected: bool) -> Result<i32> {
        let name = name.trim();
        let email = email.trim().to_lowercase();
        if name.is_empty() {
            return Err(LeadError::Validation("name is required".into()));
        }
        validate_email(&email)?;

        let id = self.transact("create_user", |tx| {
            let taken: i64 = users::table
                .filter(users::email.eq(&email))
                .count()
                .get_result(tx.conn)?;
            if taken > 0 {
                return Err(LeadError::Validation(format!("a user with email {} already exists", email)));
            }
            diesel::insert_into(users::table)
                .values(&NewUser {
                    name,
                    email: &email,
                    role: role.as_str(),
                    is_protected: protected,
                    created_at: &tx.stamp,
                })
                .execute(tx.conn)?;
            Ok(crate::db::last_insert_id(tx.conn)?)
        })?;
        tracing::info!(user_id = id, role = %role, "user created");
        Ok(id)
    }

    pub fn list_users(&self, role: Option<Role>) -> Result<Vec<User>> {
        self.read("list_users", |conn| {
            let mut query = users::table.order(users::id.asc()).into_boxed();
            if let Some(role) = role {
                query = query.filter(users::role.eq(role.as_str()));
            }
            Ok(query.load::<User>(conn)?)
        })
    }

    pub fn get_user(&self, user_id: i32) -> Result<User> {
        self.read("get_user", |conn| load_user(conn, user_id))
    }

    /// Remove a user. With a replacement every reference moves to it;
    /// without one the user must not be referenced anywhere.
    pub fn delete_user(&self, actor_id: i32, user_id: i32, replacement_id: Option<i32>) -> Result<()> {
        if replacement_id == Some(user_id) {
            return Err(LeadError::Validation("a user cannot replace themselves".into()));
        }
        let moved = self.transact("delete_user", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let target = load_user(tx.conn, user_id)?;
            let replacement = match replacement_id {
                Some(id) => Some(load_user(tx.conn, id)?),
                None => None,
            };
            if role_of(&actor)? != Role::Admin {
                return Err(LeadError::Forbidden("only admins can delete users".into()));
            }
            if actor.id == target.id {
                return Err(LeadError::Forbidden("you cannot delete your own account".into()));
            }
            if target.is_protected {
                return Err(LeadError::Forbidden(format!("{} is a protected user", target.name)));
            }

            let role = role_of(&target)?;
            let same_role: i64 = users::table
                .filter(users::role.eq(role.as_str()))
                .count()
                .get_result(tx.conn)?;
            if same_role <= 1 {
                return Err(LeadError::InvalidState(format!(
                    "{} is the last {} user",
                    target.name,
                    role.label()
                )));
            }

            let moved = match &replacement {
                Some(r) => {
                    if role_of(r)? != role {
                        return Err(LeadError::Validation(format!(
                            "replacement {} must also be a {} user",
                            r.name,
                            role.label()
                        )));
                    }
                    transfer_references(tx.conn, target.id, r.id)?
                }
                None => {
                    let refs = reference_count(tx.conn, target.id)?;
                    if refs > 0 {
                        return Err(LeadError::InvalidState(format!(
                            "{} is still referenced by {} records; choose a replacement user",
                            target.name, refs
                        )));
                    }
                    diesel::delete(notifications::table.filter(notifications::user_id.eq(target.id)))
                        .execute(tx.conn)?
                }
            };

            diesel::delete(users::table.find(target.id)).execute(tx.conn)?;
            Ok(moved)
        })?;
        tracing::info!(user_id, actor_id, replacement_id = ?replacement_id, moved, "user deleted");
        Ok(())
    }

    // ========================================================================
    // Pipeline stages
    // ========================================================================

    pub fn create_stage(&self, name: &str, color: &str, description: Option<&str>) -> Result<i32> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LeadError::Validation("stage name is required".into()));
        }
        validate_color(color)?;
        let description = description.map(str::trim).filter(|d| !d.is_empty());

        let id = self.transact("create_stage", |tx| {
            if stage_name_taken(tx.conn, name)? {
                return Err(LeadError::Validation(format!("a stage named '{}' already exists", name)));
            }
            insert_stage(tx.conn, name, color, description, &tx.stamp)
        })?;
        tracing::info!(stage_id = id, name, "stage created");
        Ok(id)
    }

    /// Stages in pipeline order
    pub fn list_stages(&self) -> Result<Vec<Stage>> {
        self.read("list_stages", |conn| {
            Ok(pipeline_stages::table
                .order((pipeline_stages::position.asc(), pipeline_stages::id.asc()))
                .load::<Stage>(conn)?)
        })
    }

    /// `ids` must list every stage exactly once; positions follow its order
    pub fn reorder_stages(&self, ids: &[i32]) -> Result<()> {
        self.transact("reorder_stages", |tx| {
            let mut existing = pipeline_stages::table
                .select(pipeline_stages::id)
                .load::<i32>(tx.conn)?;
            let mut requested = ids.to_vec();
            existing.sort_unstable();
            requested.sort_unstable();
            if existing != requested {
                return Err(LeadError::Validation(
                    "the new order must list every stage exactly once".into(),
                ));
            }
            for (i, id) in ids.iter().enumerate() {
                diesel::update(pipeline_stages::table.find(*id))
                    .set(pipeline_stages::position.eq(i as i32 + 1))
                    .execute(tx.conn)?;
            }
            Ok(())
        })
    }

    pub fn delete_stage(&self, stage_id: i32) -> Result<()> {
        self.transact("delete_stage", |tx| {
            let stage = pipeline_stages::table
                .find(stage_id)
                .first::<Stage>(tx.conn)
                .optional()?
                .ok_or_else(|| LeadError::not_found(format!("stage {}", stage_id)))?;

            let leads_using: i64 = leads::table
                .filter(leads::current_stage_id.eq(stage.id))
                .count()
                .get_result(tx.conn)?;
            let history_using: i64 = lead_stage_history::table
                .filter(
                    lead_stage_history::from_stage_id
                        .eq(stage.id)
                        .or(lead_stage_history::to_stage_id.eq(stage.id)),
                )
                .count()
                .get_result(tx.conn)?;
            if leads_using + history_using > 0 {
                return Err(LeadError::InvalidState(format!(
                    "stage '{}' is used by {} leads and {} history rows",
                    stage.name, leads_using, history_using
                )));
            }

            diesel::delete(pipeline_stages::table.find(stage.id)).execute(tx.conn)?;
            Ok(())
        })?;
        tracing::info!(stage_id, "stage deleted");
        Ok(())
    }

    /// Create the default pipeline when no stage exists yet. Returns how
    /// many stages were created.
    pub fn seed_default_stages(&self) -> Result<usize> {
        self.transact("seed_default_stages", |tx| {
            let existing: i64 = pipeline_stages::table.count().get_result(tx.conn)?;
            if existing > 0 {
                return Ok(0);
            }
            for (name, color) in DEFAULT_STAGES {
                insert_stage(tx.conn, name, color, None, &tx.stamp)?;
            }
            Ok(DEFAULT_STAGES.len())
        })
    }

    // ========================================================================
    // Notification inbox
    // ========================================================================

    pub fn unread_notifications(&self, user_id: i32) -> Result<Vec<Notification>> {
        self.read("unread_notifications", |conn| {
            load_user(conn, user_id)?;
            notify::unread(conn, user_id)
        })
    }

    pub fn notifications(&self, user_id: i32, limit: i64) -> Result<Vec<Notification>> {
        self.read("notifications", |conn| {
            load_user(conn, user_id)?;
            notify::recent(conn, user_id, limit)
        })
    }

    pub fn mark_all_read(&self, user_id: i32) -> Result<usize> {
        self.transact("mark_all_read", |tx| notify::mark_all_read(tx.conn, user_id))
    }

    pub fn mark_read(&self, user_id: i32, notification_id: i32) -> Result<()> {
        let found = self.transact("mark_read", |tx| notify::mark_read(tx.conn, user_id, notification_id))?;
        if found {
            Ok(())
        } else {
            Err(LeadError::not_found(format!("notification {}", notification_id)))
        }
    }
}

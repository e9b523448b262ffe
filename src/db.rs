//! SQLite database with Diesel ORM
//!
//! Stores users, leads, assignments, the round-robin cursor and the audit
//! trail. The schema is created idempotently on open.

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::schema::*;
use crate::types::Cents;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::{Path, PathBuf};

/// Walk up directory tree to find .leadflow folder (like git finds .git)
/// Can be overridden with LEADFLOW_DB_PATH env var
fn get_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("LEADFLOW_DB_PATH") {
        return PathBuf::from(path);
    }

    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let leadflow_dir = dir.join(".leadflow");
            if leadflow_dir.is_dir() {
                return leadflow_dir.join("leadflow.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    // No .leadflow found - `leadflow init` will create it here
    PathBuf::from(".leadflow/leadflow.db")
}

/// Current schema version for leadflow
pub const CURRENT_SCHEMA: SchemaInfo = SchemaInfo {
    major: 1,
    minor: 3,
    patch: 0,
    name: "lead-lifecycle",
    features: &[
        "leads",
        "lead_assignments",
        "assignment_settings",
        "pipeline_stages",
        "audit_trail",
        "lead_activities",
        "social_profiles",
        "notifications",
        "deal_amount_cents",
        "soft_delete",
    ],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone, Copy)]
pub struct SchemaInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl SchemaInfo {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::fmt::Display for SchemaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version_string())
    }
}

// ============================================================================
// Diesel Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
pub struct NewSchemaVersion<'a> {
    pub version: &'a str,
    pub name: &'a str,
    pub features: &'a str,
    pub introduced_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = schema_versions)]
pub struct StoredSchema {
    pub id: i32,
    pub version: String,
    pub name: String,
    pub features: String,
    pub introduced_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub role: &'a str,
    pub is_protected: bool,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub role: String,
    pub is_protected: bool,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = pipeline_stages)]
pub struct NewStage<'a> {
    pub name: &'a str,
    pub position: i32,
    pub color: &'a str,
    pub description: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = pipeline_stages)]
pub struct Stage {
    pub id: i32,
    pub name: String,
    pub position: i32,
    pub color: String,
    pub description: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Lead Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = leads)]
pub struct NewLead<'a> {
    pub submitted_by_user_id: i32,
    pub full_name: &'a str,
    pub email: &'a str,
    pub phone: &'a str,
    pub company: &'a str,
    pub domain: &'a str,
    pub industry: Option<&'a str>,
    pub services_csv: &'a str,
    pub country: &'a str,
    pub state: &'a str,
    pub city: &'a str,
    pub status: &'a str,
    pub current_manager_id: Option<i32>,
    pub created_at: &'a str,
    pub assigned_at: Option<&'a str>,
    pub updated_at: &'a str,
    pub is_deleted: bool,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = leads)]
pub struct Lead {
    pub id: i32,
    pub submitted_by_user_id: i32,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub domain: String,
    pub industry: Option<String>,
    pub services_csv: String,
    pub country: String,
    pub state: String,
    pub city: String,
    pub attachment_path: Option<String>,
    pub status: String,
    pub current_manager_id: Option<i32>,
    pub assigned_bd_id: Option<i32>,
    pub current_stage_id: Option<i32>,
    pub deal_amount_cents: Option<i64>,
    pub created_at: String,
    pub assigned_at: Option<String>,
    pub accepted_at: Option<String>,
    pub assigned_to_bd_at: Option<String>,
    pub updated_at: String,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub deleted_by_id: Option<i32>,
}

impl Lead {
    /// Services offered to this lead, split from the stored CSV
    pub fn services(&self) -> Vec<&str> {
        self.services_csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn deal_amount(&self) -> Option<Cents> {
        self.deal_amount_cents.map(Cents)
    }
}

#[derive(Insertable)]
#[diesel(table_name = lead_assignments)]
pub struct NewAssignment<'a> {
    pub lead_id: i32,
    pub manager_id: i32,
    pub assigned_at: &'a str,
    pub deadline_at: &'a str,
    pub status: &'a str,
    pub is_initial_assignment: bool,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = lead_assignments)]
pub struct Assignment {
    pub id: i32,
    pub lead_id: i32,
    pub manager_id: i32,
    pub assigned_at: String,
    pub deadline_at: String,
    pub acted_at: Option<String>,
    pub status: String,
    pub is_initial_assignment: bool,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = assignment_settings)]
pub struct AssignmentSettings {
    pub id: i32,
    pub last_assigned_manager_id: Option<i32>,
    pub last_assigned_bd_id: Option<i32>,
    pub updated_at: String,
}

// ============================================================================
// Audit Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = lead_notes)]
pub struct NewNote<'a> {
    pub lead_id: i32,
    pub author_user_id: Option<i32>,
    pub note_type: &'a str,
    pub message: &'a str,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = lead_notes)]
pub struct Note {
    pub id: i32,
    pub lead_id: i32,
    pub author_user_id: Option<i32>,
    pub note_type: String,
    pub message: String,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = lead_stage_history)]
pub struct NewStageHistory<'a> {
    pub lead_id: i32,
    pub from_stage_id: Option<i32>,
    pub to_stage_id: i32,
    pub changed_by_id: i32,
    pub note: Option<&'a str>,
    pub changed_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = lead_stage_history)]
pub struct StageHistory {
    pub id: i32,
    pub lead_id: i32,
    pub from_stage_id: Option<i32>,
    pub to_stage_id: i32,
    pub changed_by_id: i32,
    pub note: Option<String>,
    pub changed_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = bd_assignment_history)]
pub struct NewBdHistory<'a> {
    pub lead_id: i32,
    pub from_bd_id: Option<i32>,
    pub to_bd_id: i32,
    pub assigned_by_id: i32,
    pub reason: Option<&'a str>,
    pub reassigned_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = bd_assignment_history)]
pub struct BdHistory {
    pub id: i32,
    pub lead_id: i32,
    pub from_bd_id: Option<i32>,
    pub to_bd_id: i32,
    pub assigned_by_id: i32,
    pub reason: Option<String>,
    pub reassigned_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = lead_assignment_history)]
pub struct NewAssignmentHistory<'a> {
    pub lead_id: i32,
    pub assignment_id: Option<i32>,
    pub from_manager_id: Option<i32>,
    pub to_manager_id: i32,
    pub reason: &'a str,
    pub triggered_by: &'a str,
    pub reassigned_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = lead_assignment_history)]
pub struct AssignmentHistory {
    pub id: i32,
    pub lead_id: i32,
    pub assignment_id: Option<i32>,
    pub from_manager_id: Option<i32>,
    pub to_manager_id: i32,
    pub reason: String,
    pub triggered_by: String,
    pub reassigned_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = lead_activities)]
pub struct NewActivity<'a> {
    pub lead_id: i32,
    pub actor_id: i32,
    pub activity_type: &'a str,
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub due_at: Option<&'a str>,
    pub reminder_at: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = lead_activities)]
pub struct Activity {
    pub id: i32,
    pub lead_id: i32,
    pub actor_id: i32,
    pub activity_type: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_at: Option<String>,
    pub reminder_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = lead_social_profiles)]
pub struct NewSocialProfile<'a> {
    pub lead_id: i32,
    pub platform: &'a str,
    pub url: &'a str,
    pub added_by_id: i32,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = lead_social_profiles)]
pub struct SocialProfile {
    pub id: i32,
    pub lead_id: i32,
    pub platform: String,
    pub url: String,
    pub added_by_id: i32,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = lead_edit_changes)]
pub struct NewEditChange<'a> {
    pub lead_id: i32,
    pub editor_user_id: i32,
    pub field_name: &'a str,
    pub old_value: Option<&'a str>,
    pub new_value: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = lead_edit_changes)]
pub struct EditChange {
    pub id: i32,
    pub lead_id: i32,
    pub editor_user_id: i32,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification<'a> {
    pub user_id: i32,
    pub lead_id: Option<i32>,
    pub message: &'a str,
    pub notification_type: &'a str,
    pub is_read: bool,
    pub sound_enabled: bool,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize, serde::Deserialize)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: i32,
    pub user_id: i32,
    pub lead_id: Option<i32>,
    pub message: String,
    pub notification_type: String,
    pub is_read: bool,
    pub sound_enabled: bool,
    pub created_at: String,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Pragmas applied to every pooled connection
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Get the database path that will be used
    pub fn db_path() -> PathBuf {
        get_db_path()
    }

    /// Open database at default path (respects LEADFLOW_DB_PATH env var)
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = get_db_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        Self::open_at(&path, config)
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P, config: &DatabaseConfig) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)?;

        let db = Self { pool };
        db.init_schema()?;
        tracing::debug!(path = %path_str, schema = %CURRENT_SCHEMA, "database opened");
        Ok(db)
    }

    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                version TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                features TEXT NOT NULL,
                introduced_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL CHECK (role IN ('admin', 'manager', 'marketer', 'bd_sales')),
                is_protected BOOLEAN NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS pipeline_stages (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                name TEXT NOT NULL UNIQUE,
                position INTEGER NOT NULL,
                color TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                submitted_by_user_id INTEGER NOT NULL REFERENCES users(id),
                full_name TEXT NOT NULL,
                email TEXT NOT NULL,
                phone TEXT NOT NULL,
                company TEXT NOT NULL,
                domain TEXT NOT NULL,
                industry TEXT,
                services_csv TEXT NOT NULL,
                country TEXT NOT NULL,
                state TEXT NOT NULL,
                city TEXT NOT NULL,
                attachment_path TEXT,
                status TEXT NOT NULL DEFAULT 'Pending'
                    CHECK (status IN ('Pending', 'Accepted', 'Rejected', 'Resubmitted')),
                current_manager_id INTEGER REFERENCES users(id),
                assigned_bd_id INTEGER REFERENCES users(id),
                current_stage_id INTEGER REFERENCES pipeline_stages(id),
                deal_amount_cents INTEGER CHECK (deal_amount_cents IS NULL OR deal_amount_cents >= 0),
                created_at TEXT NOT NULL,
                assigned_at TEXT,
                accepted_at TEXT,
                assigned_to_bd_at TEXT,
                updated_at TEXT NOT NULL,
                is_deleted BOOLEAN NOT NULL DEFAULT 0,
                deleted_at TEXT,
                deleted_by_id INTEGER REFERENCES users(id),
                CHECK ((assigned_bd_id IS NULL) = (current_stage_id IS NULL))
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS lead_assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                manager_id INTEGER NOT NULL REFERENCES users(id),
                assigned_at TEXT NOT NULL,
                deadline_at TEXT NOT NULL,
                acted_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'acted', 'reassigned', 'expired', 'reverted')),
                is_initial_assignment BOOLEAN NOT NULL DEFAULT 0
            )
        "#).execute(&mut conn)?;

        // Pointers are plain ids, not foreign keys; a dangling pointer makes
        // the allocator restart at the first candidate.
        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS assignment_settings (
                id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
                last_assigned_manager_id INTEGER,
                last_assigned_bd_id INTEGER,
                updated_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS lead_notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                author_user_id INTEGER REFERENCES users(id),
                note_type TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS lead_stage_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                from_stage_id INTEGER REFERENCES pipeline_stages(id),
                to_stage_id INTEGER NOT NULL REFERENCES pipeline_stages(id),
                changed_by_id INTEGER NOT NULL REFERENCES users(id),
                note TEXT,
                changed_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS bd_assignment_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                from_bd_id INTEGER REFERENCES users(id),
                to_bd_id INTEGER NOT NULL REFERENCES users(id),
                assigned_by_id INTEGER NOT NULL REFERENCES users(id),
                reason TEXT,
                reassigned_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS lead_assignment_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                assignment_id INTEGER REFERENCES lead_assignments(id),
                from_manager_id INTEGER REFERENCES users(id),
                to_manager_id INTEGER NOT NULL REFERENCES users(id),
                reason TEXT NOT NULL,
                triggered_by TEXT NOT NULL CHECK (triggered_by IN ('admin', 'system')),
                reassigned_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS lead_activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                actor_id INTEGER NOT NULL REFERENCES users(id),
                activity_type TEXT NOT NULL,
                title TEXT,
                description TEXT,
                due_at TEXT,
                reminder_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS lead_social_profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                platform TEXT NOT NULL
                    CHECK (platform IN ('linkedin', 'twitter', 'facebook', 'website')),
                url TEXT NOT NULL,
                added_by_id INTEGER NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS lead_edit_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                editor_user_id INTEGER NOT NULL REFERENCES users(id),
                field_name TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id),
                lead_id INTEGER REFERENCES leads(id),
                message TEXT NOT NULL,
                notification_type TEXT NOT NULL DEFAULT 'info',
                is_read BOOLEAN NOT NULL DEFAULT 0,
                sound_enabled BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        // At most one open assignment per lead
        diesel::sql_query("CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_one_pending ON lead_assignments(lead_id) WHERE status = 'pending'").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_assignments_deadline ON lead_assignments(status, deadline_at)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status, is_deleted)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_activities_reminder ON lead_activities(reminder_at) WHERE completed_at IS NULL").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, is_read)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_notes_lead ON lead_notes(lead_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_social_profiles_lead ON lead_social_profiles(lead_id)").execute(&mut conn)?;

        let now = crate::clock::stamp(chrono::Utc::now());
        diesel::sql_query(
            "INSERT OR IGNORE INTO assignment_settings (id, last_assigned_manager_id, last_assigned_bd_id, updated_at) VALUES (1, NULL, NULL, ?)",
        )
        .bind::<diesel::sql_types::Text, _>(&now)
        .execute(&mut conn)?;

        self.register_schema(&mut conn, &CURRENT_SCHEMA, &now)?;
        Ok(())
    }

    fn register_schema(&self, conn: &mut SqliteConnection, schema: &SchemaInfo, now: &str) -> Result<()> {
        let features_json = serde_json::to_string(&schema.features).unwrap_or_default();

        let new_schema = NewSchemaVersion {
            version: &schema.version_string(),
            name: schema.name,
            features: &features_json,
            introduced_at: now,
        };

        diesel::insert_or_ignore_into(schema_versions::table)
            .values(&new_schema)
            .execute(conn)?;

        Ok(())
    }

    /// Schema versions recorded in this database, oldest first
    pub fn schema_history(&self) -> Result<Vec<StoredSchema>> {
        let mut conn = self.conn()?;
        let rows = schema_versions::table
            .order(schema_versions::id.asc())
            .load::<StoredSchema>(&mut conn)?;
        Ok(rows)
    }

    /// Row counts for status output
    pub fn summary(&self) -> Result<DbSummary> {
        let mut conn = self.conn()?;
        let total_users: i64 = users::table.count().get_result(&mut conn)?;
        let total_leads: i64 = leads::table
            .filter(leads::is_deleted.eq(false))
            .count()
            .get_result(&mut conn)?;
        let pending_assignments: i64 = lead_assignments::table
            .filter(lead_assignments::status.eq("pending"))
            .count()
            .get_result(&mut conn)?;
        let total_stages: i64 = pipeline_stages::table.count().get_result(&mut conn)?;
        Ok(DbSummary {
            total_users,
            total_leads,
            pending_assignments,
            total_stages,
        })
    }
}

/// Id generated by the last INSERT on this connection
pub fn last_insert_id(conn: &mut SqliteConnection) -> QueryResult<i32> {
    diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
        .first(conn)
}

/// Summary statistics from the database
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbSummary {
    pub total_users: i64,
    pub total_leads: i64,
    pub pending_assignments: i64,
    pub total_stages: i64,
}

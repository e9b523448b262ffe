//! leadflow - lead lifecycle and round-robin assignment engine
//!
//! Marketers submit leads, managers review them under a deadline, accepted
//! leads move into a BD sales pipeline. Every transition runs as a single
//! SQLite transaction with its audit rows and notifications.
//!
//! # Lead statuses
//!
//! | Status | Reached by |
//! |--------|------------|
//! | `Pending` | submission |
//! | `Accepted` | a manager or admin accepts |
//! | `Rejected` | rejection, or reverting an accepted lead |
//! | `Resubmitted` | the submitter answers a rejection |
//!
//! # Quick Start
//!
//! ```no_run
//! use leadflow::{Config, Database, LeadEngine, LeadFields, Role};
//!
//! let config = Config::default();
//! let db = Database::open_at("leadflow.db", &config.database).unwrap();
//! let engine = LeadEngine::new(db, &config);
//!
//! let marketer = engine.create_user("Mia", "mia@example.com", Role::Marketer, false).unwrap();
//! engine.create_user("Max", "max@example.com", Role::Manager, false).unwrap();
//!
//! let lead = engine
//!     .submit_lead(marketer, &LeadFields {
//!         full_name: "Ada Lovelace".into(),
//!         email: "ada@engines.io".into(),
//!         company: "Analytical Engines".into(),
//!         ..Default::default()
//!     })
//!     .unwrap();
//! println!("lead {} is with manager {:?}", lead, engine.get_lead(lead).unwrap().current_manager_id);
//! ```

pub mod activities;
pub mod allocator;
pub mod audit;
pub mod blob;
pub mod clock;
pub mod config;
pub mod db;
pub mod directory;
pub mod edits;
pub mod error;
pub mod init;
pub mod lifecycle;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod serve;
pub mod state;
pub mod sweep;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use db::{
    Activity, Assignment, Database, DbSummary, Lead, Notification, SocialProfile, Stage, User, CURRENT_SCHEMA,
};
pub use error::{LeadError, Result};
pub use lifecycle::{LeadEngine, LeadFields};
pub use state::{LeadEvent, LeadStatus};
pub use sweep::SweepReport;
pub use types::{ActivityType, AssignmentStatus, Cents, NoteType, NotificationKind, Role};


//! End-to-end tests for the lead engine
//!
//! Each test gets its own temporary database and a fixed clock that only
//! moves when the test advances it.

use chrono::{DateTime, Duration, TimeZone, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use leadflow::activities::ActivityInput;
use leadflow::clock::stamp;
use leadflow::edits::LeadEdit;
use leadflow::notify::{PushChannel, PushError};
use leadflow::schema::{lead_assignments, lead_notes, lead_social_profiles, notifications};
use leadflow::{
    ActivityType, Cents, Config, Database, FixedClock, LeadEngine, LeadError, LeadFields, LeadStatus, Role,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingPush {
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingPush {
    fn topics(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl PushChannel for RecordingPush {
    fn publish(&self, topic: &str, payload: &Value) -> Result<usize, PushError> {
        self.sent.lock().unwrap().push((topic.to_string(), payload.clone()));
        Ok(1)
    }
}

struct Harness {
    _dir: TempDir,
    db_path: PathBuf,
    engine: LeadEngine,
    clock: Arc<FixedClock>,
    pushes: Arc<RecordingPush>,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.upload_dir = dir.path().join("uploads");
    config.retry.initial_delay_ms = 1;
    let db_path = dir.path().join("leadflow.db");
    let db = Database::open_at(&db_path, &config.database).unwrap();
    let clock = Arc::new(FixedClock::new(start_time()));
    let pushes = Arc::new(RecordingPush::default());
    let engine = LeadEngine::new(db, &config)
        .with_clock(clock.clone())
        .with_push(pushes.clone());
    Harness {
        _dir: dir,
        db_path,
        engine,
        clock,
        pushes,
    }
}

fn fields(company: &str) -> LeadFields {
    LeadFields {
        full_name: "Grace Hopper".into(),
        email: "grace@example.com".into(),
        phone: "+1 555 0100".into(),
        company: company.into(),
        domain: "example.com".into(),
        industry: Some("Software".into()),
        services: vec!["SEO".into(), "PPC".into()],
        country: "US".into(),
        state: "NY".into(),
        city: "New York".into(),
        ..Default::default()
    }
}

const COMMENT: &str = "Missing budget information";

impl Harness {
    fn user(&self, name: &str, role: Role) -> i32 {
        let email = format!("{}@example.com", name.to_lowercase());
        self.engine.create_user(name, &email, role, false).unwrap()
    }

    fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.now()
    }

    fn notification_count(&self) -> i64 {
        let mut conn = self.engine.db().conn().unwrap();
        notifications::table.count().get_result(&mut conn).unwrap()
    }

    fn notifications_for(&self, user: i32) -> Vec<String> {
        self.engine
            .notifications(user, 100)
            .unwrap()
            .into_iter()
            .map(|n| n.message)
            .collect()
    }

    fn pending_count(&self, lead: i32) -> i64 {
        let mut conn = self.engine.db().conn().unwrap();
        lead_assignments::table
            .filter(lead_assignments::lead_id.eq(lead))
            .filter(lead_assignments::status.eq("pending"))
            .count()
            .get_result(&mut conn)
            .unwrap()
    }

    fn note_count(&self, lead: i32) -> i64 {
        let mut conn = self.engine.db().conn().unwrap();
        lead_notes::table
            .filter(lead_notes::lead_id.eq(lead))
            .count()
            .get_result(&mut conn)
            .unwrap()
    }

    fn status(&self, lead: i32) -> String {
        self.engine.get_lead(lead).unwrap().status
    }

    /// Everything a transition could touch for one lead
    fn snapshot(&self, lead: i32) -> (String, i64, Vec<(String, String)>, i64, usize) {
        let assignments = self
            .engine
            .assignments(lead)
            .unwrap()
            .into_iter()
            .map(|a| (a.status, a.deadline_at))
            .collect();
        (
            self.status(lead),
            self.note_count(lead),
            assignments,
            self.notification_count(),
            self.engine.timeline(lead).unwrap().len(),
        )
    }
}

// =============================================================================
// Submission and round-robin
// =============================================================================

#[test]
fn test_submit_without_managers_leaves_lead_unassigned() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);

    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    let row = h.engine.get_lead(lead).unwrap();

    assert_eq!(row.status, "Pending");
    assert_eq!(row.current_manager_id, None);
    assert!(h.engine.assignments(lead).unwrap().is_empty());
    assert_eq!(h.notification_count(), 0);
}

#[test]
fn test_marketer_leads_rotate_through_managers() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);

    let owners: Vec<Option<i32>> = ["One", "Two", "Three"]
        .iter()
        .map(|c| {
            let lead = h.engine.submit_lead(marketer, &fields(c)).unwrap();
            h.engine.get_lead(lead).unwrap().current_manager_id
        })
        .collect();
    assert_eq!(owners, vec![Some(a), Some(b), Some(a)]);
    assert_eq!(h.engine.peek_next_manager().unwrap(), Some(b));
}

#[test]
fn test_initial_assignment_has_fifteen_hour_deadline() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);

    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    let assignments = h.engine.assignments(lead).unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].manager_id, a);
    assert!(assignments[0].is_initial_assignment);
    assert_eq!(assignments[0].deadline_at, stamp(start_time() + Duration::hours(15)));

    let inbox = h.notifications_for(a);
    assert_eq!(inbox, vec!["New lead from Mia has been assigned to you: Acme".to_string()]);
}

#[test]
fn test_manager_lead_goes_to_another_manager_without_moving_pointer() {
    let h = harness();
    let a = h.user("Alice", Role::Manager);
    h.user("Bob", Role::Manager);
    h.user("Cara", Role::Manager);
    let before = h.engine.peek_next_manager().unwrap();

    for i in 0..5 {
        let lead = h.engine.submit_lead(a, &fields(&format!("Co {}", i))).unwrap();
        let owner = h.engine.get_lead(lead).unwrap().current_manager_id;
        assert!(owner.is_some());
        assert_ne!(owner, Some(a));
    }
    assert_eq!(h.engine.peek_next_manager().unwrap(), before);
}

#[test]
fn test_only_marketers_and_managers_submit() {
    let h = harness();
    let bd = h.user("Dan", Role::BdSales);
    let err = h.engine.submit_lead(bd, &fields("Acme")).unwrap_err();
    assert!(matches!(err, LeadError::Forbidden(_)));
}

#[test]
fn test_submit_validates_before_anything_else() {
    let h = harness();
    let mut bad = fields("Acme");
    bad.email = "nope".into();
    let err = h.engine.submit_lead(999, &bad).unwrap_err();
    assert!(matches!(err, LeadError::Validation(_)));

    let err = h.engine.submit_lead(999, &fields("Acme")).unwrap_err();
    assert!(matches!(err, LeadError::NotFound(_)));
}

#[test]
fn test_submit_records_social_profiles() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    h.user("Alice", Role::Manager);
    let mut linked = fields("Acme");
    linked.linkedin = Some("https://linkedin.com/company/acme".into());
    linked.twitter = Some("".into());
    linked.website = Some("https://acme.example".into());
    let lead = h.engine.submit_lead(marketer, &linked).unwrap();

    let profiles = h.engine.social_profiles(lead).unwrap();
    let links: Vec<(&str, &str)> = profiles
        .iter()
        .map(|p| (p.platform.as_str(), p.url.as_str()))
        .collect();
    assert_eq!(
        links,
        vec![
            ("linkedin", "https://linkedin.com/company/acme"),
            ("website", "https://acme.example"),
        ]
    );
    let created = h.engine.get_lead(lead).unwrap().created_at;
    assert!(profiles.iter().all(|p| p.added_by_id == marketer && p.created_at == created));

    // One bad link sinks the whole submission
    let mut bad = fields("Globex");
    bad.facebook = Some("facebook.com/globex".into());
    let notifications = h.notification_count();
    assert!(matches!(h.engine.submit_lead(marketer, &bad), Err(LeadError::Validation(_))));
    assert_eq!(h.engine.list_leads(None, 100).unwrap().len(), 1);
    assert_eq!(h.notification_count(), notifications);
}

// =============================================================================
// Review transitions
// =============================================================================

#[test]
fn test_held_write_lock_surfaces_unavailable_without_writes() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    let before = h.snapshot(lead);
    let pushes = h.pushes.len();

    let mut other = SqliteConnection::establish(h.db_path.to_str().unwrap()).unwrap();
    other.batch_execute("BEGIN IMMEDIATE").unwrap();
    let err = h.engine.accept_lead(lead, a).unwrap_err();
    assert!(matches!(err, LeadError::Unavailable { attempts: 5 }), "{:?}", err);
    other.batch_execute("COMMIT").unwrap();

    assert_eq!(h.snapshot(lead), before);
    assert_eq!(h.pushes.len(), pushes);

    h.engine.accept_lead(lead, a).unwrap();
    assert_eq!(h.status(lead), "Accepted");
}

#[test]
fn test_accept_by_assigned_manager() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    let err = h.engine.accept_lead(lead, b).unwrap_err();
    assert!(matches!(err, LeadError::Forbidden(_)));

    h.advance(Duration::minutes(10));
    h.engine.accept_lead(lead, a).unwrap();
    let row = h.engine.get_lead(lead).unwrap();
    assert_eq!(row.status, "Accepted");
    assert_eq!(row.accepted_at, Some(stamp(h.now())));
    assert_eq!(h.engine.assignments(lead).unwrap()[0].status, "acted");
    assert_eq!(h.pending_count(lead), 0);
    assert!(h
        .notifications_for(marketer)
        .contains(&"Your lead for Acme has been accepted!".to_string()));
}

#[test]
fn test_admin_can_accept_any_lead() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    h.user("Alice", Role::Manager);
    let admin = h.user("Root", Role::Admin);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    h.engine.accept_lead(lead, admin).unwrap();
    assert_eq!(h.status(lead), "Accepted");
}

#[test]
fn test_marketer_cannot_review() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    assert!(matches!(h.engine.accept_lead(lead, marketer), Err(LeadError::Forbidden(_))));
    assert!(matches!(
        h.engine.reject_lead(lead, marketer, COMMENT),
        Err(LeadError::Forbidden(_))
    ));
}

#[test]
fn test_reject_keeps_assignment_open_and_notifies_submitter() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    let err = h.engine.reject_lead(lead, a, "short").unwrap_err();
    assert!(matches!(err, LeadError::Validation(_)));

    h.engine.reject_lead(lead, a, COMMENT).unwrap();
    assert_eq!(h.status(lead), "Rejected");
    assert_eq!(h.pending_count(lead), 1);
    assert!(h
        .notifications_for(marketer)
        .contains(&"Your lead for Acme has been rejected. Please review the comments.".to_string()));
    let timeline = h.engine.timeline(lead).unwrap();
    assert!(timeline.iter().any(|e| e.summary.contains(COMMENT)));
}

#[test]
fn test_second_resubmit_is_invalid() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let admin = h.user("Root", Role::Admin);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    h.engine.reject_lead(lead, a, COMMENT).unwrap();

    h.engine.resubmit_lead(lead, marketer, "Budget is 10k per month").unwrap();
    assert_eq!(h.status(lead), "Resubmitted");
    let msg = "Lead for Acme has been resubmitted by Mia for re-review.".to_string();
    assert!(h.notifications_for(a).contains(&msg));
    assert!(h.notifications_for(admin).contains(&msg));

    let err = h
        .engine
        .resubmit_lead(lead, marketer, "Budget is 10k per month")
        .unwrap_err();
    assert!(matches!(err, LeadError::InvalidState(_)));
}

#[test]
fn test_only_submitter_resubmits() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let other = h.user("Ned", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    h.engine.reject_lead(lead, a, COMMENT).unwrap();

    let err = h.engine.resubmit_lead(lead, other, COMMENT).unwrap_err();
    assert!(matches!(err, LeadError::Forbidden(_)));
    assert_eq!(h.status(lead), "Rejected");
}

#[test]
fn test_revert_reopens_review_for_actor() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    h.engine.accept_lead(lead, a).unwrap();

    h.advance(Duration::hours(2));
    h.engine.revert_lead(lead, b, "Client went with a competitor").unwrap();

    let row = h.engine.get_lead(lead).unwrap();
    assert_eq!(row.status, "Rejected");
    assert_eq!(row.accepted_at, None);
    assert_eq!(row.current_manager_id, Some(b));

    let assignments = h.engine.assignments(lead).unwrap();
    assert_eq!(assignments.len(), 2);
    assert_eq!(assignments[0].status, "reverted");
    assert_eq!(assignments[1].status, "pending");
    assert_eq!(assignments[1].manager_id, b);
    assert!(!assignments[1].is_initial_assignment);
    assert_eq!(assignments[1].deadline_at, stamp(h.now() + Duration::hours(4)));

    assert!(h
        .notifications_for(marketer)
        .iter()
        .any(|m| m.contains("has been re-rejected by Bob")));
}

#[test]
fn test_illegal_events_write_nothing() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let admin = h.user("Root", Role::Admin);
    let bd = h.user("Dan", Role::BdSales);
    h.engine.seed_default_stages().unwrap();
    let stage = h.engine.list_stages().unwrap()[1].id;

    let pending = h.engine.submit_lead(marketer, &fields("Pending Co")).unwrap();
    let accepted = h.engine.submit_lead(marketer, &fields("Accepted Co")).unwrap();
    h.engine.accept_lead(accepted, admin).unwrap();
    let rejected = h.engine.submit_lead(marketer, &fields("Rejected Co")).unwrap();
    h.engine.reject_lead(rejected, admin, COMMENT).unwrap();
    let resubmitted = h.engine.submit_lead(marketer, &fields("Resubmitted Co")).unwrap();
    h.engine.reject_lead(resubmitted, admin, COMMENT).unwrap();
    h.engine.resubmit_lead(resubmitted, marketer, COMMENT).unwrap();

    type Attempt = Box<dyn Fn(&LeadEngine, i32) -> leadflow::Result<()>>;
    let accept: Attempt = Box::new(move |e, l| e.accept_lead(l, admin));
    let reject: Attempt = Box::new(move |e, l| e.reject_lead(l, admin, COMMENT));
    let revert: Attempt = Box::new(move |e, l| e.revert_lead(l, admin, COMMENT));
    let resubmit: Attempt = Box::new(move |e, l| e.resubmit_lead(l, marketer, COMMENT));
    let assign: Attempt = Box::new(move |e, l| e.assign_bd(l, admin, bd, None));
    let move_stage: Attempt = Box::new(move |e, l| e.move_stage(l, admin, stage));
    let reassign: Attempt = Box::new(move |e, l| e.reassign_manager(l, admin, b, "cover"));

    let cases: Vec<(i32, Vec<&Attempt>)> = vec![
        (pending, vec![&revert, &resubmit, &assign, &move_stage]),
        (accepted, vec![&accept, &reject, &resubmit, &move_stage, &reassign]),
        (rejected, vec![&accept, &reject, &revert, &assign, &move_stage, &reassign]),
        (resubmitted, vec![&revert, &resubmit, &assign, &move_stage]),
    ];

    for (lead, attempts) in cases {
        for attempt in attempts {
            let before = h.snapshot(lead);
            let pushes = h.pushes.len();
            let err = attempt(&h.engine, lead).unwrap_err();
            assert!(matches!(err, LeadError::InvalidState(_)), "lead {}: {:?}", lead, err);
            assert_eq!(h.snapshot(lead), before);
            assert_eq!(h.pushes.len(), pushes);
        }
    }
}

#[test]
fn test_pushes_follow_commit() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    let topics = h.pushes.topics();
    assert!(topics.contains(&format!("user:{}", a)));
    assert!(topics.contains(&"leads".to_string()));

    let before = h.pushes.len();
    h.engine.accept_lead(lead, a).unwrap();
    let sent = h.pushes.sent.lock().unwrap().clone();
    let new = &sent[before..];
    assert!(new
        .iter()
        .any(|(t, p)| t == "leads" && p["event"] == "lead_updated" && p["update_type"] == "accepted"));
    assert!(new
        .iter()
        .any(|(t, p)| *t == format!("user:{}", marketer) && p["event"] == "new_notification"));
}

// =============================================================================
// Manual reassignment
// =============================================================================

#[test]
fn test_admin_reassigns_manager() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let admin = h.user("Root", Role::Admin);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    assert!(matches!(
        h.engine.reassign_manager(lead, admin, b, "  "),
        Err(LeadError::Validation(_))
    ));
    assert!(matches!(
        h.engine.reassign_manager(lead, a, b, "on leave"),
        Err(LeadError::Forbidden(_))
    ));
    assert!(matches!(
        h.engine.reassign_manager(lead, admin, a, "on leave"),
        Err(LeadError::InvalidState(_))
    ));

    let pointer = h.engine.peek_next_manager().unwrap();
    h.engine.reassign_manager(lead, admin, b, "on leave").unwrap();
    assert_eq!(h.engine.get_lead(lead).unwrap().current_manager_id, Some(b));
    let assignments = h.engine.assignments(lead).unwrap();
    assert_eq!(assignments[0].status, "reassigned");
    assert_eq!(assignments[1].manager_id, b);
    assert_eq!(assignments[1].deadline_at, stamp(h.now() + Duration::hours(4)));
    assert_eq!(h.pending_count(lead), 1);
    assert_eq!(h.engine.peek_next_manager().unwrap(), pointer);
    assert!(h.notifications_for(a).iter().any(|m| m.contains("was reassigned to Bob")));
}

// =============================================================================
// Deadline sweep
// =============================================================================

#[test]
fn test_deadline_sweep_moves_overdue_lead() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    h.advance(Duration::hours(15) + Duration::minutes(1));
    let before = h.notification_count();
    let report = h.engine.run_deadline_sweep(h.now()).unwrap();
    assert_eq!(report.acted, 1);

    let row = h.engine.get_lead(lead).unwrap();
    assert_eq!(row.status, "Pending");
    assert_eq!(row.current_manager_id, Some(b));
    let assignments = h.engine.assignments(lead).unwrap();
    assert_eq!(assignments[0].status, "expired");
    assert_eq!(assignments[1].manager_id, b);
    assert_eq!(assignments[1].deadline_at, stamp(h.now() + Duration::hours(4)));
    assert_eq!(h.pending_count(lead), 1);

    assert_eq!(h.notification_count() - before, 2);
    assert!(h
        .notifications_for(b)
        .contains(&"Lead for Acme has been reassigned to you (previous manager missed deadline)".to_string()));
    assert!(h
        .notifications_for(a)
        .contains(&"Lead for Acme was reassigned (deadline missed)".to_string()));
    let timeline = h.engine.timeline(lead).unwrap();
    assert!(timeline
        .iter()
        .any(|e| e.summary == "Lead auto-reassigned from Alice to Bob due to missed deadline"));
}

#[test]
fn test_deadline_sweep_is_idempotent() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    h.user("Alice", Role::Manager);
    h.user("Bob", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    h.advance(Duration::hours(16));
    let first = h.engine.run_deadline_sweep(h.now()).unwrap();
    let second = h.engine.run_deadline_sweep(h.now()).unwrap();
    assert_eq!(first.acted, 1);
    assert_eq!(second.scanned, 0);
    assert_eq!(second.acted, 0);
    assert_eq!(h.engine.assignments(lead).unwrap().len(), 2);
}

#[test]
fn test_deadline_sweep_never_returns_lead_to_incumbent() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let first = h.engine.submit_lead(marketer, &fields("First")).unwrap();
    let second = h.engine.submit_lead(marketer, &fields("Second")).unwrap();
    assert_eq!(h.engine.get_lead(first).unwrap().current_manager_id, Some(a));
    assert_eq!(h.engine.get_lead(second).unwrap().current_manager_id, Some(b));

    h.advance(Duration::hours(16));
    let report = h.engine.run_deadline_sweep(h.now()).unwrap();
    assert_eq!(report.acted, 2);
    assert_eq!(h.engine.get_lead(first).unwrap().current_manager_id, Some(b));
    assert_eq!(h.engine.get_lead(second).unwrap().current_manager_id, Some(a));
}

#[test]
fn test_deadline_sweep_skips_with_single_manager() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    h.advance(Duration::hours(16));
    let report = h.engine.run_deadline_sweep(h.now()).unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.engine.get_lead(lead).unwrap().current_manager_id, Some(a));
}

#[test]
fn test_deadline_sweep_waits_for_resubmission() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    h.engine.reject_lead(lead, a, COMMENT).unwrap();

    h.advance(Duration::hours(16));
    assert_eq!(h.engine.run_deadline_sweep(h.now()).unwrap().scanned, 0);

    h.engine.resubmit_lead(lead, marketer, COMMENT).unwrap();
    let report = h.engine.run_deadline_sweep(h.now()).unwrap();
    assert_eq!(report.acted, 1);
    let row = h.engine.get_lead(lead).unwrap();
    assert_eq!(row.status, "Resubmitted");
    assert_eq!(row.current_manager_id, Some(b));
}

#[test]
fn test_deadline_sweep_respects_batch_size() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    h.user("Alice", Role::Manager);
    h.user("Bob", Role::Manager);
    for i in 0..3 {
        h.engine.submit_lead(marketer, &fields(&format!("Co {}", i))).unwrap();
    }

    h.advance(Duration::hours(16));
    let cancel = tokio_util::sync::CancellationToken::new();
    let report = h.engine.run_deadline_sweep_with(h.now(), 2, &cancel).unwrap();
    assert_eq!(report.scanned, 2);
    let rest = h.engine.run_deadline_sweep(h.now()).unwrap();
    assert_eq!(rest.acted, 1);
}

// =============================================================================
// BD pipeline
// =============================================================================

struct Pipeline {
    h: Harness,
    manager: i32,
    x: i32,
    y: i32,
    lead: i32,
}

fn accepted_lead() -> Pipeline {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let manager = h.user("Alice", Role::Manager);
    let x = h.user("Xavier", Role::BdSales);
    let y = h.user("Yara", Role::BdSales);
    h.engine.seed_default_stages().unwrap();
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    h.engine.accept_lead(lead, manager).unwrap();
    Pipeline { h, manager, x, y, lead }
}

#[test]
fn test_assign_bd_places_lead_in_first_stage() {
    let p = accepted_lead();
    assert_eq!(p.h.engine.peek_suggested_bd().unwrap(), Some(p.x));

    p.h.engine.assign_bd(p.lead, p.manager, p.x, Some("Warm intro")).unwrap();
    let row = p.h.engine.get_lead(p.lead).unwrap();
    let stages = p.h.engine.list_stages().unwrap();
    assert_eq!(row.assigned_bd_id, Some(p.x));
    assert_eq!(row.current_stage_id, Some(stages[0].id));
    assert_eq!(stages[0].name, "New Qualified Lead");
    assert_eq!(p.h.engine.peek_suggested_bd().unwrap(), Some(p.y));
    assert!(p
        .h
        .notifications_for(p.x)
        .contains(&"New lead assigned to you: Acme".to_string()));

    let activities = p.h.engine.activities(p.lead).unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].activity_type, "assignment");
}

#[test]
fn test_assign_bd_requires_bd_user() {
    let p = accepted_lead();
    let err = p.h.engine.assign_bd(p.lead, p.manager, p.manager, None).unwrap_err();
    assert!(matches!(err, LeadError::Validation(_)));
}

#[test]
fn test_move_stage_by_owner_and_stranger() {
    let p = accepted_lead();
    let stages = p.h.engine.list_stages().unwrap();
    let won = stages.iter().find(|s| s.name == "Closed – Won").unwrap().id;

    let err = p.h.engine.move_stage(p.lead, p.manager, won).unwrap_err();
    assert!(matches!(err, LeadError::InvalidState(_)));

    p.h.engine.assign_bd(p.lead, p.manager, p.x, None).unwrap();
    let inbox_before = p.h.notifications_for(p.x).len();
    p.h.engine.move_stage(p.lead, p.x, won).unwrap();
    assert_eq!(p.h.engine.get_lead(p.lead).unwrap().current_stage_id, Some(won));
    assert_eq!(p.h.notifications_for(p.x).len(), inbox_before);

    let err = p.h.engine.move_stage(p.lead, p.y, stages[0].id).unwrap_err();
    assert!(matches!(err, LeadError::Forbidden(_)));

    let err = p.h.engine.move_stage(p.lead, p.x, 9999).unwrap_err();
    assert!(matches!(err, LeadError::NotFound(_)));
}

#[test]
fn test_manager_move_notifies_bd_owner() {
    let p = accepted_lead();
    let stages = p.h.engine.list_stages().unwrap();
    p.h.engine.assign_bd(p.lead, p.manager, p.x, None).unwrap();

    p.h.engine.move_stage(p.lead, p.manager, stages[2].id).unwrap();
    assert!(p
        .h
        .notifications_for(p.x)
        .contains(&format!("Alice moved lead \"Acme\" to {}", stages[2].name)));

    let history = p.h.engine.timeline(p.lead).unwrap();
    assert!(history
        .iter()
        .any(|e| e.summary == format!("Stage changed from New Qualified Lead to {}", stages[2].name)));
}

#[test]
fn test_deal_amount_rules() {
    let p = accepted_lead();
    p.h.engine.assign_bd(p.lead, p.manager, p.x, None).unwrap();

    assert!(matches!(
        p.h.engine.update_deal_amount(p.lead, p.x, Cents(-500)),
        Err(LeadError::Validation(_))
    ));
    assert!(matches!(
        p.h.engine.update_deal_amount(p.lead, p.y, Cents(10_000)),
        Err(LeadError::Forbidden(_))
    ));
    p.h.engine.update_deal_amount(p.lead, p.x, "2500".parse().unwrap()).unwrap();
    assert_eq!(p.h.engine.get_lead(p.lead).unwrap().deal_amount_cents, Some(250_000));

    // Ten cents stays exactly ten cents
    p.h.engine.update_deal_amount(p.lead, p.x, "0.1".parse().unwrap()).unwrap();
    let row = p.h.engine.get_lead(p.lead).unwrap();
    assert_eq!(row.deal_amount(), Some(Cents(10)));
    let timeline = p.h.engine.timeline(p.lead).unwrap();
    assert!(timeline.iter().any(|e| e.summary.contains("2500.00") && e.summary.contains("0.10")));
}

// =============================================================================
// Activities and reminders
// =============================================================================

#[test]
fn test_reminder_sweep_sends_once_per_day() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();
    let activity = h
        .engine
        .add_activity(
            lead,
            a,
            &ActivityInput {
                activity_type: ActivityType::FollowUp,
                title: Some("Call back".into()),
                description: None,
                due_at: Some(start_time() + Duration::days(2)),
                reminder_at: Some(start_time() - Duration::hours(1)),
            },
        )
        .unwrap();

    let first = h.engine.run_reminder_sweep(h.now()).unwrap();
    let second = h.engine.run_reminder_sweep(h.now()).unwrap();
    assert_eq!(first.acted, 1);
    assert_eq!(second.acted, 0);
    assert_eq!(second.skipped, 1);

    let tag = format!("[Activity #{}]", activity);
    let reminders: Vec<String> = h
        .notifications_for(a)
        .into_iter()
        .filter(|m| m.ends_with(&tag))
        .collect();
    assert_eq!(reminders, vec![format!("Reminder: Call back for Acme (Due: 2026-10-18) {}", tag)]);

    h.advance(Duration::days(1));
    assert_eq!(h.engine.run_reminder_sweep(h.now()).unwrap().acted, 1);

    assert!(h.engine.toggle_activity(lead, activity, a).unwrap());
    h.advance(Duration::days(1));
    assert_eq!(h.engine.run_reminder_sweep(h.now()).unwrap().scanned, 0);
}

#[test]
fn test_activity_access() {
    let p = accepted_lead();
    let input = ActivityInput {
        activity_type: ActivityType::CallLog,
        title: Some("Intro call".into()),
        description: None,
        due_at: None,
        reminder_at: None,
    };
    assert!(matches!(
        p.h.engine.add_activity(p.lead, p.x, &input),
        Err(LeadError::Forbidden(_))
    ));
    p.h.engine.assign_bd(p.lead, p.manager, p.x, None).unwrap();
    let id = p.h.engine.add_activity(p.lead, p.x, &input).unwrap();

    let empty = ActivityInput {
        title: None,
        ..input
    };
    assert!(matches!(
        p.h.engine.add_activity(p.lead, p.x, &empty),
        Err(LeadError::Validation(_))
    ));

    p.h.engine.delete_activity(p.lead, id, p.manager).unwrap();
    assert!(matches!(
        p.h.engine.toggle_activity(p.lead, id, p.manager),
        Err(LeadError::NotFound(_))
    ));
}

// =============================================================================
// Edits, attachments, deletion
// =============================================================================

#[test]
fn test_edit_lead_records_changes() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    let edit = LeadEdit {
        company: Some("Acme Corp".into()),
        city: Some("New York".into()),
        ..Default::default()
    };
    assert_eq!(h.engine.edit_lead(lead, marketer, &edit).unwrap(), 1);
    assert_eq!(h.engine.get_lead(lead).unwrap().company, "Acme Corp");
    let timeline = h.engine.timeline(lead).unwrap();
    assert!(timeline.iter().any(|e| e.summary == "company: Acme -> Acme Corp"));

    h.engine.accept_lead(lead, a).unwrap();
    let later = LeadEdit {
        phone: Some("+1 555 0199".into()),
        ..Default::default()
    };
    assert!(matches!(
        h.engine.edit_lead(lead, marketer, &later),
        Err(LeadError::Forbidden(_))
    ));
    assert_eq!(h.engine.edit_lead(lead, a, &later).unwrap(), 1);
}

#[test]
fn test_attach_file_stores_blob() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    let path = h.engine.attach_file(lead, marketer, b"%PDF-1.4", "brief.pdf").unwrap();
    assert!(path.ends_with("brief.pdf"));
    assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.4");
    assert_eq!(h.engine.get_lead(lead).unwrap().attachment_path, Some(path));
}

#[test]
fn test_soft_delete_restore_and_purge() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    h.user("Bob", Role::Manager);
    let admin = h.user("Root", Role::Admin);
    let mut linked = fields("Acme");
    linked.website = Some("https://acme.example".into());
    let lead = h.engine.submit_lead(marketer, &linked).unwrap();

    assert!(matches!(h.engine.soft_delete_lead(lead, a), Err(LeadError::Forbidden(_))));
    h.engine.soft_delete_lead(lead, admin).unwrap();
    assert!(matches!(h.engine.get_lead(lead), Err(LeadError::NotFound(_))));
    assert!(matches!(h.engine.accept_lead(lead, a), Err(LeadError::NotFound(_))));

    h.advance(Duration::hours(16));
    assert_eq!(h.engine.run_deadline_sweep(h.now()).unwrap().scanned, 0);
    assert_eq!(h.engine.deleted_leads().unwrap().len(), 1);

    h.engine.restore_lead(lead, admin).unwrap();
    assert_eq!(h.status(lead), "Pending");
    assert!(matches!(h.engine.restore_lead(lead, admin), Err(LeadError::InvalidState(_))));

    h.engine.purge_lead(lead, admin).unwrap();
    assert!(matches!(h.engine.get_lead(lead), Err(LeadError::NotFound(_))));
    assert_eq!(h.pending_count(lead), 0);
    assert_eq!(h.note_count(lead), 0);
    let mut conn = h.engine.db().conn().unwrap();
    let profiles: i64 = lead_social_profiles::table
        .filter(lead_social_profiles::lead_id.eq(lead))
        .count()
        .get_result(&mut conn)
        .unwrap();
    assert_eq!(profiles, 0);
}

// =============================================================================
// Directory
// =============================================================================

#[test]
fn test_delete_user_with_replacement() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let b = h.user("Bob", Role::Manager);
    let admin = h.user("Root", Role::Admin);
    let lead = h.engine.submit_lead(marketer, &fields("Acme")).unwrap();

    assert!(matches!(
        h.engine.delete_user(admin, a, None),
        Err(LeadError::InvalidState(_))
    ));
    assert!(matches!(
        h.engine.delete_user(admin, a, Some(marketer)),
        Err(LeadError::Validation(_))
    ));

    h.engine.delete_user(admin, a, Some(b)).unwrap();
    assert!(matches!(h.engine.get_user(a), Err(LeadError::NotFound(_))));
    assert_eq!(h.engine.get_lead(lead).unwrap().current_manager_id, Some(b));
    assert!(h.engine.assignments(lead).unwrap().iter().all(|x| x.manager_id == b));

    assert!(matches!(
        h.engine.delete_user(admin, b, None),
        Err(LeadError::InvalidState(_))
    ));
}

#[test]
fn test_protected_and_self_deletion() {
    let h = harness();
    let root = h
        .engine
        .create_user("Root", "root@example.com", Role::Admin, true)
        .unwrap();
    let other = h.user("Ops", Role::Admin);

    assert!(matches!(h.engine.delete_user(other, root, None), Err(LeadError::Forbidden(_))));
    assert!(matches!(h.engine.delete_user(other, other, None), Err(LeadError::Forbidden(_))));
    assert!(matches!(
        h.engine.create_user("Dup", "ROOT@example.com", Role::Manager, false),
        Err(LeadError::Validation(_))
    ));
}

#[test]
fn test_stage_configuration() {
    let h = harness();
    assert_eq!(h.engine.seed_default_stages().unwrap(), 6);
    assert_eq!(h.engine.seed_default_stages().unwrap(), 0);

    let extra = h.engine.create_stage("On Hold", "#6c757d", Some("Paused deals")).unwrap();
    let stages = h.engine.list_stages().unwrap();
    assert_eq!(stages.last().unwrap().id, extra);
    assert_eq!(stages.last().unwrap().position, 7);
    assert!(matches!(
        h.engine.create_stage("On Hold", "#000000", None),
        Err(LeadError::Validation(_))
    ));

    let mut ids: Vec<i32> = stages.iter().map(|s| s.id).collect();
    ids.reverse();
    h.engine.reorder_stages(&ids).unwrap();
    assert_eq!(h.engine.list_stages().unwrap()[0].id, extra);
    assert!(matches!(
        h.engine.reorder_stages(&ids[1..]),
        Err(LeadError::Validation(_))
    ));

    h.engine.delete_stage(extra).unwrap();
    assert_eq!(h.engine.list_stages().unwrap().len(), 6);
}

#[test]
fn test_stage_in_use_cannot_be_deleted() {
    let p = accepted_lead();
    p.h.engine.assign_bd(p.lead, p.manager, p.x, None).unwrap();
    let first = p.h.engine.list_stages().unwrap()[0].id;
    assert!(matches!(p.h.engine.delete_stage(first), Err(LeadError::InvalidState(_))));
}

#[test]
fn test_notification_inbox() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    h.engine.submit_lead(marketer, &fields("One")).unwrap();
    h.engine.submit_lead(marketer, &fields("Two")).unwrap();

    let unread = h.engine.unread_notifications(a).unwrap();
    assert_eq!(unread.len(), 2);
    h.engine.mark_read(a, unread[0].id).unwrap();
    assert_eq!(h.engine.unread_notifications(a).unwrap().len(), 1);
    assert!(matches!(
        h.engine.mark_read(marketer, unread[1].id),
        Err(LeadError::NotFound(_))
    ));
    assert_eq!(h.engine.mark_all_read(a).unwrap(), 1);
    assert!(h.engine.unread_notifications(a).unwrap().is_empty());
}

#[test]
fn test_status_listing() {
    let h = harness();
    let marketer = h.user("Mia", Role::Marketer);
    let a = h.user("Alice", Role::Manager);
    let first = h.engine.submit_lead(marketer, &fields("One")).unwrap();
    h.engine.submit_lead(marketer, &fields("Two")).unwrap();
    h.engine.accept_lead(first, a).unwrap();

    let accepted = h.engine.list_leads(Some(LeadStatus::Accepted), 10).unwrap();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].id, first);
    assert_eq!(h.engine.list_leads(None, 10).unwrap().len(), 2);
}

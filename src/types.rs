//! Closed vocabularies stored as text columns
//!
//! Each enum round-trips through its `as_str` / `parse` pair; the strings are
//! what the database CHECK constraints accept.

use crate::error::LeadError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Marketer,
    BdSales,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Manager, Role::Marketer, Role::BdSales];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Marketer => "marketer",
            Role::BdSales => "bd_sales",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "marketer" => Some(Role::Marketer),
            "bd_sales" => Some(Role::BdSales),
            _ => None,
        }
    }

    /// Human label shown in the UI
    pub fn label(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Manager => "EM Team Leader",
            Role::Marketer => "Email Marketer",
            Role::BdSales => "BD Sales",
        }
    }

    /// Admins and managers review leads
    pub fn is_reviewer(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one manager-owns-lead period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Acted,
    Reassigned,
    Expired,
    Reverted,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Acted => "acted",
            AssignmentStatus::Reassigned => "reassigned",
            AssignmentStatus::Expired => "expired",
            AssignmentStatus::Reverted => "reverted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AssignmentStatus::Pending),
            "acted" => Some(AssignmentStatus::Acted),
            "reassigned" => Some(AssignmentStatus::Reassigned),
            "expired" => Some(AssignmentStatus::Expired),
            "reverted" => Some(AssignmentStatus::Reverted),
            _ => None,
        }
    }
}

/// Kind of a lead note
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteType {
    System,
    Rejection,
    Resubmission,
    Reversion,
    Edit,
}

impl NoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteType::System => "system",
            NoteType::Rejection => "rejection",
            NoteType::Resubmission => "resubmission",
            NoteType::Reversion => "reversion",
            NoteType::Edit => "edit",
        }
    }
}

/// Notification category, drives the client-side styling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Assignment,
    Reminder,
    StageChange,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Info => "info",
            NotificationKind::Success => "success",
            NotificationKind::Warning => "warning",
            NotificationKind::Assignment => "assignment",
            NotificationKind::Reminder => "reminder",
            NotificationKind::StageChange => "stage_change",
        }
    }
}

/// Activity types a lead can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Note,
    Task,
    FollowUp,
    Reminder,
    CallLog,
    EmailLog,
    StageChange,
    Assignment,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Note => "note",
            ActivityType::Task => "task",
            ActivityType::FollowUp => "follow_up",
            ActivityType::Reminder => "reminder",
            ActivityType::CallLog => "call_log",
            ActivityType::EmailLog => "email_log",
            ActivityType::StageChange => "stage_change",
            ActivityType::Assignment => "assignment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(ActivityType::Note),
            "task" => Some(ActivityType::Task),
            "follow_up" => Some(ActivityType::FollowUp),
            "reminder" => Some(ActivityType::Reminder),
            "call_log" => Some(ActivityType::CallLog),
            "email_log" => Some(ActivityType::EmailLog),
            "stage_change" => Some(ActivityType::StageChange),
            "assignment" => Some(ActivityType::Assignment),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActivityType::Note => "Note",
            ActivityType::Task => "Task",
            ActivityType::FollowUp => "Follow-up",
            ActivityType::Reminder => "Reminder",
            ActivityType::CallLog => "Call Log",
            ActivityType::EmailLog => "Email Log",
            ActivityType::StageChange => "Stage Change",
            ActivityType::Assignment => "Assignment",
        }
    }
}

/// A non-negative money amount held as whole cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl FromStr for Cents {
    type Err = LeadError;

    /// Accepts plain decimals with at most two fraction digits: `1200`, `0.1`, `1200.50`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.starts_with('-') {
            return Err(LeadError::Validation("deal amount must be zero or more".into()));
        }
        let invalid = || LeadError::Validation(format!("'{}' is not a valid amount", text));
        let (whole, frac) = text.split_once('.').unwrap_or((text, ""));
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || frac.len() > 2 || !digits(whole) || !digits(frac) {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(frac))
            .map(Cents)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

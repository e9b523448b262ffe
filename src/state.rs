//! Lead status state machine
//!
//! The single place that decides whether an event is legal for a lead.
//! Every lifecycle operation asks [`LeadStatus::apply`] before touching the
//! store, so an illegal event is rejected before any write happens.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Pending, Resubmitted | `Accept` | Accepted |
//! | Pending, Resubmitted | `Reject` | Rejected |
//! | Pending, Resubmitted | `Reassign` | unchanged |
//! | Accepted | `Revert` | Rejected |
//! | Accepted | `AssignBd` | Accepted |
//! | Accepted (BD assigned) | `MoveStage` | Accepted |
//! | Rejected | `Resubmit` | Resubmitted |

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeadStatus {
    Pending,
    Accepted,
    Rejected,
    Resubmitted,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 4] = [
        LeadStatus::Pending,
        LeadStatus::Accepted,
        LeadStatus::Rejected,
        LeadStatus::Resubmitted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Pending => "Pending",
            LeadStatus::Accepted => "Accepted",
            LeadStatus::Rejected => "Rejected",
            LeadStatus::Resubmitted => "Resubmitted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(LeadStatus::Pending),
            "Accepted" => Some(LeadStatus::Accepted),
            "Rejected" => Some(LeadStatus::Rejected),
            "Resubmitted" => Some(LeadStatus::Resubmitted),
            _ => None,
        }
    }

    /// Statuses whose pending assignment can be swept and reassigned
    pub fn awaiting_review(&self) -> bool {
        matches!(self, LeadStatus::Pending | LeadStatus::Resubmitted)
    }

    /// Target status for `event`, or `None` when the event is illegal here.
    ///
    /// `bd_assigned` only matters for `MoveStage`: a stage can only be moved
    /// once the lead sits in the BD pipeline.
    pub fn apply(&self, event: LeadEvent, bd_assigned: bool) -> Option<LeadStatus> {
        use LeadEvent::*;
        use LeadStatus::*;

        match (self, event) {
            (Pending | Resubmitted, Accept) => Some(Accepted),
            (Pending | Resubmitted, Reject) => Some(Rejected),
            (Pending | Resubmitted, Reassign) => Some(*self),
            (Accepted, Revert) => Some(Rejected),
            (Accepted, AssignBd) => Some(Accepted),
            (Accepted, MoveStage) if bd_assigned => Some(Accepted),
            (Rejected, Resubmit) => Some(Resubmitted),
            _ => None,
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move a lead through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeadEvent {
    Accept,
    Reject,
    Revert,
    Resubmit,
    AssignBd,
    MoveStage,
    /// Manager swap, by the deadline sweep or an admin
    Reassign,
}

impl LeadEvent {
    pub const ALL: [LeadEvent; 7] = [
        LeadEvent::Accept,
        LeadEvent::Reject,
        LeadEvent::Revert,
        LeadEvent::Resubmit,
        LeadEvent::AssignBd,
        LeadEvent::MoveStage,
        LeadEvent::Reassign,
    ];

    pub fn verb(&self) -> &'static str {
        match self {
            LeadEvent::Accept => "accept",
            LeadEvent::Reject => "reject",
            LeadEvent::Revert => "revert",
            LeadEvent::Resubmit => "resubmit",
            LeadEvent::AssignBd => "assign to BD",
            LeadEvent::MoveStage => "move the stage of",
            LeadEvent::Reassign => "reassign",
        }
    }
}

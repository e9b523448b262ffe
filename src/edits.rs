//! Field edits, deal amounts, attachments and deletion of leads

use crate::audit;
use crate::db::{Lead, User};
use crate::error::{LeadError, Result};
use crate::lifecycle::{load_lead, load_user, role_of, status_of, validate_email, LeadEngine};
use crate::schema::*;
use crate::state::LeadStatus;
use crate::types::{Cents, NoteType, Role};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::json;

/// Folder attachments are stored under
const ATTACHMENT_FOLDER: &str = "leads";

/// Requested changes; `None` leaves a field alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadEdit {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub domain: Option<String>,
    pub industry: Option<String>,
    pub services: Option<Vec<String>>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = leads)]
struct LeadChangeset {
    full_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    domain: Option<String>,
    industry: Option<String>,
    services_csv: Option<String>,
    country: Option<String>,
    state: Option<String>,
    city: Option<String>,
    updated_at: Option<String>,
}

/// Admins and managers always; the submitter until the lead is accepted
fn require_edit_access(actor: &User, lead: &Lead) -> Result<()> {
    match role_of(actor)? {
        Role::Admin | Role::Manager => Ok(()),
        _ if lead.submitted_by_user_id == actor.id => {
            if status_of(lead)? == LeadStatus::Accepted {
                Err(LeadError::Forbidden("accepted leads can only be edited by managers".into()))
            } else {
                Ok(())
            }
        }
        _ => Err(LeadError::Forbidden("you can only edit your own leads".into())),
    }
}

fn require_admin(actor: &User, what: &str) -> Result<()> {
    if role_of(actor)? == Role::Admin {
        Ok(())
    } else {
        Err(LeadError::Forbidden(format!("only admins can {}", what)))
    }
}

/// `(field, old, new)` for every value that actually changes
fn diff_fields(lead: &Lead, edit: &LeadEdit) -> Vec<(&'static str, Option<String>, String)> {
    let mut changes = Vec::new();
    let mut check = |field: &'static str, old: &str, new: &Option<String>| {
        if let Some(new) = new.as_deref().map(str::trim) {
            if new != old {
                changes.push((field, Some(old.to_string()).filter(|o| !o.is_empty()), new.to_string()));
            }
        }
    };
    check("full_name", &lead.full_name, &edit.full_name);
    check("email", &lead.email, &edit.email);
    check("phone", &lead.phone, &edit.phone);
    check("company", &lead.company, &edit.company);
    check("domain", &lead.domain, &edit.domain);
    check("industry", lead.industry.as_deref().unwrap_or(""), &edit.industry);
    let services = edit.services.as_ref().map(|list| {
        list.iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    });
    check("services_csv", &lead.services_csv, &services);
    check("country", &lead.country, &edit.country);
    check("state", &lead.state, &edit.state);
    check("city", &lead.city, &edit.city);
    changes
}

impl LeadEngine {
    /// Apply field edits, recording each changed value. Returns how many
    /// fields changed.
    pub fn edit_lead(&self, lead_id: i32, actor_id: i32, edit: &LeadEdit) -> Result<usize> {
        for (field, value) in [("full name", &edit.full_name), ("email", &edit.email), ("company", &edit.company)] {
            if matches!(value.as_deref().map(str::trim), Some("")) {
                return Err(LeadError::Validation(format!("{} cannot be empty", field)));
            }
        }
        if let Some(email) = &edit.email {
            validate_email(email)?;
        }

        let changed = self.transact("edit_lead", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_edit_access(&actor, &lead)?;

            let changes = diff_fields(&lead, edit);
            if changes.is_empty() {
                return Ok(0);
            }

            let mut set = LeadChangeset {
                updated_at: Some(tx.stamp.clone()),
                ..Default::default()
            };
            for (field, old, new) in &changes {
                audit::field_change(tx.conn, lead.id, actor.id, field, old.as_deref(), Some(new.as_str()), &tx.stamp)?;
                let slot = match *field {
                    "full_name" => &mut set.full_name,
                    "email" => &mut set.email,
                    "phone" => &mut set.phone,
                    "company" => &mut set.company,
                    "domain" => &mut set.domain,
                    "industry" => &mut set.industry,
                    "services_csv" => &mut set.services_csv,
                    "country" => &mut set.country,
                    "state" => &mut set.state,
                    _ => &mut set.city,
                };
                *slot = Some(new.clone());
            }
            diesel::update(leads::table.find(lead.id)).set(&set).execute(tx.conn)?;

            let fields: Vec<&str> = changes.iter().map(|(f, _, _)| *f).collect();
            tx.note(
                lead.id,
                Some(actor.id),
                NoteType::Edit,
                &format!("Lead edited by {}: {}", actor.name, fields.join(", ")),
            )?;
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "edited", "fields": fields, "updated_by": actor.name }),
            );
            Ok(changes.len())
        })?;
        if changed > 0 {
            tracing::info!(lead_id, actor_id, changed, "lead edited");
        }
        Ok(changed)
    }

    pub fn update_deal_amount(&self, lead_id: i32, actor_id: i32, amount: Cents) -> Result<()> {
        if amount.0 < 0 {
            return Err(LeadError::Validation("deal amount must be zero or more".into()));
        }
        self.transact("update_deal_amount", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            let role = role_of(&actor)?;
            if !(role.is_reviewer() || (role == Role::BdSales && lead.assigned_bd_id == Some(actor.id))) {
                return Err(LeadError::Forbidden("you cannot change the deal amount of this lead".into()));
            }
            if status_of(&lead)? != LeadStatus::Accepted {
                return Err(LeadError::InvalidState(format!(
                    "lead {} must be Accepted to carry a deal amount",
                    lead.id
                )));
            }

            let old = lead.deal_amount().map(|a| a.to_string());
            let new = amount.to_string();
            diesel::update(leads::table.find(lead.id))
                .set((leads::deal_amount_cents.eq(Some(amount.0)), leads::updated_at.eq(&tx.stamp)))
                .execute(tx.conn)?;
            audit::field_change(tx.conn, lead.id, actor.id, "deal_amount", old.as_deref(), Some(new.as_str()), &tx.stamp)?;
            tx.outbox.lead_event(
                "lead_updated",
                lead.id,
                json!({ "update_type": "deal_amount", "deal_amount": new, "deal_amount_cents": amount.0 }),
            );
            Ok(())
        })
    }

    /// Store an attachment and point the lead at it. The blob is written
    /// first and removed again if the transaction fails.
    pub fn attach_file(&self, lead_id: i32, actor_id: i32, bytes: &[u8], name: &str) -> Result<String> {
        if bytes.is_empty() {
            return Err(LeadError::Validation("attachment is empty".into()));
        }
        let clean = crate::blob::sanitize_name(name);
        if clean.is_empty() {
            return Err(LeadError::Validation(format!("'{}' is not a valid file name", name)));
        }

        self.read("attach_file_check", |conn| {
            let actor = load_user(conn, actor_id)?;
            let lead = load_lead(conn, lead_id)?;
            require_edit_access(&actor, &lead)
        })?;

        let stored_name = format!("{}_{}_{}", lead_id, self.now().format("%Y%m%d_%H%M%S"), clean);
        let location = self.blobs().put(bytes, &stored_name, ATTACHMENT_FOLDER)?;

        let result = self.transact("attach_file", |tx| {
            let actor = load_user(tx.conn, actor_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_edit_access(&actor, &lead)?;
            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::attachment_path.eq(Some(location.as_str())),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;
            audit::field_change(
                tx.conn,
                lead.id,
                actor.id,
                "attachment_path",
                lead.attachment_path.as_deref(),
                Some(location.as_str()),
                &tx.stamp,
            )?;
            tx.outbox.lead_event("lead_updated", lead.id, json!({ "update_type": "attachment" }));
            Ok(())
        });

        match result {
            Ok(()) => Ok(location),
            Err(e) => {
                if let Err(cleanup) = self.blobs().delete(&stored_name, ATTACHMENT_FOLDER) {
                    tracing::warn!(lead_id, error = %cleanup, "could not remove orphaned attachment");
                }
                Err(e)
            }
        }
    }

    /// Hide a lead from every transition and sweep
    pub fn soft_delete_lead(&self, lead_id: i32, admin_id: i32) -> Result<()> {
        self.transact("soft_delete_lead", |tx| {
            let admin = load_user(tx.conn, admin_id)?;
            let lead = load_lead(tx.conn, lead_id)?;
            require_admin(&admin, "delete leads")?;
            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::is_deleted.eq(true),
                    leads::deleted_at.eq(Some(tx.stamp.as_str())),
                    leads::deleted_by_id.eq(Some(admin.id)),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;
            tx.note(lead.id, Some(admin.id), NoteType::System, &format!("Lead deleted by {}", admin.name))?;
            tx.outbox.lead_event("lead_deleted", lead.id, json!({}));
            Ok(())
        })?;
        tracing::info!(lead_id, admin_id, "lead soft-deleted");
        Ok(())
    }

    pub fn restore_lead(&self, lead_id: i32, admin_id: i32) -> Result<()> {
        self.transact("restore_lead", |tx| {
            let admin = load_user(tx.conn, admin_id)?;
            let lead = leads::table
                .find(lead_id)
                .first::<Lead>(tx.conn)
                .optional()?
                .ok_or_else(|| LeadError::not_found(format!("lead {}", lead_id)))?;
            require_admin(&admin, "restore leads")?;
            if !lead.is_deleted {
                return Err(LeadError::InvalidState(format!("lead {} is not deleted", lead.id)));
            }
            diesel::update(leads::table.find(lead.id))
                .set((
                    leads::is_deleted.eq(false),
                    leads::deleted_at.eq(None::<String>),
                    leads::deleted_by_id.eq(None::<i32>),
                    leads::updated_at.eq(&tx.stamp),
                ))
                .execute(tx.conn)?;
            tx.note(lead.id, Some(admin.id), NoteType::System, &format!("Lead restored by {}", admin.name))?;
            tx.outbox.lead_event("lead_restored", lead.id, json!({}));
            Ok(())
        })?;
        tracing::info!(lead_id, admin_id, "lead restored");
        Ok(())
    }

    /// Hard delete of a lead and everything hanging off it. The lead may
    /// be soft-deleted already.
    pub fn purge_lead(&self, lead_id: i32, admin_id: i32) -> Result<()> {
        let attachment = self.transact("purge_lead", |tx| {
            let admin = load_user(tx.conn, admin_id)?;
            let lead = leads::table
                .find(lead_id)
                .first::<Lead>(tx.conn)
                .optional()?
                .ok_or_else(|| LeadError::not_found(format!("lead {}", lead_id)))?;
            require_admin(&admin, "purge leads")?;

            diesel::delete(notifications::table.filter(notifications::lead_id.eq(lead.id))).execute(tx.conn)?;
            diesel::delete(lead_edit_changes::table.filter(lead_edit_changes::lead_id.eq(lead.id))).execute(tx.conn)?;
            diesel::delete(lead_activities::table.filter(lead_activities::lead_id.eq(lead.id))).execute(tx.conn)?;
            diesel::delete(lead_social_profiles::table.filter(lead_social_profiles::lead_id.eq(lead.id)))
                .execute(tx.conn)?;
            diesel::delete(lead_assignment_history::table.filter(lead_assignment_history::lead_id.eq(lead.id)))
                .execute(tx.conn)?;
            diesel::delete(bd_assignment_history::table.filter(bd_assignment_history::lead_id.eq(lead.id)))
                .execute(tx.conn)?;
            diesel::delete(lead_stage_history::table.filter(lead_stage_history::lead_id.eq(lead.id))).execute(tx.conn)?;
            diesel::delete(lead_notes::table.filter(lead_notes::lead_id.eq(lead.id))).execute(tx.conn)?;
            diesel::delete(lead_assignments::table.filter(lead_assignments::lead_id.eq(lead.id))).execute(tx.conn)?;
            diesel::delete(leads::table.find(lead.id)).execute(tx.conn)?;

            tx.outbox.lead_event("lead_deleted", lead.id, json!({ "purged": true }));
            Ok(lead.attachment_path)
        })?;

        if let Some(path) = attachment {
            let name = std::path::Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Err(e) = self.blobs().delete(&name, ATTACHMENT_FOLDER) {
                tracing::warn!(lead_id, error = %e, "could not remove attachment of purged lead");
            }
        }
        tracing::info!(lead_id, admin_id, "lead purged");
        Ok(())
    }

    /// Soft-deleted leads, most recently deleted first
    pub fn deleted_leads(&self) -> Result<Vec<Lead>> {
        self.read("deleted_leads", |conn| {
            Ok(leads::table
                .filter(leads::is_deleted.eq(true))
                .order(leads::deleted_at.desc())
                .load::<Lead>(conn)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead() -> Lead {
        Lead {
            id: 1,
            submitted_by_user_id: 2,
            full_name: "Ada".into(),
            email: "ada@x.io".into(),
            phone: "".into(),
            company: "Engines".into(),
            domain: "engines.io".into(),
            industry: None,
            services_csv: "SEO".into(),
            country: "UK".into(),
            state: "".into(),
            city: "London".into(),
            attachment_path: None,
            status: "Pending".into(),
            current_manager_id: None,
            assigned_bd_id: None,
            current_stage_id: None,
            deal_amount_cents: None,
            created_at: "t".into(),
            assigned_at: None,
            accepted_at: None,
            assigned_to_bd_at: None,
            updated_at: "t".into(),
            is_deleted: false,
            deleted_at: None,
            deleted_by_id: None,
        }
    }

    #[test]
    fn test_diff_skips_unchanged_values() {
        let edit = LeadEdit {
            company: Some(" Engines ".into()),
            city: Some("Paris".into()),
            industry: Some("Computing".into()),
            services: Some(vec!["SEO".into()]),
            ..Default::default()
        };
        let changes = diff_fields(&lead(), &edit);
        assert_eq!(
            changes,
            vec![
                ("industry", None, "Computing".to_string()),
                ("city", Some("London".to_string()), "Paris".to_string()),
            ]
        );
    }

    #[test]
    fn test_submitter_loses_edit_access_once_accepted() {
        let submitter = User {
            id: 2,
            name: "M".into(),
            email: "m@x.io".into(),
            role: "marketer".into(),
            is_protected: false,
            created_at: "t".into(),
        };
        let mut l = lead();
        assert!(require_edit_access(&submitter, &l).is_ok());
        l.status = "Accepted".into();
        assert!(matches!(require_edit_access(&submitter, &l), Err(LeadError::Forbidden(_))));
        l.submitted_by_user_id = 9;
        l.status = "Pending".into();
        assert!(matches!(require_edit_access(&submitter, &l), Err(LeadError::Forbidden(_))));
    }
}

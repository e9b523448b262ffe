//! Round-robin allocator
//!
//! One rotation pointer per pool lives in the `assignment_settings`
//! singleton row. Candidates are sorted by ascending id; the next candidate
//! is the one right after the pointer, wrapping to the first. A pointer that
//! no longer names a pool member restarts the rotation at the first id.
//!
//! Every function takes the caller's connection so the pointer moves inside
//! the same transaction as the assignment it authorizes.

use crate::error::Result;
use crate::schema::{assignment_settings, users};
use crate::types::Role;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

const SETTINGS_ID: i32 = 1;

/// Candidate pool with its own pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Managers,
    BdSales,
}

impl Pool {
    pub fn role(&self) -> Role {
        match self {
            Pool::Managers => Role::Manager,
            Pool::BdSales => Role::BdSales,
        }
    }
}

/// Next id after `pointer` in `sorted`, wrapping; `None` for an empty pool
pub fn next_in_rotation(sorted: &[i32], pointer: Option<i32>) -> Option<i32> {
    let first = *sorted.first()?;
    let Some(pointer) = pointer else {
        return Some(first);
    };
    match sorted.iter().position(|&id| id == pointer) {
        Some(i) => Some(sorted[(i + 1) % sorted.len()]),
        None => Some(first),
    }
}

/// Pool members, ascending id
pub fn candidates(conn: &mut SqliteConnection, pool: Pool) -> Result<Vec<i32>> {
    let ids = users::table
        .filter(users::role.eq(pool.role().as_str()))
        .order(users::id.asc())
        .select(users::id)
        .load::<i32>(conn)?;
    Ok(ids)
}

pub fn pointer(conn: &mut SqliteConnection, pool: Pool) -> Result<Option<i32>> {
    let row = assignment_settings::table
        .find(SETTINGS_ID)
        .select((
            assignment_settings::last_assigned_manager_id,
            assignment_settings::last_assigned_bd_id,
        ))
        .first::<(Option<i32>, Option<i32>)>(conn)
        .optional()?;

    Ok(row.and_then(|(manager, bd)| match pool {
        Pool::Managers => manager,
        Pool::BdSales => bd,
    }))
}

/// Candidate `take_next` would return, without moving the pointer
pub fn peek_next(conn: &mut SqliteConnection, pool: Pool) -> Result<Option<i32>> {
    let ids = candidates(conn, pool)?;
    let current = pointer(conn, pool)?;
    Ok(next_in_rotation(&ids, current))
}

/// Pick the next candidate and advance the pointer to it
pub fn take_next(conn: &mut SqliteConnection, pool: Pool, now: &str) -> Result<Option<i32>> {
    let next = peek_next(conn, pool)?;
    if let Some(id) = next {
        commit_choice(conn, pool, id, now)?;
    }
    Ok(next)
}

/// Set the pointer to an explicitly chosen candidate
pub fn commit_choice(conn: &mut SqliteConnection, pool: Pool, chosen: i32, now: &str) -> Result<()> {
    let target = assignment_settings::table.find(SETTINGS_ID);
    let updated = match pool {
        Pool::Managers => diesel::update(target)
            .set((
                assignment_settings::last_assigned_manager_id.eq(Some(chosen)),
                assignment_settings::updated_at.eq(now),
            ))
            .execute(conn)?,
        Pool::BdSales => diesel::update(target)
            .set((
                assignment_settings::last_assigned_bd_id.eq(Some(chosen)),
                assignment_settings::updated_at.eq(now),
            ))
            .execute(conn)?,
    };

    if updated == 0 {
        tracing::warn!("assignment settings row missing, recreating");
        let (manager, bd) = match pool {
            Pool::Managers => (Some(chosen), None),
            Pool::BdSales => (None, Some(chosen)),
        };
        diesel::insert_into(assignment_settings::table)
            .values((
                assignment_settings::id.eq(SETTINGS_ID),
                assignment_settings::last_assigned_manager_id.eq(manager),
                assignment_settings::last_assigned_bd_id.eq(bd),
                assignment_settings::updated_at.eq(now),
            ))
            .execute(conn)?;
    }
    Ok(())
}

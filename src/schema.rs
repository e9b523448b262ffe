// Leadflow schema - lead lifecycle tables for Diesel ORM

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

diesel::table! {
    users (id) {
        id -> Integer,
        name -> Text,
        email -> Text,
        role -> Text,                    // 'admin', 'manager', 'marketer', 'bd_sales'
        is_protected -> Bool,
        created_at -> Text,
    }
}

diesel::table! {
    pipeline_stages (id) {
        id -> Integer,
        name -> Text,
        position -> Integer,
        color -> Text,
        description -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    leads (id) {
        id -> Integer,
        submitted_by_user_id -> Integer,
        full_name -> Text,
        email -> Text,
        phone -> Text,
        company -> Text,
        domain -> Text,
        industry -> Nullable<Text>,
        services_csv -> Text,
        country -> Text,
        state -> Text,
        city -> Text,
        attachment_path -> Nullable<Text>,
        status -> Text,                  // 'Pending', 'Accepted', 'Rejected', 'Resubmitted'
        current_manager_id -> Nullable<Integer>,
        assigned_bd_id -> Nullable<Integer>,
        current_stage_id -> Nullable<Integer>,
        deal_amount_cents -> Nullable<BigInt>,
        created_at -> Text,
        assigned_at -> Nullable<Text>,
        accepted_at -> Nullable<Text>,
        assigned_to_bd_at -> Nullable<Text>,
        updated_at -> Text,
        is_deleted -> Bool,
        deleted_at -> Nullable<Text>,
        deleted_by_id -> Nullable<Integer>,
    }
}

// ============================================================================
// Assignment Tables
// ============================================================================

diesel::table! {
    lead_assignments (id) {
        id -> Integer,
        lead_id -> Integer,
        manager_id -> Integer,
        assigned_at -> Text,
        deadline_at -> Text,
        acted_at -> Nullable<Text>,
        status -> Text,                  // 'pending', 'acted', 'reassigned', 'expired', 'reverted'
        is_initial_assignment -> Bool,
    }
}

diesel::table! {
    assignment_settings (id) {
        id -> Integer,                   // always 1
        last_assigned_manager_id -> Nullable<Integer>,
        last_assigned_bd_id -> Nullable<Integer>,
        updated_at -> Text,
    }
}

// ============================================================================
// Audit Trail Tables - append-only
// ============================================================================

diesel::table! {
    lead_notes (id) {
        id -> Integer,
        lead_id -> Integer,
        author_user_id -> Nullable<Integer>,   // NULL for system-initiated notes
        note_type -> Text,               // 'system', 'rejection', 'resubmission', 'reversion', 'edit'
        message -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    lead_stage_history (id) {
        id -> Integer,
        lead_id -> Integer,
        from_stage_id -> Nullable<Integer>,
        to_stage_id -> Integer,
        changed_by_id -> Integer,
        note -> Nullable<Text>,
        changed_at -> Text,
    }
}

diesel::table! {
    bd_assignment_history (id) {
        id -> Integer,
        lead_id -> Integer,
        from_bd_id -> Nullable<Integer>,
        to_bd_id -> Integer,
        assigned_by_id -> Integer,
        reason -> Nullable<Text>,
        reassigned_at -> Text,
    }
}

diesel::table! {
    lead_assignment_history (id) {
        id -> Integer,
        lead_id -> Integer,
        assignment_id -> Nullable<Integer>,    // the superseded assignment row
        from_manager_id -> Nullable<Integer>,
        to_manager_id -> Integer,
        reason -> Text,
        triggered_by -> Text,            // 'admin' or 'system'
        reassigned_at -> Text,
    }
}

diesel::table! {
    lead_activities (id) {
        id -> Integer,
        lead_id -> Integer,
        actor_id -> Integer,
        activity_type -> Text,
        title -> Nullable<Text>,
        description -> Nullable<Text>,
        due_at -> Nullable<Text>,
        reminder_at -> Nullable<Text>,
        completed_at -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    lead_social_profiles (id) {
        id -> Integer,
        lead_id -> Integer,
        platform -> Text,                // 'linkedin', 'twitter', 'facebook', 'website'
        url -> Text,
        added_by_id -> Integer,
        created_at -> Text,
    }
}

diesel::table! {
    lead_edit_changes (id) {
        id -> Integer,
        lead_id -> Integer,
        editor_user_id -> Integer,
        field_name -> Text,
        old_value -> Nullable<Text>,
        new_value -> Nullable<Text>,
        created_at -> Text,
    }
}

// ============================================================================
// Notifications
// ============================================================================

diesel::table! {
    notifications (id) {
        id -> Integer,
        user_id -> Integer,
        lead_id -> Nullable<Integer>,
        message -> Text,
        notification_type -> Text,
        is_read -> Bool,
        sound_enabled -> Bool,
        created_at -> Text,
    }
}

diesel::joinable!(lead_assignments -> leads (lead_id));
diesel::joinable!(lead_activities -> leads (lead_id));
diesel::joinable!(lead_social_profiles -> leads (lead_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    pipeline_stages,
    leads,
    lead_assignments,
    assignment_settings,
    lead_notes,
    lead_stage_history,
    bd_assignment_history,
    lead_assignment_history,
    lead_activities,
    lead_social_profiles,
    lead_edit_changes,
    notifications,
);

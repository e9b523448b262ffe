//! Workspace initialization for leadflow
//!
//! `leadflow init` creates `.leadflow/` with a config file, the database and
//! the default pipeline, and optionally a protected admin account.

use crate::config::Config;
use crate::db::Database;
use crate::lifecycle::LeadEngine;
use crate::types::Role;
use colored::Colorize;
use std::fs;
use std::path::Path;

/// Initial admin created by `leadflow init --admin-name .. --admin-email ..`
#[derive(Debug, Clone)]
pub struct AdminSeed {
    pub name: String,
    pub email: String,
}

/// Initialize leadflow in the current directory
pub fn init_project(admin: Option<AdminSeed>) -> Result<(), String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Could not get current directory: {}", e))?;

    println!("\n{}", "Initializing leadflow...".cyan().bold());
    println!("   Directory: {}\n", cwd.display());

    let leadflow_dir = cwd.join(".leadflow");
    create_dir_if_missing(&leadflow_dir)?;

    let config_path = leadflow_dir.join("config.toml");
    write_file_if_missing(&config_path, &Config::default_toml(), ".leadflow/config.toml")?;
    let config = Config::load();

    let upload_dir = if config.storage.upload_dir.is_absolute() {
        config.storage.upload_dir.clone()
    } else {
        cwd.join(&config.storage.upload_dir)
    };
    create_dir_if_missing(&upload_dir)?;

    let db_path = leadflow_dir.join("leadflow.db");
    let existed = db_path.exists();
    let db = Database::open_at(&db_path, &config.database)
        .map_err(|e| format!("Could not open database: {}", e))?;
    if existed {
        println!("   {} .leadflow/leadflow.db (already exists)", "Skipping".yellow());
    } else {
        println!("   {} .leadflow/leadflow.db", "Creating".green());
    }

    let engine = LeadEngine::new(db, &config);
    let seeded = engine
        .seed_default_stages()
        .map_err(|e| format!("Could not create pipeline stages: {}", e))?;
    if seeded > 0 {
        println!("   {} {} pipeline stages", "Creating".green(), seeded);
    } else {
        println!("   {} pipeline stages (already configured)", "Skipping".yellow());
    }

    if let Some(admin) = admin {
        let existing = engine
            .list_users(Some(Role::Admin))
            .map_err(|e| format!("Could not read users: {}", e))?;
        if existing.iter().any(|u| u.email.eq_ignore_ascii_case(admin.email.trim())) {
            println!("   {} admin {} (already exists)", "Skipping".yellow(), admin.email);
        } else {
            let id = engine
                .create_user(&admin.name, &admin.email, Role::Admin, true)
                .map_err(|e| format!("Could not create admin: {}", e.user_message()))?;
            println!("   {} protected admin {} (id {})", "Creating".green(), admin.email, id);
        }
    }

    add_to_gitignore(&cwd)?;

    println!("\n{}", "leadflow initialized!".green().bold());
    println!("\nNext steps:");
    println!("  1. Add users with {}", "leadflow user add <name> <email> <role>".cyan());
    println!("  2. Start the API and sweeps with {}", "leadflow serve".cyan());
    println!("  3. Submit a lead with {}", "leadflow --as <id> lead submit ...".cyan());
    println!();

    Ok(())
}

fn create_dir_if_missing(path: &Path) -> Result<(), String> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Could not create {}: {}", path.display(), e))?;
        println!("   {} {}", "Creating".green(), path.display());
    }
    Ok(())
}

fn write_file_if_missing(path: &Path, content: &str, display_name: &str) -> Result<(), String> {
    if path.exists() {
        println!("   {} {} (already exists)", "Skipping".yellow(), display_name);
    } else {
        fs::write(path, content)
            .map_err(|e| format!("Could not write {}: {}", display_name, e))?;
        println!("   {} {}", "Creating".green(), display_name);
    }
    Ok(())
}

fn add_to_gitignore(cwd: &Path) -> Result<(), String> {
    let gitignore_path = cwd.join(".gitignore");
    let entry = ".leadflow/";

    if gitignore_path.exists() {
        let existing = fs::read_to_string(&gitignore_path)
            .map_err(|e| format!("Could not read .gitignore: {}", e))?;

        if existing.lines().any(|line| line.trim() == entry || line.trim() == ".leadflow") {
            return Ok(());
        }

        let new_content = format!("{}\n\n# leadflow database and uploads\n{}\n", existing.trim_end(), entry);
        fs::write(&gitignore_path, new_content)
            .map_err(|e| format!("Could not update .gitignore: {}", e))?;
        println!("   {} .gitignore (added .leadflow/)", "Updated".green());
    } else {
        let content = format!("# leadflow database and uploads\n{}\n", entry);
        fs::write(&gitignore_path, content)
            .map_err(|e| format!("Could not create .gitignore: {}", e))?;
        println!("   {} .gitignore", "Creating".green());
    }

    Ok(())
}

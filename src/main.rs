use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use leadflow::activities::ActivityInput;
use leadflow::init::AdminSeed;
use leadflow::notify::BroadcastHub;
use leadflow::scheduler::{self, Scheduler, SweepKind};
use leadflow::{
    ActivityType, Cents, Config, Database, LeadEngine, LeadError, LeadFields, LeadStatus, Role,
    CURRENT_SCHEMA,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "leadflow")]
#[command(author, version, about = "Lead review, round-robin assignment and BD pipeline")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Id of the user performing the action
    #[arg(long = "as", global = true)]
    actor: Option<i32>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create .leadflow/ with config, database and default stages
    Init {
        #[arg(long, requires = "admin_email")]
        admin_name: Option<String>,
        #[arg(long, requires = "admin_name")]
        admin_email: Option<String>,
    },

    /// Run the HTTP API and background sweeps
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Manage pipeline stages
    Stage {
        #[command(subcommand)]
        action: StageCommand,
    },

    /// Work with leads
    Lead {
        #[command(subcommand)]
        action: LeadCommand,
    },

    /// Lead activities
    Activity {
        #[command(subcommand)]
        action: ActivityCommand,
    },

    /// Run a sweep once, now
    Sweep {
        #[arg(value_parser = parse_sweep)]
        kind: SweepKind,
    },

    /// Show the acting user's notifications
    Notifications {
        #[arg(long)]
        unread: bool,
        /// Mark everything read afterwards
        #[arg(long)]
        mark_read: bool,
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show database location, schema version and row counts
    Status,

    /// Generate shell completions
    Completion {
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Add {
        name: String,
        email: String,
        #[arg(value_parser = parse_role)]
        role: Role,
        /// Protected users cannot be deleted
        #[arg(long)]
        protected: bool,
    },
    List {
        #[arg(long, value_parser = parse_role)]
        role: Option<Role>,
    },
    Delete {
        id: i32,
        /// User that takes over every lead and record
        #[arg(long)]
        replacement: Option<i32>,
    },
}

#[derive(Subcommand, Debug)]
enum StageCommand {
    Add {
        name: String,
        /// Hex colour, e.g. #17a2b8
        color: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Delete {
        id: i32,
    },
    /// Give every stage id in its new order
    Reorder {
        #[arg(required = true)]
        ids: Vec<i32>,
    },
}

#[derive(Subcommand, Debug)]
enum LeadCommand {
    Submit {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        company: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        domain: String,
        #[arg(long)]
        industry: Option<String>,
        /// Repeat for several services
        #[arg(long = "service")]
        services: Vec<String>,
        #[arg(long, default_value = "")]
        country: String,
        #[arg(long, default_value = "")]
        state: String,
        #[arg(long, default_value = "")]
        city: String,
        #[arg(long)]
        linkedin: Option<String>,
        #[arg(long)]
        twitter: Option<String>,
        #[arg(long)]
        facebook: Option<String>,
        #[arg(long)]
        website: Option<String>,
    },
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<LeadStatus>,
        #[arg(long, default_value = "50")]
        limit: i64,
        /// Show soft-deleted leads instead
        #[arg(long)]
        deleted: bool,
    },
    Show {
        id: i32,
    },
    Timeline {
        id: i32,
    },
    Accept {
        id: i32,
    },
    Reject {
        id: i32,
        comment: String,
    },
    Revert {
        id: i32,
        comment: String,
    },
    Resubmit {
        id: i32,
        comment: String,
    },
    /// Hand an accepted lead to BD sales (suggested user if --bd is omitted)
    AssignBd {
        id: i32,
        #[arg(long)]
        bd: Option<i32>,
        #[arg(long)]
        note: Option<String>,
    },
    MoveStage {
        id: i32,
        stage: i32,
    },
    /// Give a lead under review to another manager (admin)
    Reassign {
        id: i32,
        manager: i32,
        reason: String,
    },
    DealAmount {
        id: i32,
        /// Decimal with at most two fraction digits, e.g. 1200.50
        #[arg(value_parser = parse_amount)]
        amount: Cents,
    },
    Attach {
        id: i32,
        file: PathBuf,
    },
    Delete {
        id: i32,
    },
    Restore {
        id: i32,
    },
    /// Permanently remove a lead and its history
    Purge {
        id: i32,
    },
}

#[derive(Subcommand, Debug)]
enum ActivityCommand {
    Add {
        lead: i32,
        #[arg(value_parser = parse_activity_type)]
        kind: ActivityType,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_parser = parse_when)]
        due: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_when)]
        remind: Option<DateTime<Utc>>,
    },
    List {
        lead: i32,
    },
    Toggle {
        lead: i32,
        id: i32,
    },
    Delete {
        lead: i32,
        id: i32,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    Role::parse(s).ok_or_else(|| format!("unknown role '{}' (admin, manager, marketer, bd_sales)", s))
}

fn parse_status(s: &str) -> Result<LeadStatus, String> {
    LeadStatus::parse(s).ok_or_else(|| format!("unknown status '{}'", s))
}

fn parse_activity_type(s: &str) -> Result<ActivityType, String> {
    ActivityType::parse(s).ok_or_else(|| format!("unknown activity type '{}'", s))
}

fn parse_amount(s: &str) -> Result<Cents, String> {
    s.parse().map_err(|e: LeadError| e.user_message())
}

fn parse_sweep(s: &str) -> Result<SweepKind, String> {
    match s {
        "deadlines" => Ok(SweepKind::Deadlines),
        "reminders" => Ok(SweepKind::Reminders),
        _ => Err(format!("unknown sweep '{}' (deadlines, reminders)", s)),
    }
}

/// RFC 3339, "YYYY-MM-DD HH:MM" or "YYYY-MM-DD", all UTC
fn parse_when(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M") {
        return Ok(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("'{}' is not a date or time", s))
}

fn main() {
    let args = Args::parse();
    let config = Config::load();
    init_logging(&config, args.verbose);

    if let Err(e) = run(args, config) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("leadflow=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn open_engine(config: &Config) -> Result<LeadEngine, String> {
    let db = Database::open(&config.database).map_err(|e| format!("Could not open database: {}", e))?;
    Ok(LeadEngine::new(db, config))
}

fn user_error(e: LeadError) -> String {
    tracing::debug!(error = %e, "command failed");
    e.user_message()
}

fn require_actor(actor: Option<i32>) -> Result<i32, String> {
    actor.ok_or_else(|| "this command needs --as <user-id>".to_string())
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Could not encode output: {}", e),
        }
    } else {
        human();
    }
}

fn done(json: bool, message: &str) {
    emit(json, &serde_json::json!({ "ok": true }), || println!("{}", message.green()));
}

fn run(args: Args, config: Config) -> Result<(), String> {
    let json = args.json;
    let actor = args.actor;

    match args.command {
        Command::Init { admin_name, admin_email } => {
            let admin = match (admin_name, admin_email) {
                (Some(name), Some(email)) => Some(AdminSeed { name, email }),
                _ => None,
            };
            leadflow::init::init_project(admin)
        }

        Command::Serve { port } => serve(config, port),

        Command::Status => {
            let engine = open_engine(&config)?;
            status(engine.db(), json)
        }

        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Args::command(), "leadflow", &mut std::io::stdout());
            Ok(())
        }

        Command::User { action } => {
            let engine = open_engine(&config)?;
            run_user(&engine, actor, json, action)
        }

        Command::Stage { action } => {
            let engine = open_engine(&config)?;
            run_stage(&engine, json, action)
        }

        Command::Lead { action } => {
            let engine = open_engine(&config)?;
            run_lead(&engine, actor, json, action)
        }

        Command::Activity { action } => {
            let engine = open_engine(&config)?;
            run_activity(&engine, actor, json, action)
        }

        Command::Sweep { kind } => {
            let engine = open_engine(&config)?;
            let report = scheduler::run_once(&engine, kind, &CancellationToken::new()).map_err(user_error)?;
            emit(json, &report, || {
                println!("{} sweep: {}", kind.name().cyan(), report);
            });
            Ok(())
        }

        Command::Notifications { unread, mark_read, limit } => {
            let engine = open_engine(&config)?;
            let user = require_actor(actor)?;
            let rows = if unread {
                engine.unread_notifications(user)
            } else {
                engine.notifications(user, limit)
            }
            .map_err(user_error)?;
            emit(json, &rows, || {
                if rows.is_empty() {
                    println!("No notifications.");
                }
                for n in &rows {
                    let marker = if n.is_read { " ".normal() } else { "●".yellow() };
                    println!("{} {} [{}] {}", marker, n.created_at.dimmed(), n.notification_type, n.message);
                }
            });
            if mark_read {
                engine.mark_all_read(user).map_err(user_error)?;
            }
            Ok(())
        }
    }
}

fn status(db: &Database, json: bool) -> Result<(), String> {
    let path = Database::db_path();
    let history = db.schema_history().map_err(user_error)?;
    let summary = db.summary().map_err(user_error)?;
    let report = serde_json::json!({
        "database": path.display().to_string(),
        "schema": {
            "name": CURRENT_SCHEMA.name,
            "version": CURRENT_SCHEMA.version_string(),
            "features": CURRENT_SCHEMA.features,
        },
        "history": history,
        "summary": summary,
    });
    emit(json, &report, || {
        println!("{} {}", "Database:".bold(), path.display());
        println!("{} {}", "Schema:  ".bold(), CURRENT_SCHEMA);
        for stored in &history {
            println!("   - v{} {} {}", stored.version, stored.name, stored.introduced_at.dimmed());
        }
        println!("{} {}", "Users:   ".bold(), summary.total_users);
        println!("{} {}", "Leads:   ".bold(), summary.total_leads);
        println!("{} {}", "Pending: ".bold(), summary.pending_assignments);
        println!("{} {}", "Stages:  ".bold(), summary.total_stages);
    });
    Ok(())
}

fn serve(config: Config, port: Option<u16>) -> Result<(), String> {
    let port = port.unwrap_or(config.server.port);
    let hub = Arc::new(BroadcastHub::default());
    let engine = Arc::new(open_engine(&config)?.with_push(hub.clone()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Could not start runtime: {}", e))?;

    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::start(engine.clone(), cancel.clone());

        let server = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || leadflow::serve::start_server(engine, hub, port, cancel))
        };

        eprintln!("\n{}", "leadflow".green().bold());
        eprintln!("   API: http://localhost:{}/api", port);
        eprintln!("   Press Ctrl+C to stop\n");

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "could not listen for Ctrl+C");
                }
                tracing::info!("shutting down");
            }
            _ = cancel.cancelled() => {}
        }
        cancel.cancel();
        scheduler.shutdown().await;
        match server.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("Server error: {}", e)),
            Err(e) => Err(format!("Server task failed: {}", e)),
        }
    })
}

fn run_user(engine: &LeadEngine, actor: Option<i32>, json: bool, action: UserCommand) -> Result<(), String> {
    match action {
        UserCommand::Add { name, email, role, protected } => {
            let id = engine.create_user(&name, &email, role, protected).map_err(user_error)?;
            emit(json, &serde_json::json!({ "id": id }), || {
                println!("{} user {} ({}) as {}", "Created".green(), id, name, role.label());
            });
        }
        UserCommand::List { role } => {
            let users = engine.list_users(role).map_err(user_error)?;
            emit(json, &users, || {
                for u in &users {
                    let role = Role::parse(&u.role).map(|r| r.label()).unwrap_or(u.role.as_str());
                    let lock = if u.is_protected { " (protected)".dimmed().to_string() } else { String::new() };
                    println!("{:>4}  {:<24} {:<32} {}{}", u.id, u.name, u.email, role.cyan(), lock);
                }
            });
        }
        UserCommand::Delete { id, replacement } => {
            engine
                .delete_user(require_actor(actor)?, id, replacement)
                .map_err(user_error)?;
            done(json, &format!("Deleted user {}", id));
        }
    }
    Ok(())
}

fn run_stage(engine: &LeadEngine, json: bool, action: StageCommand) -> Result<(), String> {
    match action {
        StageCommand::Add { name, color, description } => {
            let id = engine
                .create_stage(&name, &color, description.as_deref())
                .map_err(user_error)?;
            emit(json, &serde_json::json!({ "id": id }), || {
                println!("{} stage {} ({})", "Created".green(), id, name);
            });
        }
        StageCommand::List => {
            let stages = engine.list_stages().map_err(user_error)?;
            emit(json, &stages, || {
                for s in &stages {
                    println!("{:>2}. [{:>3}] {} {}", s.position, s.id, s.name, s.color.dimmed());
                }
            });
        }
        StageCommand::Delete { id } => {
            engine.delete_stage(id).map_err(user_error)?;
            done(json, &format!("Deleted stage {}", id));
        }
        StageCommand::Reorder { ids } => {
            engine.reorder_stages(&ids).map_err(user_error)?;
            done(json, "Stages reordered");
        }
    }
    Ok(())
}

fn run_lead(engine: &LeadEngine, actor: Option<i32>, json: bool, action: LeadCommand) -> Result<(), String> {
    match action {
        LeadCommand::Submit {
            name,
            email,
            company,
            phone,
            domain,
            industry,
            services,
            country,
            state,
            city,
            linkedin,
            twitter,
            facebook,
            website,
        } => {
            let fields = LeadFields {
                full_name: name,
                email,
                phone,
                company,
                domain,
                industry,
                services,
                country,
                state,
                city,
                linkedin,
                twitter,
                facebook,
                website,
            };
            let id = engine.submit_lead(require_actor(actor)?, &fields).map_err(user_error)?;
            let lead = engine.get_lead(id).map_err(user_error)?;
            emit(json, &lead, || {
                let manager = lead
                    .current_manager_id
                    .map(|m| format!("manager {}", m))
                    .unwrap_or_else(|| "no manager available".to_string());
                println!("{} lead {} ({})", "Submitted".green(), id, manager);
            });
        }
        LeadCommand::List { status, limit, deleted } => {
            let leads = if deleted {
                engine.deleted_leads()
            } else {
                engine.list_leads(status, limit)
            }
            .map_err(user_error)?;
            emit(json, &leads, || {
                for l in &leads {
                    println!("{:>5}  {:<12} {:<28} {}", l.id, status_colored(&l.status), l.company, l.full_name.dimmed());
                }
            });
        }
        LeadCommand::Show { id } => {
            let lead = engine.get_lead(id).map_err(user_error)?;
            let assignments = engine.assignments(id).map_err(user_error)?;
            let profiles = engine.social_profiles(id).map_err(user_error)?;
            let shown = serde_json::json!({
                "lead": lead,
                "assignments": assignments,
                "social_profiles": profiles,
            });
            emit(json, &shown, || {
                println!("{} {}  {}", format!("Lead {}", lead.id).bold(), lead.company, status_colored(&lead.status));
                println!("   Contact:  {} <{}> {}", lead.full_name, lead.email, lead.phone);
                println!("   Location: {}, {}, {}", lead.city, lead.state, lead.country);
                if !lead.services().is_empty() {
                    println!("   Services: {}", lead.services().join(", "));
                }
                for p in &profiles {
                    println!("   {:<9} {}", format!("{}:", p.platform), p.url);
                }
                if let Some(m) = lead.current_manager_id {
                    println!("   Manager:  {}", m);
                }
                if let (Some(bd), Some(stage)) = (lead.assigned_bd_id, lead.current_stage_id) {
                    println!("   BD:       {} (stage {})", bd, stage);
                }
                if let Some(amount) = lead.deal_amount() {
                    println!("   Deal:     {}", amount);
                }
                for a in &assignments {
                    println!("   - {} manager {} until {} [{}]", a.assigned_at.dimmed(), a.manager_id, a.deadline_at, a.status);
                }
            });
        }
        LeadCommand::Timeline { id } => {
            let entries = engine.timeline(id).map_err(user_error)?;
            emit(json, &entries, || {
                for e in &entries {
                    println!(
                        "{} {:<12} {}",
                        e.at.dimmed(),
                        e.actor_name.as_deref().unwrap_or("System").cyan(),
                        e.summary
                    );
                }
            });
        }
        LeadCommand::Accept { id } => {
            engine.accept_lead(id, require_actor(actor)?).map_err(user_error)?;
            done(json, &format!("Lead {} accepted", id));
        }
        LeadCommand::Reject { id, comment } => {
            engine.reject_lead(id, require_actor(actor)?, &comment).map_err(user_error)?;
            done(json, &format!("Lead {} rejected", id));
        }
        LeadCommand::Revert { id, comment } => {
            engine.revert_lead(id, require_actor(actor)?, &comment).map_err(user_error)?;
            done(json, &format!("Lead {} reverted", id));
        }
        LeadCommand::Resubmit { id, comment } => {
            engine.resubmit_lead(id, require_actor(actor)?, &comment).map_err(user_error)?;
            done(json, &format!("Lead {} resubmitted", id));
        }
        LeadCommand::AssignBd { id, bd, note } => {
            let actor = require_actor(actor)?;
            let bd = match bd {
                Some(bd) => bd,
                None => engine
                    .peek_suggested_bd()
                    .map_err(user_error)?
                    .ok_or_else(|| "there are no BD sales users to assign".to_string())?,
            };
            engine.assign_bd(id, actor, bd, note.as_deref()).map_err(user_error)?;
            done(json, &format!("Lead {} assigned to BD user {}", id, bd));
        }
        LeadCommand::MoveStage { id, stage } => {
            engine.move_stage(id, require_actor(actor)?, stage).map_err(user_error)?;
            done(json, &format!("Lead {} moved to stage {}", id, stage));
        }
        LeadCommand::Reassign { id, manager, reason } => {
            engine
                .reassign_manager(id, require_actor(actor)?, manager, &reason)
                .map_err(user_error)?;
            done(json, &format!("Lead {} reassigned to manager {}", id, manager));
        }
        LeadCommand::DealAmount { id, amount } => {
            engine
                .update_deal_amount(id, require_actor(actor)?, amount)
                .map_err(user_error)?;
            done(json, &format!("Lead {} deal amount set to {}", id, amount));
        }
        LeadCommand::Attach { id, file } => {
            let bytes = std::fs::read(&file).map_err(|e| format!("Could not read {}: {}", file.display(), e))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let path = engine
                .attach_file(id, require_actor(actor)?, &bytes, &name)
                .map_err(user_error)?;
            emit(json, &serde_json::json!({ "path": path }), || {
                println!("{} {}", "Stored".green(), path);
            });
        }
        LeadCommand::Delete { id } => {
            engine.soft_delete_lead(id, require_actor(actor)?).map_err(user_error)?;
            done(json, &format!("Lead {} deleted", id));
        }
        LeadCommand::Restore { id } => {
            engine.restore_lead(id, require_actor(actor)?).map_err(user_error)?;
            done(json, &format!("Lead {} restored", id));
        }
        LeadCommand::Purge { id } => {
            engine.purge_lead(id, require_actor(actor)?).map_err(user_error)?;
            done(json, &format!("Lead {} purged", id));
        }
    }
    Ok(())
}

fn run_activity(engine: &LeadEngine, actor: Option<i32>, json: bool, action: ActivityCommand) -> Result<(), String> {
    match action {
        ActivityCommand::Add {
            lead,
            kind,
            title,
            description,
            due,
            remind,
        } => {
            let input = ActivityInput {
                activity_type: kind,
                title,
                description,
                due_at: due,
                reminder_at: remind,
            };
            let id = engine
                .add_activity(lead, require_actor(actor)?, &input)
                .map_err(user_error)?;
            emit(json, &serde_json::json!({ "id": id }), || {
                println!("{} {} {}", "Added".green(), kind.label(), id);
            });
        }
        ActivityCommand::List { lead } => {
            let rows = engine.activities(lead).map_err(user_error)?;
            emit(json, &rows, || {
                for a in &rows {
                    let check = if a.completed_at.is_some() { "[x]" } else { "[ ]" };
                    println!(
                        "{:>4} {} {:<12} {}",
                        a.id,
                        check,
                        a.activity_type,
                        a.title.as_deref().or(a.description.as_deref()).unwrap_or("")
                    );
                }
            });
        }
        ActivityCommand::Toggle { lead, id } => {
            let completed = engine
                .toggle_activity(lead, id, require_actor(actor)?)
                .map_err(user_error)?;
            emit(json, &serde_json::json!({ "completed": completed }), || {
                println!("Activity {} is now {}", id, if completed { "completed" } else { "open" });
            });
        }
        ActivityCommand::Delete { lead, id } => {
            engine
                .delete_activity(lead, id, require_actor(actor)?)
                .map_err(user_error)?;
            done(json, &format!("Activity {} deleted", id));
        }
    }
    Ok(())
}

fn status_colored(status: &str) -> colored::ColoredString {
    match LeadStatus::parse(status) {
        Some(LeadStatus::Accepted) => status.green(),
        Some(LeadStatus::Rejected) => status.red(),
        Some(LeadStatus::Resubmitted) => status.yellow(),
        _ => status.normal(),
    }
}

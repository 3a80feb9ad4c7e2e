//! Maintenance commands run against the AgentHub database.

use std::env;

use agenthub_server::{
    app::{is_valid_email, normalize_email, now_iso},
    config::{resolve_database_url, LogFormat},
    db,
    logging::init_logging,
    permissions::Role,
};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "agenthub-admin", version, about = "AgentHub maintenance commands")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete spent login codes and old closed chat sessions
    Cleanup {
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,

        /// Closed sessions idle for longer than this are removed
        #[arg(long, default_value_t = 90)]
        days: i64,
    },

    /// Print every column of the public schema
    DumpSchema,

    /// Create a super admin, or promote an existing account
    CreateSuperAdmin {
        #[arg(short, long)]
        email: String,

        #[arg(short, long, default_value = "")]
        name: String,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Invalid(String),
}

const MAX_RETENTION_DAYS: i64 = 36_500;

/// Sessions whose last message is older than the returned timestamp are stale.
fn cleanup_cutoff(now: DateTime<Utc>, days: i64) -> String {
    (now - Duration::days(days.clamp(0, MAX_RETENTION_DAYS))).to_rfc3339()
}

async fn cleanup(pool: &PgPool, dry_run: bool, days: i64) -> Result<(), CliError> {
    let now = now_iso();
    let cutoff = cleanup_cutoff(Utc::now(), days);
    let otp_filter = "used = true OR expires_at < $1";
    let session_filter = "status = 'closed' AND last_message_at < $1";

    if dry_run {
        let otps = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) FROM otp_codes WHERE {otp_filter}"))
            .bind(&now)
            .fetch_one(pool)
            .await?;
        let sessions = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(1) FROM chat_sessions WHERE {session_filter}"
        ))
        .bind(&cutoff)
        .fetch_one(pool)
        .await?;
        println!("would delete {otps} login codes and {sessions} closed sessions (older than {days} days)");
        return Ok(());
    }

    let otps = sqlx::query(&format!("DELETE FROM otp_codes WHERE {otp_filter}"))
        .bind(&now)
        .execute(pool)
        .await?
        .rows_affected();
    // Only the last rate-limit window matters.
    sqlx::query("DELETE FROM otp_requests WHERE created_at < $1")
        .bind(cleanup_cutoff(Utc::now(), 1))
        .execute(pool)
        .await?;
    let sessions = sqlx::query(&format!("DELETE FROM chat_sessions WHERE {session_filter}"))
        .bind(&cutoff)
        .execute(pool)
        .await?
        .rows_affected();
    info!(otps, sessions, days, "cleanup finished");
    println!("deleted {otps} login codes and {sessions} closed sessions");
    Ok(())
}

async fn dump_schema(pool: &PgPool) -> Result<(), CliError> {
    let rows = sqlx::query(
        "SELECT table_name, column_name, data_type, is_nullable \
         FROM information_schema.columns WHERE table_schema = 'public' \
         ORDER BY table_name, ordinal_position",
    )
    .fetch_all(pool)
    .await?;

    let mut current = String::new();
    for row in rows {
        let table: String = row.try_get("table_name")?;
        let column: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        let nullable: String = row.try_get("is_nullable")?;
        if table != current {
            println!("\n{table}");
            current = table;
        }
        let null_marker = if nullable == "YES" { " null" } else { "" };
        println!("  {column:<24} {data_type}{null_marker}");
    }
    Ok(())
}

async fn create_super_admin(pool: &PgPool, email: &str, name: &str) -> Result<(), CliError> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(CliError::Invalid(format!("invalid email: {email}")));
    }
    let now = now_iso();
    let id: String = sqlx::query_scalar(
        "INSERT INTO admin_users (id, email, full_name, role, partner_id, organisation_id, active, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, NULL, NULL, true, $5, $5) \
         ON CONFLICT (email) DO UPDATE SET \
            role = EXCLUDED.role, partner_id = NULL, organisation_id = NULL, active = true, \
            full_name = CASE WHEN EXCLUDED.full_name = '' THEN admin_users.full_name ELSE EXCLUDED.full_name END, \
            updated_at = EXCLUDED.updated_at \
         RETURNING id",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&email)
    .bind(name.trim())
    .bind(Role::SuperAdmin.as_str())
    .bind(&now)
    .fetch_one(pool)
    .await?;
    info!(%id, %email, "super admin ready");
    println!("{email} is a super admin ({id})");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    let database_url = resolve_database_url(&|key: &str| {
        env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    });
    let pool = db::connect(&database_url).await?;

    match cli.command {
        Commands::Cleanup { dry_run, days } => cleanup(&pool, dry_run, days).await,
        Commands::DumpSchema => dump_schema(&pool).await,
        Commands::CreateSuperAdmin { email, name } => {
            db::migrate(&pool).await?;
            create_super_admin(&pool, &email, &name).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "agenthub_server=debug,agenthub_admin=debug" } else { "warn" };
    init_logging(LogFormat::Pretty, level);

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

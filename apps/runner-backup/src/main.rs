use clap::{Parser, Subcommand};
use runner_backup_v2::{BackupKind, JobStatus, JobType, MigrationDirection, RetentionClass};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod commands;
mod settings;

#[derive(Parser)]
#[command(name = "atlas-backup", about = "Backup, restore and migrate an Atlas server's data")]
struct Args {
    /// Path to backup.toml (defaults to <server root>/backup.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "SERVER_ROOT")]
    server_root: Option<PathBuf>,

    /// Recorded on every job this invocation creates (defaults to $USER).
    #[arg(long, global = true, value_name = "NAME")]
    actor: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Capture a backup.
    Create {
        #[arg(long, default_value = "full")]
        kind: BackupKind,

        #[arg(long, default_value = "daily")]
        retention: RetentionClass,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        detach: bool,
    },
    /// Restore a successful backup over the live data.
    Restore {
        backup_id: Uuid,

        /// Categories to restore (defaults to everything the backup holds).
        #[arg(long)]
        scope: Option<BackupKind>,

        /// Skip the full safety snapshot taken before anything is replaced.
        #[arg(long)]
        no_snapshot: bool,

        #[arg(long)]
        detach: bool,
    },
    /// Show a backup's manifest without extracting it.
    Preview {
        backup_id: Uuid,

        /// Only list entries of these categories.
        #[arg(long)]
        scope: Option<BackupKind>,
    },
    /// Check every member of a backup against its manifest.
    Verify { backup_id: Uuid },
    /// Export the whole data set as a migration bundle.
    Export {
        #[arg(long)]
        detach: bool,
    },
    /// Apply a migration bundle over the whole data set.
    Import {
        bundle: PathBuf,

        #[arg(long)]
        no_snapshot: bool,

        #[arg(long)]
        detach: bool,
    },
    /// List jobs, newest first.
    List {
        #[arg(long = "type", default_value = "backup")]
        job_type: JobType,

        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long)]
        kind: Option<BackupKind>,

        #[arg(long)]
        retention: Option<RetentionClass>,

        #[arg(long)]
        backup_id: Option<Uuid>,

        #[arg(long)]
        direction: Option<MigrationDirection>,

        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show one job of any type.
    Get { id: Uuid },
    /// Prune expired backups (all classes unless one is given).
    Retention { class: Option<RetentionClass> },
    /// Repair job records and leftovers after an unclean stop.
    Reconcile,
    /// Show which job holds the writer lock.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = settings::resolve_cli_settings(args.config, args.server_root)?;
    let actor = settings::normalize_optional(args.actor).unwrap_or_else(settings::default_actor);
    let engine = commands::open_engine(&settings).await?;

    match args.cmd {
        Cmd::Create {
            kind,
            retention,
            name,
            detach,
        } => commands::create(&engine, kind, retention, name, actor, detach).await,
        Cmd::Restore {
            backup_id,
            scope,
            no_snapshot,
            detach,
        } => commands::restore(&engine, backup_id, scope, actor, !no_snapshot, detach).await,
        Cmd::Preview { backup_id, scope } => commands::preview(&engine, backup_id, scope).await,
        Cmd::Verify { backup_id } => commands::verify(&engine, backup_id).await,
        Cmd::Export { detach } => commands::export(&engine, actor, detach).await,
        Cmd::Import {
            bundle,
            no_snapshot,
            detach,
        } => commands::import(&engine, bundle, actor, !no_snapshot, detach).await,
        Cmd::List {
            job_type,
            status,
            kind,
            retention,
            backup_id,
            direction,
            limit,
        } => {
            commands::list(
                &engine,
                job_type,
                commands::ListFilter {
                    status,
                    kind,
                    retention,
                    backup_id,
                    direction,
                    limit,
                },
            )
            .await
        }
        Cmd::Get { id } => commands::get(&engine, id).await,
        Cmd::Retention { class } => commands::retention(&engine, class).await,
        Cmd::Reconcile => commands::reconcile(&engine).await,
        Cmd::Status => commands::status(&engine),
    }
}

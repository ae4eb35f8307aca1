use std::error::Error;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use engine::{
    DirKv, Engine, EngineError, JsonDirPersistence, LinkIssue, LinkedPairDraft,
    TransactionKind, reverse_balance,
};
use uuid::Uuid;

mod settings;

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Maintenance utilities for the Tally ledger store")]
struct Cli {
    /// Settings file, without extension (also read from `TALLY_SETTINGS`).
    #[arg(long, env = "TALLY_SETTINGS", default_value = "settings")]
    settings: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the protection layer status as JSON.
    Status,
    Backups(Backups),
    /// Record a transfer between two accounts.
    Transfer(TransferArgs),
    /// Delete a transaction together with its linked partner.
    DeleteTransaction { id: String },
    /// Delete an account no transaction refers to.
    DeleteAccount { id: String },
    /// List transactions whose pairing is broken.
    CheckLinks,
}

#[derive(Args, Debug)]
struct Backups {
    #[command(subcommand)]
    command: BackupsCommand,
}

#[derive(Subcommand, Debug)]
enum BackupsCommand {
    List,
    /// Replace the whole store with a backup and save it.
    Restore { id: Uuid },
    Prune,
}

#[derive(Args, Debug)]
struct TransferArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    /// Amount in minor units (cents).
    #[arg(long)]
    amount: i64,
    #[arg(long)]
    description: Option<String>,
}

fn build_engine(settings: &settings::Settings) -> Result<Engine, EngineError> {
    let persistence = JsonDirPersistence::open(&settings.data.dir)?;
    let store = persistence.load()?;
    Engine::builder()
        .store(store)
        .kv_store(DirKv::open(&settings.backup.dir)?)
        .persistence(persistence)
        .config(settings.engine.clone())
        .build()
}

fn report(err: EngineError) -> Box<dyn Error + Send + Sync> {
    if err.is_unrecoverable() {
        tracing::error!(
            "in-memory state is no longer trustworthy, nothing was saved: reload from the files in the data directory"
        );
    }
    err.into()
}

/// Fails when `check-links` found anything, so the process exits non-zero.
fn links_intact(issues: &[LinkIssue]) -> Result<(), Box<dyn Error + Send + Sync>> {
    if issues.is_empty() {
        return Ok(());
    }
    Err(format!("{} broken links", issues.len()).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let settings = settings::Settings::new(&cli.settings)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "tally={level},engine={level}",
            level = settings.app.level
        ))
        .with_writer(std::io::stderr)
        .init();

    let engine = build_engine(&settings)?;

    match cli.command {
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&engine.get_status())?);
        }
        Command::Backups(Backups {
            command: BackupsCommand::List,
        }) => {
            println!("{}", serde_json::to_string_pretty(&engine.list_backups())?);
        }
        Command::Backups(Backups {
            command: BackupsCommand::Restore { id },
        }) => {
            engine.restore_from_backup(id).await.map_err(report)?;
            // Mark every table so the restored state reaches the data files.
            engine
                .execute_with_snapshot(
                    "save_restored",
                    |store| {
                        Box::pin(async move {
                            let names: Vec<String> =
                                store.table_names().map(ToString::to_string).collect();
                            for name in names {
                                store.mark_dirty(&name);
                            }
                            Ok(())
                        })
                    },
                    &format!("save tables restored from backup {id}"),
                )
                .await
                .map_err(report)?;
            println!("restored backup {id}");
        }
        Command::Backups(Backups {
            command: BackupsCommand::Prune,
        }) => {
            let removed = engine.prune_old_backups()?;
            println!("pruned {removed} backups");
        }
        Command::Transfer(args) => {
            let (debit, credit) = engine
                .create_linked_pair(LinkedPairDraft {
                    kind: TransactionKind::Transfer,
                    from_account_id: args.from,
                    to_account_id: args.to,
                    amount: args.amount,
                    occurred_at: Utc::now(),
                    description: args.description,
                })
                .await
                .map_err(report)?;
            println!("created {debit} -> {credit}");
        }
        Command::DeleteTransaction { id } => {
            let removed = engine
                .delete_transaction(&id, reverse_balance)
                .await
                .map_err(report)?;
            for tx in removed {
                println!("deleted {} ({} on {})", tx.id, tx.amount, tx.account_id);
            }
        }
        Command::DeleteAccount { id } => {
            let removed = engine.delete_account(&id).await.map_err(report)?;
            println!("deleted account {}", removed.id);
        }
        Command::CheckLinks => {
            let issues = engine.check_link_integrity().await;
            println!("{}", serde_json::to_string_pretty(&issues)?);
            links_intact(&issues)?;
        }
    }

    Ok(())
}

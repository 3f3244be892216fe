use anyhow::{Context, Result, anyhow};
use changeledger::{DurabilityMode, LedgerClient, LedgerConfig, LedgerStats, ObjectType};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledger-tool")]
#[command(about = "Operator tooling for a changeledger data directory")]
struct Cli {
    /// Directory holding the WAL and snapshot
    #[arg(long, env = "CHANGELEDGER_DATA_DIR")]
    data_dir: PathBuf,

    #[arg(long, default_value = "sync")]
    durability: DurabilityMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Row counts and sequence position
    Stats,
    /// Live changes at or above a change number
    List {
        #[arg(long, default_value_t = 0)]
        from: i64,
        #[arg(long = "type")]
        object_type: Option<ObjectType>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Changes without a sent mark
    Unsent {
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Change-number windows used by the windowed unsent scan
    Windows,
    /// Mark change numbers sent
    MarkSent { change_numbers: Vec<i64> },
    /// Write a snapshot and truncate the WAL
    Checkpoint,
    /// Delete every change, sent mark and processed mark
    Purge {
        #[arg(long)]
        yes: bool,
    },
    /// Drop row versions no transaction can see anymore
    Vacuum,
}

#[derive(Serialize)]
struct Summary {
    current_change_number: i64,
    minimum_change_number: i64,
    count: u64,
    unsent: u64,
    #[serde(flatten)]
    ledger: LedgerStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = LedgerConfig::new()
        .data_dir(&cli.data_dir)
        .durability(cli.durability);
    let client = LedgerClient::open(config)
        .await
        .with_context(|| format!("Failed to open ledger at '{}'", cli.data_dir.display()))?;

    match cli.command {
        Command::Stats => print_json(&summary(&client).await?),
        Command::List {
            from,
            object_type,
            limit,
        } => {
            let changes = client.list_changes(from, object_type, limit).await?;
            print_json(&changes)
        }
        Command::Unsent { limit } => {
            let conn = client.connect().await?;
            let unsent = conn.unsent().list_unsent_messages_windowed(limit, None).await?;
            print_json(&unsent)
        }
        Command::Windows => {
            let conn = client.connect().await?;
            print_json(&conn.unsent().plan_windows().await?)
        }
        Command::MarkSent { change_numbers } => mark_sent(&client, &change_numbers).await,
        Command::Checkpoint => {
            client.db().checkpoint().await.context("Checkpoint failed")?;
            println!("Checkpoint written to {}", cli.data_dir.display());
            Ok(())
        }
        Command::Purge { yes } => {
            if !yes {
                return Err(anyhow!("Refusing to purge without --yes"));
            }
            let mut conn = client.connect().await?;
            let removed = conn.changes().delete_all_changes().await?;
            println!("Purged {} changes", removed);
            Ok(())
        }
        Command::Vacuum => {
            let removed = client.db().vacuum().await;
            println!("Removed {} row versions", removed);
            Ok(())
        }
    }
}

async fn summary(client: &LedgerClient) -> Result<Summary> {
    let mut conn = client.connect().await?;
    let changes = conn.changes();
    let current_change_number = changes.get_current_change_number().await?;
    let minimum_change_number = changes.get_minimum_change_number().await?;
    let count = changes.get_count().await?;
    let unsent = conn.unsent().count_unsent().await?;
    Ok(Summary {
        current_change_number,
        minimum_change_number,
        count,
        unsent,
        ledger: client.db().stats().await,
    })
}

async fn mark_sent(client: &LedgerClient, change_numbers: &[i64]) -> Result<()> {
    if change_numbers.is_empty() {
        return Err(anyhow!("At least one change number is required"));
    }

    let mut conn = client.connect().await?;
    conn.begin().await?;
    let mut written = 0;
    for &change_number in change_numbers {
        if conn
            .sent_messages()
            .register_message_sent(change_number)
            .await
            .with_context(|| format!("Failed to mark change {} sent", change_number))?
        {
            written += 1;
        }
    }
    conn.commit().await?;

    println!(
        "Marked {} of {} change numbers sent",
        written,
        change_numbers.len()
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{}", rendered);
    Ok(())
}

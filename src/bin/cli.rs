use std::collections::HashSet;
use std::sync::Arc;
use pointsync::engine::allocator;
use pointsync::{sdk, Collection, Fields};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Print one collection.
    Get { collection: String },
    /// Replace a collection with a JSON array.
    Set { collection: String, value: String },
    /// Shallow-merge a JSON object into one account.
    Patch { id: String, fields: String },
    /// Add an account, allocating an access code if it has none.
    Add { account: String },
    /// Remove an account.
    Remove { id: String },
    /// Import a JSON array of accounts.
    Import { accounts: String },
    /// Re-issue every student and parent access code (admin only).
    Reallocate { requester_id: String },
    /// Print a fresh code not held by any account.
    GenCode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let api = sdk::open(&cli.data_dir).await?;

    match cli.command {
        Commands::Get { collection } => {
            let snapshot = api.snapshot().await?;
            let value = snapshot
                .get(&collection)
                .ok_or_else(|| anyhow::anyhow!("unknown collection {}", collection))?;
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        Commands::Set { collection, value } => {
            let value: Collection = serde_json::from_str(&value)?;
            api.replace_collection(&collection, value).await?;
            println!("OK");
        }
        Commands::Patch { id, fields } => {
            let fields: Fields = serde_json::from_str(&fields)?;
            api.patch_account(&id, fields).await?;
            println!("OK");
        }
        Commands::Add { account } => {
            let account: Value = serde_json::from_str(&account)?;
            api.add_account(account).await?;
            println!("OK");
        }
        Commands::Remove { id } => {
            api.remove_account(&id).await?;
            println!("OK");
        }
        Commands::Import { accounts } => {
            let accounts: Vec<Value> = serde_json::from_str(&accounts)?;
            let count = api.import_accounts(accounts).await?;
            println!("OK {}", count);
        }
        Commands::Reallocate { requester_id } => {
            let count = api.reallocate_codes(&requester_id).await?;
            println!("OK {}", count);
        }
        Commands::GenCode => {
            let snapshot = api.snapshot().await?;
            let users: Vec<Arc<Value>> = snapshot.get(pointsync::USERS).cloned().unwrap_or_default();
            let excluded: HashSet<String> = allocator::codes_in_use(&users);
            println!("{}", allocator::generate_code(&mut rand::thread_rng(), &excluded)?);
        }
    }

    Ok(())
}

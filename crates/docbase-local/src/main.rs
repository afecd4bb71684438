mod config;

use std::sync::Arc;

use clap::Parser;
use docbase_core::{Document, Plugin, Registry, WriteOptions};
use docbase_local::{FileStore, Timestamps};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let dir = config.effective_data_dir();
    info!("Data dir: {}", dir.display());

    let registry = Registry::new();
    let plugins: Vec<Arc<dyn Plugin>> =
        vec![Arc::new(Timestamps::new()), Arc::new(FileStore::new(&dir))];
    let collection = registry.create(config.collection.clone(), plugins).await?;

    let result = run(&collection, config.command).await;

    for error in registry.close().await {
        warn!("{}", error);
    }
    result
}

async fn run(collection: &docbase_core::Collection, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { json } => {
            let doc = Document::from_value(serde_json::from_str(&json)?)?;
            let stored = collection.put(doc, WriteOptions::default()).await?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        Command::Get { id } => match collection.get(&id).await? {
            Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
            None => anyhow::bail!("Document \"{}\" not found in {}", id, collection.name()),
        },
        Command::List => {
            let docs = collection.get_all().await?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        Command::Delete { id } => {
            collection.delete(&id, WriteOptions::default()).await?;
            info!("Deleted {} from {}", id, collection.name());
        }
        Command::Clear => {
            collection.clear().await?;
            info!("Cleared {}", collection.name());
        }
    }
    Ok(())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Configuration for the docbase-local command line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "docbase-local")]
#[command(about = "Read and write documents in a file-backed docbase collection")]
pub struct Config {
    /// Base directory for collection data
    #[arg(long, env = "DOCBASE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Collection to operate on
    #[arg(long, short, default_value = "default", env = "DOCBASE_COLLECTION")]
    pub collection: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a document given as a JSON object with an "id" field
    Put {
        /// Document JSON, e.g. '{"id":"1","title":"Buy milk"}'
        json: String,
    },
    /// Print one document
    Get { id: String },
    /// Print every document
    List,
    /// Delete one document
    Delete { id: String },
    /// Delete every document
    Clear,
}

impl Config {
    /// Get the effective data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docbase")
                .join("collections")
        })
    }
}

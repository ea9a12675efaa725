// Operator tool for inspecting and editing a quire storage set

use clap::{Parser, Subcommand};
use log::{error, info};
use quire_core::{BlobRecord, HistoryFilter, OpError, PeerStorageClient, PeerStorageOptions};
use quire_store::{default_registry, rocksdb_storages};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Inspect and edit CRDT document storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Storage set description (JSON). Overrides --data
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// RocksDB root directory used when no config is given
    #[arg(short, long, global = true, default_value = "quire_data")]
    data: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Last change timestamp of every document
    Timestamps,

    /// Squash and show a document
    Get {
        doc_id: String,

        /// Write the document binary to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Append an update binary to a document
    Push {
        doc_id: String,

        /// File holding a yrs v1 update
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        editor: Option<String>,
    },

    /// Delete a document with its pending updates
    Delete { doc_id: String },

    /// List history entries, newest first
    History {
        doc_id: String,

        /// Only entries strictly older than this timestamp
        #[arg(short, long)]
        before: Option<i64>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Revert a document to a history entry
    Rollback {
        doc_id: String,
        timestamp: i64,

        #[arg(short, long)]
        editor: Option<String>,
    },

    /// List live blobs
    Blobs,

    /// Store a file as a blob
    PutBlob {
        key: String,

        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Delete a blob
    DeleteBlob {
        key: String,

        /// Remove now instead of marking for release
        #[arg(short, long)]
        permanently: bool,
    },

    /// Remove soft-deleted blobs past retention
    ReleaseBlobs,

    /// Sync clocks recorded for a peer
    Clocks {
        peer: String,

        /// Show clocks pushed to the peer instead of received from it
        #[arg(short, long)]
        pushed: bool,
    },
}

fn print(value: serde_json::Value) {
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{text}"),
        Err(e) => error!("Failed to render output: {e}"),
    }
}

fn read_file(path: &PathBuf) -> Result<Vec<u8>, OpError> {
    std::fs::read(path).map_err(|e| OpError::Config(format!("{}: {e}", path.display())))
}

async fn run(client: &PeerStorageClient, command: Commands) -> Result<(), OpError> {
    match command {
        Commands::Timestamps => {
            print(json!(client.get_doc_timestamps().await?));
        }
        Commands::Get { doc_id, output } => {
            let Some(doc) = client.get_doc(&doc_id).await? else {
                print(json!(null));
                return Ok(());
            };
            if let Some(path) = output {
                std::fs::write(&path, &doc.bin)
                    .map_err(|e| OpError::Config(format!("{}: {e}", path.display())))?;
                info!("Wrote {} bytes to {}", doc.bin.len(), path.display());
            }
            print(json!({
                "doc_id": doc.doc_id,
                "timestamp": doc.timestamp,
                "editor": doc.editor,
                "size": doc.bin.len(),
            }));
        }
        Commands::Push {
            doc_id,
            file,
            editor,
        } => {
            let bin = read_file(&file)?;
            client.push_doc_update(&doc_id, bin, editor).await?;
        }
        Commands::Delete { doc_id } => {
            client.delete_doc(&doc_id).await?;
        }
        Commands::History {
            doc_id,
            before,
            limit,
        } => {
            let filter = HistoryFilter { before, limit };
            print(json!(client.list_history(&doc_id, Some(filter)).await?));
        }
        Commands::Rollback {
            doc_id,
            timestamp,
            editor,
        } => {
            client.rollback_doc(&doc_id, timestamp, editor).await?;
        }
        Commands::Blobs => {
            print(json!(client.list_blobs().await?));
        }
        Commands::PutBlob { key, file, mime } => {
            let data = read_file(&file)?;
            client
                .set_blob(BlobRecord {
                    key,
                    size: data.len() as u64,
                    data,
                    mime,
                    created_at: quire_core::model::now_millis(),
                })
                .await?;
        }
        Commands::DeleteBlob { key, permanently } => {
            client.delete_blob(&key, permanently).await?;
        }
        Commands::ReleaseBlobs => {
            let released = client.release_blobs().await?;
            print(json!({ "released": released.count }));
        }
        Commands::Clocks { peer, pushed } => {
            let clocks = if pushed {
                client.get_peer_pushed_clocks(&peer).await?
            } else {
                client.get_peer_clocks(&peer).await?
            };
            print(json!(clocks));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let options = match &cli.config {
        Some(path) => match PeerStorageOptions::from_file(path) {
            Ok(options) => options,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => rocksdb_storages(&cli.data),
    };

    let client = PeerStorageClient::new(options, default_registry());
    if let Err(e) = client.connect().await {
        error!("Failed to connect storages: {e}");
        return ExitCode::FAILURE;
    }

    let result = run(&client, cli.command).await;
    if let Err(e) = client.disconnect().await {
        error!("Failed to disconnect storages: {e}");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

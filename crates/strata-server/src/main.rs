use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use strata_storage::erasure::DEFAULT_BLOCK_SIZE;
use strata_storage::erasure::objects::DEFAULT_MIN_PART_SIZE;
use strata_storage::{ErasureObjects, MultipartConfig, NsLockMap, StorageAPI, XlStorage};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Erasure coded object store with S3-style multipart uploads")]
struct Cli {
    /// Comma separated disk directories
    #[arg(long, env = "STRATA_DISKS", value_delimiter = ',', required = true)]
    disks: Vec<PathBuf>,

    /// Erasure block size in bytes
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Smallest size allowed for every part but the last
    #[arg(long, default_value_t = DEFAULT_MIN_PART_SIZE)]
    min_part_size: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a bucket on every disk
    MakeBucket { bucket: String },
    /// Upload a local file as a multipart upload
    Upload {
        bucket: String,
        key: String,
        file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MIN_PART_SIZE as u64)]
        part_size: u64,
    },
    /// Write an object, or a byte range of it, to stdout
    Cat {
        bucket: String,
        key: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
    },
    /// List pending multipart uploads
    ListUploads {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long, default_value = "")]
        key_marker: String,
        #[arg(long, default_value = "")]
        upload_id_marker: String,
        #[arg(long, default_value = "")]
        delimiter: String,
        #[arg(long, default_value_t = 1000)]
        max_uploads: i32,
    },
    /// List the committed parts of an upload
    ListParts {
        bucket: String,
        key: String,
        upload_id: String,
        #[arg(long, default_value_t = 0)]
        part_number_marker: i32,
        #[arg(long, default_value_t = 1000)]
        max_parts: i32,
    },
    /// Abort a multipart upload
    Abort {
        bucket: String,
        key: String,
        upload_id: String,
    },
}

async fn open_object_layer(cli: &Cli) -> anyhow::Result<ErasureObjects> {
    let mut disks: Vec<Arc<dyn StorageAPI>> = Vec::with_capacity(cli.disks.len());
    for path in &cli.disks {
        let disk = XlStorage::new(path.clone())
            .await
            .with_context(|| format!("failed to open disk {}", path.display()))?;
        disks.push(Arc::new(disk));
    }

    let config = MultipartConfig {
        min_part_size: cli.min_part_size,
        ..MultipartConfig::default()
    };
    let objects = ErasureObjects::new(disks, cli.block_size, config, Arc::new(NsLockMap::new()))
        .await
        .context("failed to initialise erasure set")?;
    Ok(objects)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::from_default_env().add_directive("strata=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let objects = open_object_layer(&cli).await?;
    debug!(disks = cli.disks.len(), command = ?cli.command, "dispatching");

    match cli.command {
        Command::MakeBucket { bucket } => commands::make_bucket(&objects, &bucket).await,
        Command::Upload {
            bucket,
            key,
            file,
            part_size,
        } => commands::upload(&objects, &bucket, &key, &file, part_size).await,
        Command::Cat {
            bucket,
            key,
            offset,
            length,
        } => commands::cat(&objects, &bucket, &key, offset, length).await,
        Command::ListUploads {
            bucket,
            prefix,
            key_marker,
            upload_id_marker,
            delimiter,
            max_uploads,
        } => {
            commands::list_uploads(
                &objects,
                &bucket,
                &prefix,
                &key_marker,
                &upload_id_marker,
                &delimiter,
                max_uploads,
            )
            .await
        }
        Command::ListParts {
            bucket,
            key,
            upload_id,
            part_number_marker,
            max_parts,
        } => {
            commands::list_parts(&objects, &bucket, &key, &upload_id, part_number_marker, max_parts)
                .await
        }
        Command::Abort {
            bucket,
            key,
            upload_id,
        } => commands::abort(&objects, &bucket, &key, &upload_id).await,
    }
}

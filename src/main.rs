use std::{path::PathBuf, process::ExitCode, time::Duration};

use ::tracing::{error, info, info_span, Instrument};
use anyhow::{anyhow, Context, Result};
use blob_lease::{BatchOperations, BlobClient, ClientConfig, LeaseLock};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;

mod tracing;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List objects under a prefix
    Ls {
        prefix: String,
        #[arg(long, help = "Maximum number of entries to list")]
        max: Option<usize>,
    },
    /// Print the decoded contents of an object
    Cat { path: String },
    /// Upload a local file, compressing it when that saves space
    Put { path: String, file: PathBuf },
    /// Delete objects
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Move objects from an inbox path to the matching archive path
    Archive {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Run a command while holding a lease lock
    Lock {
        name: String,
        #[arg(long, help = "Age after which an existing lock is considered stale")]
        expiry_ms: Option<u64>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match ClientConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {:?}", err);
            return ExitCode::from(2);
        }
    };
    setup_tracing(&config);

    let client = match config.build_client() {
        Ok(client) => client,
        Err(err) => {
            error!("Error creating blob client: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    let span = info_span!("blobctl");
    match run(cli.command, &config, client).instrument(span).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:?}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &ClientConfig, client: BlobClient) -> Result<ExitCode> {
    let batch = BatchOperations::new(client.clone());
    match command {
        Command::Ls { prefix, max } => {
            let entries = batch
                .list_prefix(&prefix, max.unwrap_or(config.list_max_keys))
                .await?;
            for entry in entries {
                println!(
                    "{}\t{}\t{}",
                    entry.last_modified.to_rfc3339(),
                    entry.size,
                    entry.path
                );
            }
        }
        Command::Cat { path } => {
            let blob = client.read(&path).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&blob.body).await?;
            stdout.flush().await?;
        }
        Command::Put { path, file } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("unable to read {}", file.display()))?;
            let res = client.write(&path, data).await?;
            info!(path = %path, size_bytes = res.size_bytes, encoding = ?res.encoding, "uploaded");
        }
        Command::Rm { paths } => {
            let deleted = batch.delete_many(&paths, config.concurrency).await?;
            info!(deleted, "deleted files");
        }
        Command::Archive { paths } => {
            let archived = batch.archive_many(&paths, config.concurrency).await?;
            for path in archived {
                println!("{path}");
            }
        }
        Command::Lock {
            name,
            expiry_ms,
            command,
        } => {
            let expiry = expiry_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.lock_expiry());
            return run_locked(LeaseLock::new(client), &name, expiry, &command)
                .await
                .map(ExitCode::from);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_locked(
    lock: LeaseLock,
    name: &str,
    expiry: Duration,
    command: &[String],
) -> Result<u8> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("no command given"))?;
    let lease = lock.acquire(name, expiry).await?;

    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("unable to run {program}"));

    let held_ms = (Utc::now() - lease.acquired_at()).num_milliseconds();
    // release even when the command could not be started
    if let Err(err) = lease.release().await {
        error!(name, held_ms, "unable to release lock: {:?}", err);
    }
    let status = status?;
    info!(name, held_ms, %status, "command finished under lock");
    // killed by a signal
    Ok(status
        .code()
        .map_or(1, |code| u8::try_from(code).unwrap_or(1)))
}

#[cfg(all(test, unix))]
mod tests {
    use blob_lease::{BlobStorageConfig, DEFAULT_LOCK_EXPIRY};
    use blob_store::DiskStorageConfig;

    use super::*;

    #[tokio::test]
    async fn test_exit_code_survives_failed_release() {
        let dir = tempfile::tempdir().unwrap();
        let client = BlobClient::from_config(
            &BlobStorageConfig {
                s3: None,
                disk: Some(DiskStorageConfig {
                    path: dir.path().to_str().unwrap().to_string(),
                }),
            },
            6,
        )
        .unwrap();
        let lock_file = dir.path().join("job.lock");
        // the child replaces the record with one owned by someone else
        let command: Vec<String> = [
            "sh",
            "-c",
            "printf %s \"$2\" > \"$1\"; exit 3",
            "sh",
            lock_file.to_str().unwrap(),
            r#"{"date":"2030-01-01T00:00:00Z","owner":"other"}"#,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let code = run_locked(
            LeaseLock::new(client.clone()),
            "job",
            DEFAULT_LOCK_EXPIRY,
            &command,
        )
        .await
        .unwrap();
        assert_eq!(code, 3);
        // the foreign record is left in place
        assert!(client.read("job.lock").await.is_ok());
    }
}

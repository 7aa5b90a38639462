//! Binary entry point for the FlowKV demo CLI: a single-process bucket
//! exercised over `set`/`get`/`delete`, useful for smoke-testing the
//! engine without standing up a replication topology.
#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use flowkv::{Bucket, EngineConfig, StoredKey};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "flowkv-cli", version, about = "Single-process FlowKV smoke-test CLI")]
struct Cli {
    /// Partition (vbucket) id to operate against.
    #[arg(long, global = true, default_value_t = 0)]
    partition: u16,

    /// Number of partitions in the demo bucket.
    #[arg(long, global = true, default_value_t = 8)]
    num_vbuckets: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stores a value.
    Set {
        /// Key bytes (interpreted as UTF-8).
        key: String,
        /// Value bytes (interpreted as UTF-8).
        value: String,
    },
    /// Reads a value back.
    Get {
        /// Key bytes (interpreted as UTF-8).
        key: String,
    },
    /// Soft-deletes a key.
    Delete {
        /// Key bytes (interpreted as UTF-8).
        key: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = flowkv::logging::init_logging("flowkv=info") {
        eprintln!("warning: {e}");
    }

    let mut config = EngineConfig::balanced();
    config.num_vbuckets = cli.num_vbuckets;
    let bucket = Bucket::new("default", config);
    if let Err(e) = bucket.activate_all() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Set { key, value } => bucket
            .set(cli.partition, StoredKey::default_collection(key.into_bytes()), value.into_bytes(), 0, 0)
            .map(|stamp| println!("OK cas={} bySeqno={}", stamp.cas, stamp.by_seqno)),
        Command::Get { key } => bucket
            .get(cli.partition, &StoredKey::default_collection(key.into_bytes()))
            .map(|found| match found {
                Some(sv) => match sv.value() {
                    Some(v) => println!("{}", String::from_utf8_lossy(&v)),
                    None => println!("(tombstone)"),
                },
                None => println!("(not found)"),
            }),
        Command::Delete { key } => bucket
            .delete(cli.partition, &StoredKey::default_collection(key.into_bytes()))
            .map(|stamp| println!("OK cas={} bySeqno={}", stamp.cas, stamp.by_seqno)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

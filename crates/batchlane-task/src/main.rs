//! batchlane-task entrypoint
//!
//! Usage: batchlane-task <program> --filepath <file> ...
//!
//! Runs on a pool node. stdout is collected by the orchestrator as the
//! task's output; diagnostics go to stderr.

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};

use batchlane::clock::{Clock, SystemClock};
use batchlane::local::LocalDocumentStore;
use batchlane::logging;

use batchlane_task::args::{parse_flag, CommonArgs};
use batchlane_task::error::TaskResult;
use batchlane_task::etl::{self, PARTITION_FIELD};
use batchlane_task::node::{LogData, Sinks, TaskEnv};
use batchlane_task::{state_center, unpack};

#[derive(Parser)]
#[command(name = "batchlane-task")]
#[command(about = "Task programs run on batchlane pool nodes", version)]
struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    program: Program,
}

#[derive(Subcommand)]
enum Program {
    /// Print a banner and exit
    Hello,

    /// Mean latitude and longitude of a postal-code CSV
    StateCenter {
        #[command(flatten)]
        common: CommonArgs,

        /// Verify arguments and environment only
        #[arg(long, default_value = "n", value_parser = parse_flag, action = ArgAction::Set)]
        dryrun: bool,
    },

    /// Load a postal-code CSV into the document store
    CsvEtl {
        #[command(flatten)]
        common: CommonArgs,

        /// `file://` URI of the document database
        #[arg(long)]
        docdb_uri: String,

        #[arg(long)]
        docdb_key: String,

        #[arg(long, default_value = "zipdata")]
        collection: String,
    },

    /// List a zip or tar archive and upload its files
    Unpack {
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli.program) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn print_args(common: &CommonArgs, env: &TaskEnv) {
    println!("filepath:          {}", common.filepath.display());
    println!("storage_account:   {}", common.storage_account);
    println!("output_container:  {}", common.output_container);
    println!("logging_container: {}", common.logging_container);
    println!("idx:               {}", common.idx);
    println!("dev:               {}", common.dev);
    println!("job/task:          {}/{}", env.job_id, env.task_id);
    println!("epoch:             {}", env.start_epoch());
}

/// Sinks for a remote run, `None` in development
fn sinks_for(common: &CommonArgs, clock: Arc<dyn Clock>) -> TaskResult<Option<Sinks>> {
    if common.dev {
        return Ok(None);
    }
    Ok(Some(Sinks::open(common, clock)?))
}

fn run(program: Program) -> TaskResult<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let env = TaskEnv::from_env(clock.as_ref());

    match program {
        Program::Hello => {
            println!("Batch Task batchlane-task at {}", Utc::now());
            Ok(())
        }
        Program::StateCenter { common, dryrun } => {
            print_args(&common, &env);
            let sinks = if dryrun {
                println!("dryrun; not creating blob clients");
                None
            } else {
                sinks_for(&common, clock.clone())?
            };
            state_center::run(&common, dryrun, &env, clock.as_ref(), sinks.as_ref(), std::env::vars())?;
            Ok(())
        }
        Program::CsvEtl {
            common,
            docdb_uri,
            docdb_key,
            collection,
        } => {
            print_args(&common, &env);
            if common.dev {
                println!("dev mode; no result blob processing");
                return Ok(());
            }
            let sinks = sinks_for(&common, clock.clone())?;
            let uri = format!("{}/{}", docdb_uri.trim_end_matches('/'), collection);
            let store = LocalDocumentStore::from_uri(&uri, PARTITION_FIELD, &docdb_key)?;

            let input = fs::canonicalize(&common.filepath)?;
            let mut log = LogData::new();
            log.set("epoch", env.start_epoch());
            log.set("storage_account", common.storage_account.as_str());
            log.set("output_container", common.output_container.as_str());
            log.set("output_token", common.output_token.as_str());
            log.set("docdb_uri", docdb_uri.as_str());
            log.set("docdb_key", docdb_key.as_str());
            log.set("filepath", common.filepath.display().to_string());
            log.set("input_file", input.display().to_string());
            log.set("collection", collection.as_str());

            let text = fs::read_to_string(&input)?;
            etl::run(
                &text,
                &env,
                &store,
                sinks.as_ref().map(|s| &s.output),
                Path::new("."),
                &mut log,
            )?;
            Ok(())
        }
        Program::Unpack { common } => {
            print_args(&common, &env);
            let sinks = sinks_for(&common, clock)?;
            let file = fs::File::open(&common.filepath)?;
            let uploaded = unpack::run(file, &env, sinks.as_ref().map(|s| &s.output))?;
            tracing::info!(uploaded = uploaded.len(), "unpacked");
            Ok(())
        }
    }
}

//! batchlane CLI
//!
//! Entry point for the `batchlane` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};

use batchlane::clock::{Clock, SystemClock};
use batchlane::command::wrap_commands_in_shell;
use batchlane::config::{
    env_listing, host_config_path, overlay_from_assignments, set_path, BackendKind, ConfigError,
    Credentials, EffectiveConfig, Settings, REPO_CONFIG_FILE,
};
use batchlane::ids;
use batchlane::local::{self, LocalBatchService, LocalBlobStore, LocalDocumentStore};
use batchlane::logging;
use batchlane::mock::{MemoryBatchService, MemoryBlobStore, MemoryDocumentStore};
use batchlane::orchestrator::{
    delete_job_and_pool, exit, ExecutionPlan, ExecutionReport, Orchestrator, OrchestratorResult,
};
use batchlane::runlog::RunLog;
use batchlane::service::{BatchService, BlobStore, DocumentStore, Query};
use batchlane::signal::SignalHandler;
use batchlane::stager::BlobFilter;
use batchlane::taskgen::TemplateTaskGenerator;
use batchlane::Platform;

#[derive(Parser)]
#[command(name = "batchlane")]
#[command(about = "Stage inputs, run a pool of batch tasks and collect the results", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Repo config file (default: ./batchlane.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Config override, dotted.key=value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    set: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage files, run one task per input and collect outputs
    Submit(SubmitArgs),

    /// Delete a job and its pool
    Teardown {
        #[arg(long)]
        job: String,

        #[arg(long)]
        pool: String,
    },

    /// Blob storage commands
    Blobs {
        #[command(subcommand)]
        action: BlobsCommands,
    },

    /// Document store commands
    Docs {
        #[command(subcommand)]
        action: DocsCommands,
    },

    /// Print the service environment as shell exports
    Env {
        /// Show secret values
        #[arg(long)]
        reveal: bool,
    },

    /// Wrap commands in the node shell invocation
    Wrap {
        /// Node OS family: linux or windows
        #[arg(long, default_value = "linux")]
        platform: String,

        /// Commands to join (after --)
        #[arg(last = true, required = true)]
        commands: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(clap::Args)]
struct SubmitArgs {
    /// Pool name; a unique stamp is appended
    #[arg(long)]
    pool: String,

    /// Job name; a unique stamp is appended
    #[arg(long)]
    job: String,

    /// Task file uploaded to the task container (repeatable; the first is run)
    #[arg(long, required = true)]
    task: Vec<PathBuf>,

    /// Pool node count
    #[arg(long)]
    nodecount: Option<u32>,

    /// Task container
    #[arg(long)]
    ctask: Option<String>,

    /// Input container
    #[arg(long)]
    cin: Option<String>,

    /// Output container
    #[arg(long)]
    cout: Option<String>,

    /// Logging container
    #[arg(long)]
    clog: Option<String>,

    /// Job timeout in minutes
    #[arg(long)]
    timeout: Option<u64>,

    /// Local input file (repeatable)
    #[arg(long)]
    input: Vec<PathBuf>,

    /// Also process blobs in the input container ending with this suffix
    #[arg(long, conflicts_with = "input_glob")]
    input_suffix: Option<String>,

    /// Also process blobs in the input container matching this pattern
    #[arg(long)]
    input_glob: Option<String>,

    /// Directory for output streams and the run log
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// Delete job and pool when done
    #[arg(long)]
    teardown: bool,

    /// Tell tasks they run in a development environment
    #[arg(long)]
    dev: bool,

    /// Print the plan without calling any service
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum BlobsCommands {
    /// List containers, or the blobs of one container
    List { container: Option<String> },

    /// Upload files by basename
    Upload {
        container: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Download every blob of a container
    Download { container: String, dir: PathBuf },
}

#[derive(Subcommand)]
enum DocsCommands {
    /// Print matching documents
    Query {
        #[command(flatten)]
        collection: CollectionArgs,

        /// Field to filter on
        #[arg(long, requires = "value")]
        field: Option<String>,

        /// Value the field must equal (JSON, or a plain string)
        #[arg(long)]
        value: Option<String>,

        /// Maximum documents to print
        #[arg(long)]
        max: Option<usize>,
    },

    /// Delete every document of a collection
    DeleteAll {
        #[command(flatten)]
        collection: CollectionArgs,
    },
}

#[derive(clap::Args)]
struct CollectionArgs {
    #[arg(long, default_value = "zipdata")]
    collection: String,

    #[arg(long, default_value = "pk")]
    partition_key: String,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> OrchestratorResult<i32> {
    match cli.command {
        Commands::Submit(args) => run_submit(cli.config, &cli.set, args),
        Commands::Teardown { job, pool } => {
            let (settings, _) = load_config(cli.config, &cli.set, Value::Null)?;
            let credentials = Credentials::from_env()?;
            let services = Services::build(&settings, &credentials, Arc::new(SystemClock))?;
            delete_job_and_pool(services.batch.as_ref(), &job, &pool)?;
            println!("Deleted job {} and pool {}", job, pool);
            Ok(0)
        }
        Commands::Blobs { action } => {
            let (settings, _) = load_config(cli.config, &cli.set, Value::Null)?;
            let credentials = Credentials::from_env()?;
            let services = Services::build(&settings, &credentials, Arc::new(SystemClock))?;
            run_blobs(services, action)
        }
        Commands::Docs { action } => {
            let (settings, _) = load_config(cli.config, &cli.set, Value::Null)?;
            let credentials = Credentials::from_env()?;
            run_docs(&settings, &credentials, action)
        }
        Commands::Env { reveal } => {
            for entry in env_listing(|name| std::env::var(name).ok()) {
                println!("{}", entry.render(reveal));
            }
            Ok(0)
        }
        Commands::Wrap { platform, commands } => {
            let platform: Platform = platform.parse()?;
            println!("{}", wrap_commands_in_shell(platform, &commands)?);
            Ok(0)
        }
        Commands::Config => {
            let (_, config) = load_config(cli.config, &cli.set, Value::Null)?;
            println!("{}", config.to_json()?);
            Ok(0)
        }
    }
}

/// Merge the config layers; `flags` is applied on top of `--set`
fn load_config(
    repo_config: Option<PathBuf>,
    assignments: &[String],
    flags: Value,
) -> Result<(Settings, EffectiveConfig), ConfigError> {
    let mut overlay = overlay_from_assignments(assignments)?;
    if let Value::Object(map) = flags {
        for (path, value) in map {
            set_path(&mut overlay, &path, value);
        }
    }

    let repo_config = repo_config.unwrap_or_else(|| PathBuf::from(REPO_CONFIG_FILE));
    let config = EffectiveConfig::build(
        host_config_path().as_deref(),
        Some(repo_config.as_path()),
        Some(overlay),
    )?;
    Ok((config.settings()?, config))
}

/// Backends selected by `backend.kind`
struct Services {
    batch: Arc<dyn BatchService>,
    store: Arc<dyn BlobStore>,
}

impl Services {
    fn build(settings: &Settings, credentials: &Credentials, clock: Arc<dyn Clock>) -> OrchestratorResult<Self> {
        match settings.backend.kind {
            BackendKind::Local => {
                let root = &settings.backend.root;
                let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::open(
                    &local::storage_root(root),
                    &credentials.storage_account,
                    &credentials.storage_key,
                    clock,
                )?);
                let batch = Arc::new(LocalBatchService::open(&local::batch_root(root), store.clone())?);
                Ok(Self { batch, store })
            }
            BackendKind::Memory => Ok(Self {
                batch: Arc::new(MemoryBatchService::new()),
                store: Arc::new(MemoryBlobStore::new(
                    &credentials.storage_account,
                    &credentials.storage_key,
                    clock,
                )),
            }),
        }
    }
}

fn submit_flags(args: &SubmitArgs, credentials: Option<&Credentials>) -> Value {
    let mut flags = serde_json::Map::new();
    let mut put = |path: &str, value: Value| {
        flags.insert(path.to_string(), value);
    };

    if let Some(name) = args.task.first().and_then(|p| p.file_name()) {
        put("task.file", json!(name.to_string_lossy()));
    }
    if let Some(n) = args.nodecount {
        put("pool.node_count", json!(n));
    }
    for (path, value) in [
        ("containers.tasks", &args.ctask),
        ("containers.inputs", &args.cin),
        ("containers.outputs", &args.cout),
        ("containers.logs", &args.clog),
    ] {
        if let Some(v) = value {
            put(path, json!(v));
        }
    }
    if let Some(minutes) = args.timeout {
        put("job.timeout_minutes", json!(minutes));
    }
    if let Some(dir) = &args.outdir {
        put("output.dir", json!(dir));
    }
    if let Some(docdb) = credentials.and_then(|c| c.docdb.as_ref()) {
        put("task.extras.docdb_uri", json!(docdb.uri));
        put("task.extras.docdb_key", json!(docdb.key));
    }
    Value::Object(flags)
}

fn input_filter(args: &SubmitArgs) -> Option<BlobFilter> {
    if let Some(suffix) = &args.input_suffix {
        return Some(BlobFilter::Suffix(suffix.clone()));
    }
    args.input_glob.clone().map(BlobFilter::Glob)
}

fn run_submit(repo_config: Option<PathBuf>, assignments: &[String], args: SubmitArgs) -> OrchestratorResult<i32> {
    // Credentials are checked before anything touches a service
    let credentials = match Credentials::from_env() {
        Ok(credentials) => Some(credentials),
        Err(e) if args.dry_run => {
            tracing::debug!(error = %e, "dry run without credentials");
            None
        }
        Err(e) => return Err(e.into()),
    };

    let (settings, config) = load_config(repo_config, assignments, submit_flags(&args, credentials.as_ref()))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();
    let job_id = ids::job_id(&args.job, now);
    let pool_id = ids::pool_id(&args.pool, now);

    let mut plan = ExecutionPlan::new(&job_id, &pool_id, settings.clone());
    plan.task_files = args.task.clone();
    plan.inputs = args.input.clone();
    plan.existing_inputs = input_filter(&args);
    plan.output_dir = Some(settings.output.dir.clone());
    plan.teardown = args.teardown;
    plan.dev = args.dev;

    if args.dry_run {
        let pool = plan.pool_config(Vec::new())?;
        let summary = json!({
            "job_id": job_id,
            "pool_id": pool_id,
            "node_count": pool.node_count,
            "vm_size": pool.vm_size,
            "start_task": pool.start_task.map(|s| s.command_line),
            "task_files": plan.task_files,
            "inputs": plan.inputs,
            "task_template": settings.task.template.as_str(),
            "config": config.config,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(0);
    }
    let credentials = match credentials {
        Some(credentials) => credentials,
        None => Credentials::from_env()?,
    };

    let services = Services::build(&settings, &credentials, clock.clone())?;

    let signals = SignalHandler::new();
    if let Err(e) = signals.install() {
        tracing::warn!(error = %e, "could not install signal handler");
    }
    signals.state().set_active_job(Some(job_id.clone()));

    let orchestrator = Orchestrator::from_settings(services.batch, services.store, clock.clone(), &settings)
        .with_cancel_token(signals.token());
    let generator = TemplateTaskGenerator::new(settings.pool.platform, settings.task.template.clone());

    let mut log = RunLog::new(now)
        .with_config(&config.with_job_id(&job_id))
        .with_environment(&env_listing(|name| std::env::var(name).ok()));

    tracing::info!(job = %job_id, pool = %pool_id, "submitting");
    let result = orchestrator.execute(&plan, &generator, &mut log);
    signals.state().set_active_job(None);

    log.finish(clock.now(), result.as_ref().map(|_| ()));
    match log.write_to_dir(&settings.output.dir) {
        Ok(path) => println!("Run log: {}", path.display()),
        Err(e) => tracing::warn!(error = %e, "could not write run log"),
    }

    let report = result?;
    print_report(&report);
    Ok(if report.completion.failed_tasks().is_empty() {
        exit::SUCCESS
    } else {
        exit::TASKS_FAILED
    })
}

fn print_report(report: &ExecutionReport) {
    println!("Job {} on pool {}", report.job.job_id(), report.pool.pool_id);
    for status in &report.completion.statuses {
        let output = match report.outputs.get(&status.id) {
            Some(streams) => match streams.errors().next() {
                None => "output collected".to_string(),
                Some(e) => e.to_string(),
            },
            None => "no output".to_string(),
        };
        let exit = status
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<10} exit {:<4} {}", status.id, exit, output);
    }
    for path in &report.output_files {
        println!("  wrote {}", path.display());
    }
    println!(
        "{} task(s) in {}s over {} poll(s)",
        report.completion.statuses.len(),
        report.completion.elapsed.as_secs(),
        report.completion.polls
    );
}

fn run_blobs(services: Services, action: BlobsCommands) -> OrchestratorResult<i32> {
    let orchestrator = Orchestrator::new(services.batch, services.store, Arc::new(SystemClock));
    let store = orchestrator.store();
    match action {
        BlobsCommands::List { container: None } => {
            for name in store.list_containers()? {
                println!("{}", name);
            }
        }
        BlobsCommands::List {
            container: Some(container),
        } => {
            for blob in store.list_blobs(&container)? {
                println!("container: {}  blob: {}  size: {}", container, blob.name, blob.size);
            }
        }
        BlobsCommands::Upload { container, files } => {
            orchestrator.stager().ensure_container(&container)?;
            for resource in orchestrator.stager().upload_batch(&container, &files)? {
                println!("uploaded {} -> {}", resource.file_path, container);
            }
        }
        BlobsCommands::Download { container, dir } => {
            for path in orchestrator.download_container(&container, &dir)? {
                println!("downloaded {}", path.display());
            }
        }
    }
    Ok(0)
}

fn open_collection(
    settings: &Settings,
    credentials: &Credentials,
    args: &CollectionArgs,
) -> OrchestratorResult<Box<dyn DocumentStore>> {
    match settings.backend.kind {
        BackendKind::Memory => Ok(Box::new(MemoryDocumentStore::new(&args.partition_key))),
        BackendKind::Local => {
            let docdb = credentials.require_docdb()?;
            let uri = format!("{}/{}", docdb.uri.trim_end_matches('/'), args.collection);
            Ok(Box::new(LocalDocumentStore::from_uri(
                &uri,
                &args.partition_key,
                &docdb.key,
            )?))
        }
    }
}

fn run_docs(settings: &Settings, credentials: &Credentials, action: DocsCommands) -> OrchestratorResult<i32> {
    match action {
        DocsCommands::Query {
            collection,
            field,
            value,
            max,
        } => {
            let store = open_collection(settings, credentials, &collection)?;
            let query = match (field, value) {
                (Some(field), Some(value)) => Query::FieldEquals {
                    field,
                    value: serde_json::from_str(&value).unwrap_or(Value::String(value)),
                },
                _ => Query::All,
            };
            let docs = store.query(&query, max)?;
            for doc in &docs {
                println!("{}", serde_json::to_string_pretty(doc)?);
            }
            eprintln!("{} document(s)", docs.len());
        }
        DocsCommands::DeleteAll { collection } => {
            let store = open_collection(settings, credentials, &collection)?;
            let removed = store.delete_all()?;
            println!("deleted {} document(s) from {}", removed, collection.collection);
        }
    }
    Ok(0)
}

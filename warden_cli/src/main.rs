use warden_core::control::{ControlPlane, FileControlPlane, JobRecord, new_document_id};
use warden_core::job::{EngineKind, FuzzJob, JobKey, RunType, parse_target_ref};
use warden_core::session::{Session, SessionEnd};
use warden_core::storage::{self, LocalObjectStore, ObjectStore, paths};
use warden_core::{WardenConfig, WardenError, Workspace};

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// `EX_NOPERM` from sysexits.h.
const EXIT_PERMISSION_DENIED: u8 = 77;
const DEFAULT_CONFIG_FILE: &str = "warden.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config: Option<PathBuf>,
    #[clap(long, env = "WARDEN_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,
    #[clap(long, env = "ORG_ID", global = true)]
    org: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a fuzzing or regression job in this workspace (agent mode)
    Run {
        #[clap(long = "type", default_value = "fuzzing")]
        run_type: RunType,
        #[clap(long, default_value = "libfuzzer")]
        engine: EngineKind,
        /// Report status, crashes and corpus to the control plane
        #[clap(long)]
        update_db: bool,
        /// Extra arguments passed to the engine
        #[clap(long, default_value = "", allow_hyphen_values = true)]
        args: String,
        #[clap(long, env = "TARGET_ID")]
        target: Option<String>,
        #[clap(long, env = "JOB_ID", default_value = "")]
        job: String,
        #[clap(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Download and extract a target's corpus or seed
    Download {
        /// `target` or `org/target`
        target: String,
        what: Artifact,
        local_path: Option<PathBuf>,
    },
    #[clap(subcommand)]
    Create(CreateCommand),
    /// Print a document, or every document of a collection
    Get { resource: String },
}

#[derive(Subcommand, Debug)]
enum CreateCommand {
    Target {
        name: String,
        /// A tar.gz with the initial seed corpus
        #[clap(long)]
        seed: Option<PathBuf>,
    },
    Job {
        /// `target` or `org/target`
        target: String,
        fuzzer: PathBuf,
        /// Extra files packaged next to the fuzzer
        files: Vec<PathBuf>,
        #[clap(long = "type", default_value = "fuzzing")]
        run_type: RunType,
        #[clap(long, default_value = "libfuzzer")]
        engine: EngineKind,
        #[clap(long, default_value = "", allow_hyphen_values = true)]
        args: String,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Artifact {
    Corpus,
    Seed,
}

fn load_config(path: Option<&Path>) -> Result<WardenConfig, anyhow::Error> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path:?}");
            WardenConfig::load_from_file(path)
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                info!("Loading default configuration from {default_path:?}");
                WardenConfig::load_from_file(&default_path)
            } else {
                Ok(WardenConfig::default())
            }
        }
    }
}

fn require_org(org: Option<String>) -> Result<String, WardenError> {
    org.filter(|o| !o.is_empty()).ok_or_else(|| {
        WardenError::InvalidJob("organization is required (--org or ORG_ID)".to_string())
    })
}

/// Resolves `[org/]target`, falling back to the global org.
fn resolve_target(reference: &str, org: Option<String>) -> Result<(String, String), WardenError> {
    let (ref_org, target) = parse_target_ref(reference)?;
    let org = match ref_org {
        Some(org) => org,
        None => require_org(org)?,
    };
    Ok((org, target))
}

struct Backends {
    control: FileControlPlane,
    store: LocalObjectStore,
}

impl Backends {
    fn new(config: &WardenConfig, api_key: Option<String>) -> Self {
        let api_key = api_key.or_else(|| config.control_plane.api_key.clone());
        Self {
            control: FileControlPlane::new(&config.control_plane.root, api_key),
            store: LocalObjectStore::new(&config.storage.root),
        }
    }
}

/// Builds the session's job from `run` flags. The job id only counts with
/// `--update-db`; without it the run is local whatever `JOB_ID` says.
fn job_from_flags(
    org: Option<String>,
    target: Option<String>,
    job_id: String,
    engine: EngineKind,
    run_type: RunType,
    update_db: bool,
    args: String,
) -> Result<FuzzJob, WardenError> {
    let org_id = require_org(org)?;
    let target_id = target
        .filter(|t| !t.is_empty())
        .ok_or_else(|| WardenError::InvalidJob("target is required (--target or TARGET_ID)".to_string()))?;
    let job_id = if update_db {
        if job_id.is_empty() {
            return Err(WardenError::InvalidJob(
                "--update-db needs a job id (--job or JOB_ID)".to_string(),
            ));
        }
        job_id
    } else {
        String::new()
    };

    Ok(FuzzJob {
        org_id,
        target_id,
        job_id,
        engine,
        run_type,
        args,
        update_db,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    config: &WardenConfig,
    backends: &Backends,
    org: Option<String>,
    target: Option<String>,
    job_id: String,
    engine: EngineKind,
    run_type: RunType,
    update_db: bool,
    args: String,
    workspace: PathBuf,
) -> Result<(), WardenError> {
    let job = job_from_flags(org, target, job_id, engine, run_type, update_db, args)?;
    info!(
        "Starting {} {} job for {}/{}",
        job.engine, job.run_type, job.org_id, job.target_id
    );

    let mut session = Session::new(
        job,
        Workspace::new(workspace),
        config.session_settings(),
        &backends.control,
        &backends.store,
    );
    session.prepare().await?;
    match session.run().await? {
        SessionEnd::Completed(outcome) => info!("Job finished: {outcome}"),
        SessionEnd::Cancelled => info!("Job was cancelled, exiting"),
    }
    Ok(())
}

async fn download(
    backends: &Backends,
    org: Option<String>,
    target: &str,
    what: Artifact,
    local_path: Option<PathBuf>,
) -> Result<(), WardenError> {
    let (org_id, target_id) = resolve_target(target, org)?;
    backends.control.refresh_auth().await?;
    let (storage_path, default_dir) = match what {
        Artifact::Corpus => (paths::corpus(&org_id, &target_id), "corpus"),
        Artifact::Seed => (paths::seed(&org_id, &target_id), "seed"),
    };
    let dest = local_path.unwrap_or_else(|| PathBuf::from(default_dir));
    storage::download_and_extract(&backends.store, &storage_path, &dest).await?;
    println!("Downloaded {storage_path} to {}", dest.display());
    Ok(())
}

async fn create_target(
    backends: &Backends,
    org: Option<String>,
    name: &str,
    seed: Option<PathBuf>,
) -> Result<(), WardenError> {
    let org_id = require_org(org)?;
    backends.control.refresh_auth().await?;
    backends.control.create_target(&org_id, name).await?;
    if let Some(seed) = seed {
        info!("Uploading seed {}", seed.display());
        backends
            .store
            .upload_file(&seed, &paths::seed(&org_id, name))
            .await?;
    }
    println!("Created target {org_id}/{name}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn create_job(
    backends: &Backends,
    org: Option<String>,
    target: &str,
    fuzzer: PathBuf,
    files: Vec<PathBuf>,
    run_type: RunType,
    engine: EngineKind,
    args: String,
) -> Result<JobKey, WardenError> {
    let (org_id, target_id) = resolve_target(target, org)?;
    backends.control.refresh_auth().await?;
    let key = JobKey {
        org_id,
        target_id,
        job_id: new_document_id(),
    };

    let already_packaged = files.is_empty()
        && fuzzer
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(".tar.gz"));
    let tmp = tempfile::tempdir()
        .map_err(|e| WardenError::io("creating a temporary directory", e))?;
    let package = if already_packaged {
        fuzzer
    } else {
        let package = tmp.path().join("fuzzer.tar.gz");
        let mut all = vec![fuzzer];
        all.extend(files);
        storage::archive_files(&all, engine.binary_name(), &package).await?;
        package
    };

    info!("Uploading fuzzer");
    backends
        .store
        .upload_file(&package, &paths::fuzzer(&key))
        .await?;
    backends
        .control
        .create_job(&key, &JobRecord::queued(&key, engine, run_type, args))
        .await?;
    Ok(key)
}

async fn get(backends: &Backends, org: Option<String>, resource: &str) -> Result<(), WardenError> {
    let org_id = require_org(org)?;
    backends.control.refresh_auth().await?;
    for doc in backends.control.get_resource(&org_id, resource).await? {
        match serde_json::to_string_pretty(&doc) {
            Ok(json) => println!("{json}"),
            Err(e) => error!("Failed to render {resource}: {e}"),
        }
    }
    Ok(())
}

async fn run_cli(cli: Cli) -> Result<(), anyhow::Error> {
    let config = load_config(cli.config.as_deref())?;
    let backends = Backends::new(&config, cli.api_key);

    match cli.command {
        Command::Run {
            run_type,
            engine,
            update_db,
            args,
            target,
            job,
            workspace,
        } => {
            run_job(
                &config, &backends, cli.org, target, job, engine, run_type, update_db, args,
                workspace,
            )
            .await?
        }
        Command::Download {
            target,
            what,
            local_path,
        } => download(&backends, cli.org, &target, what, local_path).await?,
        Command::Create(CreateCommand::Target { name, seed }) => {
            create_target(&backends, cli.org, &name, seed).await?
        }
        Command::Create(CreateCommand::Job {
            target,
            fuzzer,
            files,
            run_type,
            engine,
            args,
        }) => {
            let key = create_job(
                &backends, cli.org, &target, fuzzer, files, run_type, engine, args,
            )
            .await?;
            println!("{}", key.job_id);
        }
        Command::Get { resource } => get(&backends, cli.org, &resource).await?,
    }
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<WardenError>() {
        Some(e) if e.is_permission_denied() => EXIT_PERMISSION_DENIED,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

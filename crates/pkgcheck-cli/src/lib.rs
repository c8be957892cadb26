//! Command surface for running package validations against a local `SQLite`
//! database.
//!
//! [`run_cli`] executes a parsed [`Cli`]; every command prints pretty JSON on
//! stdout. Diagnostics go to stderr through `tracing`, filtered by
//! [`LOG_FILTER_ENV`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use pkgcheck_core::{
    BadgeStatus, EnvSettings, EvaluationId, EvaluationRecord, ExpirationPolicy, PackageId,
    PackageRecord,
};
use pkgcheck_orchestrator::{
    EvaluationsApi, NpmRegistry, PackageInfoApi, QueueDispatcher, ValidationOrchestrator,
    ValidationRequest, DEFAULT_QUEUE, DEFAULT_REGISTRY_URL,
};
use pkgcheck_store_sqlite::{SqliteJobQueue, SqlitePackageStore};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the `tracing` filter directive.
pub const LOG_FILTER_ENV: &str = "PKGCHECK_LOG";

#[derive(Debug, Parser)]
#[command(name = "pkgcheck")]
#[command(about = "Package validation and caching CLI")]
pub struct Cli {
    #[arg(long, default_value = "./pkgcheck.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_QUEUE)]
    queue: String,

    #[arg(long, default_value_t = 5000)]
    confirm_timeout_ms: u64,

    #[arg(long, default_value = DEFAULT_REGISTRY_URL)]
    registry_url: String,

    #[arg(long, default_value_t = 10_000)]
    registry_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Validate(ValidateArgs),
    Evaluation {
        #[command(subcommand)]
        command: EvaluationCommand,
    },
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    Package {
        #[command(subcommand)]
        command: PackageCommand,
    },
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Package spec, `name` or `name@version`.
    #[arg(long, conflicts_with = "package_json", required_unless_present = "package_json")]
    name: Option<String>,
    /// Path to a `package.json` manifest.
    #[arg(long)]
    package_json: Option<PathBuf>,
    #[arg(long)]
    package_lock: Option<PathBuf>,
    #[arg(long)]
    yarn_lock: Option<PathBuf>,
    #[arg(long)]
    production: bool,
    #[arg(long)]
    force: bool,
    /// Path to a JSON rule set overriding the defaults.
    #[arg(long)]
    rule_set: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum EvaluationCommand {
    Show {
        #[arg(long)]
        cid: String,
    },
    Complete {
        #[arg(long)]
        cid: String,
        /// Path to the collected metadata snapshot.
        #[arg(long)]
        data: PathBuf,
    },
    Fail {
        #[arg(long)]
        cid: String,
        #[arg(long)]
        message: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    Take,
    List,
}

#[derive(Debug, Subcommand)]
pub enum PackageCommand {
    Show {
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct Badge {
    status: BadgeStatus,
    image: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationReport {
    evaluation: EvaluationRecord,
    package_info: Option<PackageRecord>,
    badge: Badge,
}

impl EvaluationReport {
    fn new(evaluation: EvaluationRecord, package_info: Option<PackageRecord>) -> Self {
        let status = BadgeStatus::of(package_info.as_ref(), Some(&evaluation));
        Self {
            evaluation,
            package_info,
            badge: Badge {
                status,
                image: status.image_key(),
            },
        }
    }
}

/// Installs the stderr `tracing` subscriber, honouring [`LOG_FILTER_ENV`].
///
/// # Errors
/// Returns an error for an unparsable filter or when a global subscriber is
/// already installed.
pub fn init_tracing() -> Result<()> {
    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid {LOG_FILTER_ENV} filter"))?,
        Err(_) => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes a parsed command against the database at `cli.db`.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, an input
/// file cannot be read, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqlitePackageStore::open(&cli.db)?;
    store.migrate()?;
    let queue = SqliteJobQueue::open(&cli.db)?;
    queue.migrate()?;

    let registry = NpmRegistry::new(
        cli.registry_url.clone(),
        Duration::from_millis(cli.registry_timeout_ms),
    );
    let package_info = PackageInfoApi::new(&store, &registry);
    let evaluations = EvaluationsApi::new(&store, &package_info);

    match cli.command {
        Command::Validate(args) => {
            let settings = EnvSettings;
            let policy = ExpirationPolicy::new(&store, &settings);
            let dispatcher = QueueDispatcher::new(&queue, cli.queue.clone())
                .with_confirm_timeout(Duration::from_millis(cli.confirm_timeout_ms));
            let orchestrator =
                ValidationOrchestrator::new(&package_info, &evaluations, &policy, &dispatcher);

            let request = ValidationRequest {
                package_name: args.name,
                package_json: read_optional(args.package_json.as_deref())?,
                package_lock: read_optional(args.package_lock.as_deref())?,
                yarn_lock: read_optional(args.yarn_lock.as_deref())?,
                is_production: args.production,
            };
            let rule_set = match args.rule_set.as_deref() {
                Some(path) => Some(read_json(path)?),
                None => None,
            };

            let evaluation = orchestrator.validate(&request, rule_set, args.force)?;
            info!(cid = %evaluation.id, "validation started");
            let package = package_info.get(evaluation.package_info_id)?;
            print_json(&EvaluationReport::new(evaluation, package))
        }
        Command::Evaluation { command } => match command {
            EvaluationCommand::Show { cid } => {
                let evaluation = require_evaluation(&evaluations, &cid)?;
                let package = package_info.get(evaluation.package_info_id)?;
                print_json(&EvaluationReport::new(evaluation, package))
            }
            EvaluationCommand::Complete { cid, data } => {
                let evaluation = require_evaluation(&evaluations, &cid)?;
                let data = read_json(&data)?;
                let evaluation = evaluations.evaluate(&evaluation, &data)?;
                let package = package_info.get(evaluation.package_info_id)?;
                print_json(&EvaluationReport::new(evaluation, package))
            }
            EvaluationCommand::Fail { cid, message } => {
                let cid = cid.parse::<EvaluationId>()?;
                let evaluation = evaluations.fail(cid, &message)?;
                let package = package_info.get(evaluation.package_info_id)?;
                print_json(&EvaluationReport::new(evaluation, package))
            }
        },
        Command::Jobs { command } => match command {
            JobsCommand::Take => print_json(&queue.take_next(&cli.queue)?),
            JobsCommand::List => print_json(&queue.list(&cli.queue)?),
        },
        Command::Package { command } => match command {
            PackageCommand::Show { id } => {
                let id = id.parse::<PackageId>()?;
                let record = package_info
                    .get(id)?
                    .ok_or_else(|| anyhow!("package info {id} not exists"))?;
                print_json(&record)
            }
        },
    }
}

fn require_evaluation(evaluations: &EvaluationsApi<'_>, cid: &str) -> Result<EvaluationRecord> {
    let cid = cid.parse::<EvaluationId>()?;
    evaluations
        .get(cid)?
        .ok_or_else(|| anyhow!("evaluation {cid} not exists"))
}

fn read_optional(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|path| {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    })
    .transpose()
}

fn read_json(path: &Path) -> Result<Value> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

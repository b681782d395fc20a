//! CLI subcommands: init, validate, plan, apply, destroy, refresh, status, unlock.
//!
//! Every command returns its process exit code: 0 on success or nothing to
//! do, 1 when some steps failed, were skipped or were cancelled. Errors
//! returned as [`EngineError`] were raised before any provider call and map
//! to exit code 2.

use crate::core::diff::{self, DiffInput, DiffMode};
use crate::core::error::EngineError;
use crate::core::executor::{self, CancelSignal, ExecuteOptions};
use crate::core::resolver::{self, DependencyGraph};
use crate::core::schema::SchemaRegistry;
use crate::core::state::StateStore;
use crate::core::types::*;
use crate::core::{parser, planner};
use crate::provider::{CommandProvider, Provider};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Declaration file, state directory and environment.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Path to terrane.yaml
    #[arg(short, long, default_value = "terrane.yaml")]
    pub file: PathBuf,

    /// State directory
    #[arg(long, default_value = "state")]
    pub state_dir: PathBuf,

    /// Environment (selects context overrides and state)
    #[arg(short, long)]
    pub env: Option<String>,
}

/// Execution overrides for commands that call the provider.
#[derive(Args, Debug, Clone, Default)]
pub struct ExecArgs {
    /// Maximum concurrent provider operations (overrides policy.parallelism)
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Provider program (overrides provider.command)
    #[arg(long)]
    pub provider_cmd: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new terrane project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate terrane.yaml: schema, references, cycles
    Validate {
        #[command(flatten)]
        target: Target,
    },

    /// Show the execution plan (diff desired vs recorded)
    Plan {
        #[command(flatten)]
        target: Target,

        /// Emit the plan report as JSON
        #[arg(long)]
        json: bool,

        /// Plan the teardown of every recorded resource
        #[arg(long)]
        destroy: bool,
    },

    /// Reconcile infrastructure to the declared topology
    Apply {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Delete every recorded resource
    Destroy {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Read recorded resources back from the provider and record drift
    Refresh {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Show recorded resources and held locks
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Environment
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Release locks left behind by a crashed run
    Unlock {
        /// Run token that holds the locks (see `status`)
        owner: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Environment
        #[arg(short, long)]
        env: Option<String>,
    },
}

/// Dispatch a CLI command; returns the process exit code.
pub async fn dispatch(cmd: Commands, cancel: CancelSignal) -> Result<i32, EngineError> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { target } => cmd_validate(&target),
        Commands::Plan {
            target,
            json,
            destroy,
        } => cmd_plan(&target, json, mode(destroy)),
        Commands::Apply { target, exec } => {
            let project = Project::load(&target)?;
            let provider = provider_for(&project.config, &exec)?;
            cmd_apply(&project, &target, &exec, DiffMode::Apply, provider, cancel).await
        }
        Commands::Destroy { target, exec } => {
            let project = Project::load(&target)?;
            let provider = provider_for(&project.config, &exec)?;
            cmd_apply(&project, &target, &exec, DiffMode::Destroy, provider, cancel).await
        }
        Commands::Refresh { target, exec } => {
            let project = Project::load(&target)?;
            let provider = provider_for(&project.config, &exec)?;
            cmd_refresh(&project, &target, provider).await
        }
        Commands::Status { state_dir, env } => cmd_status(&state_dir, env.as_deref()),
        Commands::Unlock {
            owner,
            state_dir,
            env,
        } => cmd_unlock(&state_dir, env.as_deref(), &owner),
    }
}

fn mode(destroy: bool) -> DiffMode {
    if destroy {
        DiffMode::Destroy
    } else {
        DiffMode::Apply
    }
}

/// A parsed, validated declaration with its graph and context.
struct Project {
    config: TerraneConfig,
    schemas: SchemaRegistry,
    resources: ResourceSet,
    graph: DependencyGraph,
    context: Context,
}

impl Project {
    fn load(target: &Target) -> Result<Self, EngineError> {
        let config = parser::parse_config_file(&target.file)?;
        let schemas = SchemaRegistry::with_overrides(&config.kinds);
        let resources = parser::build_resource_set(&config, &schemas)?;
        let graph = resolver::build_graph(&resources)?;
        let context = config.context_for(target.env.as_deref())?;
        tracing::debug!(
            file = %target.file.display(),
            resources = resources.len(),
            edges = graph.edge_count(),
            environment = %context.environment,
            "loaded declaration"
        );
        Ok(Self {
            config,
            schemas,
            resources,
            graph,
            context,
        })
    }

    fn open_state(&self, state_dir: &Path) -> Result<StateStore, EngineError> {
        Ok(StateStore::open(state_dir, &self.context.environment)?)
    }

    fn plan(&self, store: &StateStore, mode: DiffMode) -> Result<Plan, EngineError> {
        let records = store.records();
        let input = DiffInput {
            resources: &self.resources,
            graph: &self.graph,
            records: &records,
            schemas: &self.schemas,
            context: &self.context,
        };
        let changes = diff::compute_changes(&input, mode)?;
        planner::build_plan(
            &self.config.name,
            &self.context.environment,
            changes,
            &self.graph,
            &self.resources,
            &records,
        )
    }
}

/// The external provider program, from `--provider-cmd` or `provider.command`.
fn provider_for(config: &TerraneConfig, exec: &ExecArgs) -> Result<Arc<dyn Provider>, EngineError> {
    let provider = match &exec.provider_cmd {
        Some(cmd) => Some(CommandProvider::new(cmd.clone(), config.provider.args.clone())),
        None => CommandProvider::from_config(&config.provider),
    };
    provider
        .map(|p| Arc::new(p) as Arc<dyn Provider>)
        .ok_or_else(|| {
            EngineError::Usage(
                "no provider configured: set provider.command in terrane.yaml or pass --provider-cmd"
                    .to_string(),
            )
        })
}

fn env_name(env: Option<&str>) -> &str {
    env.unwrap_or(DEFAULT_ENVIRONMENT)
}

const TEMPLATE: &str = r#"version: "1.0"
name: my-topology
description: "Managed by terrane"

context:
  region: europe-west1

environments: {}

resources:
  - kind: network
    name: vpc
    attributes:
      name: main

policy:
  parallelism: 8
  operation_timeout_secs: 600
  tripwire: true

provider:
  command: ./provider.sh
"#;

fn cmd_init(path: &Path) -> Result<i32, EngineError> {
    let config_path = path.join("terrane.yaml");
    if config_path.exists() {
        return Err(EngineError::Usage(format!(
            "{} already exists",
            config_path.display()
        )));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| EngineError::Usage(format!("cannot create state dir: {}", e)))?;
    std::fs::write(&config_path, TEMPLATE)
        .map_err(|e| EngineError::Usage(format!("cannot write {}: {}", config_path.display(), e)))?;
    StateStore::open(&state_dir, DEFAULT_ENVIRONMENT)?.initialize()?;

    println!("Initialized terrane project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(0)
}

fn cmd_validate(target: &Target) -> Result<i32, EngineError> {
    let project = Project::load(target)?;
    println!(
        "OK: {} ({} resources, {} dependencies, environment {})",
        project.config.name,
        project.resources.len(),
        project.graph.edge_count(),
        project.context.environment
    );
    Ok(0)
}

fn cmd_plan(target: &Target, json: bool, mode: DiffMode) -> Result<i32, EngineError> {
    let project = Project::load(target)?;
    let store = project.open_state(&target.state_dir)?;
    let plan = project.plan(&store, mode)?;
    let report = planner::plan_report(&plan);

    if json {
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| EngineError::Usage(format!("cannot encode plan: {}", e)))?;
        println!("{}", out);
    } else {
        print!("{}", planner::render_plan(&report));
    }
    Ok(0)
}

async fn cmd_apply(
    project: &Project,
    target: &Target,
    exec: &ExecArgs,
    mode: DiffMode,
    provider: Arc<dyn Provider>,
    cancel: CancelSignal,
) -> Result<i32, EngineError> {
    let store = Arc::new(project.open_state(&target.state_dir)?);
    let plan = project.plan(&store, mode)?;
    print!("{}", planner::render_plan(&planner::plan_report(&plan)));

    if plan.is_empty() {
        println!();
        println!("No changes. Infrastructure matches the declaration.");
        return Ok(0);
    }

    let mut policy = project.config.policy.clone();
    if let Some(p) = exec.parallelism {
        policy.parallelism = p;
    }
    let opts = ExecuteOptions {
        resources: &project.resources,
        graph: &project.graph,
        schemas: &project.schemas,
        context: &project.context,
        policy: &policy,
        cancel,
    };

    let report = executor::execute(&plan, store, provider, &opts).await?;
    print_apply_report(&report);
    Ok(report.exit_code())
}

fn print_apply_report(report: &ApplyReport) {
    println!();
    println!("Run {} ({}):", report.run_id, report.environment);
    for step in &report.steps {
        println!(
            "  {} {} ({}): {}",
            step.action.symbol(),
            step.address,
            step.operation,
            step.outcome
        );
    }
    println!();

    if report.is_success() {
        println!(
            "Apply complete: {} succeeded, {} unchanged ({:.1}s).",
            report.succeeded(),
            report.unchanged.len(),
            report.duration_seconds
        );
        return;
    }
    if report.cancelled {
        println!("Apply cancelled: remaining batches were not started.");
    }
    println!(
        "Apply completed with errors: {} succeeded, {} FAILED, {} skipped, {} cancelled.",
        report.succeeded(),
        report.failed(),
        report.skipped(),
        report.not_started()
    );
    let untouched = report.unchanged_targets();
    if !untouched.is_empty() {
        let names: Vec<String> = untouched.iter().map(|a| a.to_string()).collect();
        println!("State unchanged for: {}", names.join(", "));
    }
}

async fn cmd_refresh(
    project: &Project,
    target: &Target,
    provider: Arc<dyn Provider>,
) -> Result<i32, EngineError> {
    let store = project.open_state(&target.state_dir)?;
    println!(
        "Refreshing {} ({} records)...",
        project.context.environment,
        store.len()
    );
    let report =
        executor::refresh(&store, provider.as_ref(), &project.context, &project.config.policy)
            .await?;

    for finding in &report.findings {
        println!("  DRIFTED: {} ({})", finding.address, finding.detail);
        println!("    Expected: {}", finding.expected_hash);
        println!("    Actual:   {}", finding.actual_hash);
    }
    for (address, error) in &report.errors {
        println!("  ERROR: {}: {}", address, error);
    }
    if report.findings.is_empty() {
        println!("No drift detected ({} checked).", report.checked);
    } else {
        println!();
        println!(
            "Drift recorded: {} of {} resource(s). Run `terrane plan` to see the repair.",
            report.findings.len(),
            report.checked
        );
    }
    Ok(report.exit_code())
}

fn cmd_status(state_dir: &Path, env: Option<&str>) -> Result<i32, EngineError> {
    let env = env_name(env);
    let store = StateStore::open(state_dir, env)?;
    if store.is_empty() {
        println!("No state found for {}. Run `terrane apply` first.", env);
    } else {
        println!("Environment: {}", env);
        println!("  Serial:  {}", store.serial());
        println!("  Lineage: {}", store.lineage());
        println!("  Resources: {}", store.len());
        for (address, record) in store.records() {
            let mut notes = String::new();
            if !record.sensitive.is_empty() {
                notes.push_str(&format!(" [{} sensitive]", record.sensitive.len()));
            }
            if !record.deposed.is_empty() {
                notes.push_str(&format!(" [{} deposed, pending delete]", record.deposed.len()));
            }
            println!(
                "    {}: v{} applied {}{}",
                address, record.version, record.applied_at, notes
            );
        }
    }

    let locks = store.locks()?;
    if !locks.is_empty() {
        println!("  Locks:");
        for (address, lock) in &locks {
            println!("    {}: held by {} since {}", address, lock.owner, lock.acquired_at);
        }
    }
    Ok(0)
}

fn cmd_unlock(state_dir: &Path, env: Option<&str>, owner: &str) -> Result<i32, EngineError> {
    let store = StateStore::open(state_dir, env_name(env))?;
    let released = store.force_unlock(owner)?;
    if released.is_empty() {
        println!("No locks held by {}.", owner);
    } else {
        tracing::warn!(owner, count = released.len(), "force-released locks");
        for address in &released {
            println!("  released {}", address);
        }
        println!("Released {} lock(s) held by {}.", released.len(), owner);
    }
    Ok(0)
}

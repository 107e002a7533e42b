//! Command surface of the `caselink` binary.
//!
//! Every command opens the result store at `--db`, applies migrations and
//! prints JSON on stdout. Commands that resolve linkage load the graph
//! snapshot at `--graph` and bound each lookup by the configured timeout.
//! Logs go to stderr.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use caselink_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AutoResult, AutoResultInput, BlockingExclude,
    EngineConfig, EntityRef, LinkageDirectory, LinkageError, LinkageGraph, LinkageResult,
    ManualVerdict, Pattern, Run, RunId, RunInput, RunStatistics, SubmissionBatch, SubmissionSink,
    TimeoutDirectory,
};
use caselink_store_sqlite::{SqliteResultStore, SubmissionOutcome};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "caselink")]
#[command(about = "Reconciles automated test results with tracked work items")]
pub struct Cli {
    #[arg(long, default_value = "./caselink.sqlite3")]
    db: PathBuf,

    /// LinkageGraph snapshot (JSON).
    #[arg(long, default_value = "./linkage-graph.json")]
    graph: PathBuf,

    /// Optional engine configuration (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Run {
        #[command(subcommand)]
        command: Box<RunCommand>,
    },
    Auto {
        #[command(subcommand)]
        command: Box<AutoCommand>,
    },
    Manual {
        #[command(subcommand)]
        command: Box<ManualCommand>,
    },
    Linkage {
        #[command(subcommand)]
        command: Box<LinkageCommand>,
    },
    Graph {
        #[command(subcommand)]
        command: Box<GraphCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Create(RunCreateArgs),
    Show(RunIdArgs),
    List(ListArgs),
    Delete(RunIdArgs),
    Reset(RunIdArgs),
    Refresh(RunIdArgs),
    Stats(RunStatsArgs),
    Blocking(RunBlockingArgs),
    Submit(RunSubmitArgs),
}

#[derive(Debug, Args)]
pub struct RunCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    component: String,
    #[arg(long)]
    build: String,
    #[arg(long)]
    product: String,
    #[arg(long)]
    version: String,
    #[arg(long)]
    arch: String,
    #[arg(long)]
    run_type: String,
    #[arg(long)]
    framework: String,
    #[arg(long)]
    project: String,
    /// RFC3339 UTC timestamp; defaults to now.
    #[arg(long)]
    date: Option<String>,
    #[arg(long, default_value = "")]
    ci_url: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Free-form `key=value` property; repeatable.
    #[arg(long = "property")]
    properties: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RunIdArgs {
    #[arg(long)]
    run_id: RunId,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RunStatsArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RunBlockingArgs {
    #[arg(long)]
    run_id: RunId,
    /// Error code to leave out; repeatable. Defaults to the configured set.
    #[arg(long = "exclude")]
    exclude: Vec<String>,
    /// Exclude every error code.
    #[arg(long)]
    forced: bool,
}

#[derive(Debug, Args)]
pub struct RunSubmitArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long)]
    forced: bool,
    /// File the submission batch is written to.
    #[arg(long)]
    batch_file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum AutoCommand {
    Submit(AutoSubmitArgs),
    Update(AutoFieldsArgs),
    Delete(CaseArgs),
    Show(CaseArgs),
    List(RunIdArgs),
    Reconcile(CaseArgs),
}

#[derive(Debug, Args)]
pub struct AutoFieldsArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long)]
    case_id: String,
    #[arg(long, default_value_t = 0.0)]
    time: f64,
    #[arg(long)]
    skip: Option<String>,
    #[arg(long)]
    failure: Option<String>,
    #[arg(long)]
    output: Option<String>,
    #[arg(long)]
    source: Option<String>,
}

#[derive(Debug, Args)]
pub struct AutoSubmitArgs {
    #[command(flatten)]
    fields: AutoFieldsArgs,
    /// Overwrite a result that was already reported.
    #[arg(long)]
    replace: bool,
}

#[derive(Debug, Args)]
pub struct CaseArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long)]
    case_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ManualCommand {
    Show(WorkItemArgs),
    List(RunIdArgs),
    Override(ManualOverrideArgs),
    ClearOverride(WorkItemArgs),
}

#[derive(Debug, Args)]
pub struct WorkItemArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long)]
    work_item_id: String,
}

#[derive(Debug, Args)]
pub struct ManualOverrideArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long)]
    work_item_id: String,
    #[arg(long)]
    result: VerdictArg,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VerdictArg {
    Passed,
    Failed,
    Skipped,
    Incomplete,
}

#[derive(Debug, Subcommand)]
pub enum LinkageCommand {
    List(RunIdArgs),
    Errors(RunStatsArgs),
}

#[derive(Debug, Subcommand)]
pub enum GraphCommand {
    Check(GraphCheckArgs),
    CheckAll(GraphCheckAllArgs),
    UpsertPattern(GraphUpsertPatternArgs),
    DeletePattern(GraphDeletePatternArgs),
    Lookup(GraphLookupArgs),
}

#[derive(Debug, Args)]
pub struct GraphCheckArgs {
    /// Entity to check, as `work_item:<id>`, `auto_case:<id>` or `pattern:<id>`.
    #[arg(long)]
    entity: String,
    /// Cascade depth; defaults to the configured depth.
    #[arg(long)]
    depth: Option<u32>,
    /// Write the updated tags back to the snapshot.
    #[arg(long)]
    write: bool,
}

#[derive(Debug, Args)]
pub struct GraphCheckAllArgs {
    #[arg(long)]
    write: bool,
}

#[derive(Debug, Args)]
pub struct GraphUpsertPatternArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    work_item_id: String,
    #[arg(long)]
    pattern: String,
    #[arg(long)]
    framework: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    depth: Option<u32>,
}

#[derive(Debug, Args)]
pub struct GraphDeletePatternArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    depth: Option<u32>,
}

#[derive(Debug, Args)]
pub struct GraphLookupArgs {
    #[arg(long, conflicts_with = "work_item_id", required_unless_present = "work_item_id")]
    case_id: Option<String>,
    #[arg(long)]
    work_item_id: Option<String>,
}

/// Installs the stderr log subscriber. An invalid filter falls back to `warn`.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Executes the parsed command tree.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, graph
/// loading, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let context = CommandContext {
        graph_path: cli.graph,
        config: config.clone(),
    };

    match cli.command {
        Command::Graph { command } => run_graph(*command, &context),
        command => {
            tracing::debug!(db = %cli.db.display(), "opening result store");
            let mut store = SqliteResultStore::open_with_config(&cli.db, config)?;
            store.migrate()?;
            match command {
                Command::Run { command } => run_run(*command, &mut store, &context),
                Command::Auto { command } => run_auto(*command, &mut store, &context),
                Command::Manual { command } => run_manual(*command, &mut store),
                Command::Linkage { command } => run_linkage(*command, &store),
                Command::Graph { .. } => Err(anyhow!(
                    "internal dispatch error: graph commands do not open the store"
                )),
            }
        }
    }
}

struct CommandContext {
    graph_path: PathBuf,
    config: EngineConfig,
}

impl CommandContext {
    fn load_graph(&self) -> Result<LinkageGraph> {
        LinkageGraph::load(&self.graph_path)
            .map_err(|err| anyhow!("failed to load linkage graph: {err}"))
    }

    fn directory(&self) -> Result<TimeoutDirectory<LinkageGraph>> {
        Ok(TimeoutDirectory::new(
            Arc::new(self.load_graph()?),
            self.config.lookup_timeout(),
        ))
    }

    fn save_graph(&self, graph: &LinkageGraph) -> Result<()> {
        graph
            .save(&self.graph_path)
            .map_err(|err| anyhow!("failed to save linkage graph: {err}"))
    }

    fn depth(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.config.consistency_depth)
    }
}

fn run_run(
    command: RunCommand,
    store: &mut SqliteResultStore,
    context: &CommandContext,
) -> Result<()> {
    match command {
        RunCommand::Create(args) => {
            let date = match args.date.as_deref() {
                Some(raw) => {
                    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid --date value: {err}"))?
                }
                None => now_utc(),
            };
            let input = RunInput {
                name: args.name,
                component: args.component,
                build: args.build,
                product: args.product,
                version: args.version,
                arch: args.arch,
                run_type: args.run_type,
                framework: args.framework,
                project: args.project,
                date,
                ci_url: args.ci_url,
                description: args.description,
                tags: args.tags,
                properties: parse_properties(&args.properties)?,
            };
            let run = store.create_run(&input)?;
            print_json(&run)
        }
        RunCommand::Show(args) => print_json(&require_run(store, args.run_id)?),
        RunCommand::List(args) => {
            let runs = store.list_runs()?;
            if args.json {
                print_json(&runs)
            } else {
                print_runs_table(&runs);
                Ok(())
            }
        }
        RunCommand::Delete(args) => {
            let deleted = store.delete_run(args.run_id)?;
            if !deleted {
                return Err(anyhow!("run {} not found", args.run_id));
            }
            print_json(&json!({"run_id": args.run_id, "deleted": true}))
        }
        RunCommand::Reset(args) => print_json(&store.reset_run(args.run_id)?),
        RunCommand::Refresh(args) => {
            let directory = context.directory()?;
            print_json(&store.refresh_run(args.run_id, &directory)?)
        }
        RunCommand::Stats(args) => {
            let statistics = store.refresh_statistics(args.run_id)?;
            if args.json {
                print_json(&statistics)
            } else {
                print_statistics(args.run_id, &statistics);
                Ok(())
            }
        }
        RunCommand::Blocking(args) => {
            let exclude = if args.forced {
                BlockingExclude::All
            } else if args.exclude.is_empty() {
                store.default_blocking_exclude()
            } else {
                BlockingExclude::Codes(args.exclude.into_iter().collect())
            };
            let errors = store.blocking_errors(args.run_id, &exclude)?;
            print_json(&json!({
                "run_id": args.run_id,
                "blocked": !errors.is_empty(),
                "errors": errors,
            }))
        }
        RunCommand::Submit(args) => {
            let mut sink = JsonFileSink::new(args.batch_file);
            let outcome = store.submit_run(args.run_id, args.forced, &mut sink)?;
            print_json(&outcome)?;
            match outcome {
                SubmissionOutcome::Blocked { run_id, errors } => Err(anyhow!(
                    "run {run_id} is blocked: {}",
                    errors.join("; ")
                )),
                SubmissionOutcome::Submitted { .. } => Ok(()),
            }
        }
    }
}

fn run_auto(
    command: AutoCommand,
    store: &mut SqliteResultStore,
    context: &CommandContext,
) -> Result<()> {
    match command {
        AutoCommand::Submit(args) => {
            let directory = context.directory()?;
            let replace = args.replace;
            let (run_id, input) = auto_input(args.fields);
            let report = store.submit_auto_result(run_id, &input, replace, &directory)?;
            print_json(&report)
        }
        AutoCommand::Update(args) => {
            let directory = context.directory()?;
            let (run_id, input) = auto_input(args);
            let report = store.update_auto_result(run_id, &input, &directory)?;
            print_json(&report)
        }
        AutoCommand::Delete(args) => {
            let touched = store.delete_auto_result(args.run_id, &args.case_id)?;
            print_json(&json!({
                "run_id": args.run_id,
                "case_id": args.case_id,
                "work_items_recomputed": touched,
            }))
        }
        AutoCommand::Show(args) => {
            let Some(result) = store.get_auto_result(args.run_id, &args.case_id)? else {
                return Err(anyhow!(
                    "auto result {} not found in run {}",
                    args.case_id,
                    args.run_id
                ));
            };
            print_json(&result)
        }
        AutoCommand::List(args) => {
            let results: Vec<AutoResult> = store.list_auto_results(args.run_id)?;
            print_json(&results)
        }
        AutoCommand::Reconcile(args) => {
            let directory = context.directory()?;
            print_json(&store.reconcile(args.run_id, &args.case_id, &directory)?)
        }
    }
}

fn run_manual(command: ManualCommand, store: &mut SqliteResultStore) -> Result<()> {
    match command {
        ManualCommand::Show(args) => {
            let Some(result) = store.get_manual_result(args.run_id, &args.work_item_id)? else {
                return Err(anyhow!(
                    "manual result {} not found in run {}",
                    args.work_item_id,
                    args.run_id
                ));
            };
            print_json(&result)
        }
        ManualCommand::List(args) => print_json(&store.list_manual_results(args.run_id)?),
        ManualCommand::Override(args) => {
            let result = store.override_manual_result(
                args.run_id,
                &args.work_item_id,
                map_verdict(args.result),
                args.comment.as_deref(),
            )?;
            print_json(&result)
        }
        ManualCommand::ClearOverride(args) => {
            let result = store.clear_override(args.run_id, &args.work_item_id)?;
            print_json(&result)
        }
    }
}

fn run_linkage(command: LinkageCommand, store: &SqliteResultStore) -> Result<()> {
    match command {
        LinkageCommand::List(args) => print_json(&store.list_linkage_results(args.run_id)?),
        LinkageCommand::Errors(args) => {
            let errors = store.list_linkage_errors(args.run_id)?;
            if args.json {
                print_json(&errors)
            } else {
                print_linkage_errors(&errors);
                Ok(())
            }
        }
    }
}

fn run_graph(command: GraphCommand, context: &CommandContext) -> Result<()> {
    match command {
        GraphCommand::Check(args) => {
            let entity: EntityRef = args
                .entity
                .parse()
                .map_err(|err: LinkageError| anyhow!("invalid --entity value: {err}"))?;
            let mut graph = context.load_graph()?;
            let report = graph.check_consistency(&entity, context.depth(args.depth));
            if args.write {
                context.save_graph(&graph)?;
            }
            print_json(&report)
        }
        GraphCommand::CheckAll(args) => {
            let mut graph = context.load_graph()?;
            let report = graph.check_all();
            if args.write {
                context.save_graph(&graph)?;
            }
            print_json(&report)
        }
        GraphCommand::UpsertPattern(args) => {
            let mut graph = context.load_graph()?;
            let pattern = Pattern {
                id: args.id,
                work_item_id: args.work_item_id,
                pattern: args.pattern,
                framework: args.framework,
                title: args.title,
            };
            let report = graph
                .upsert_pattern(pattern, context.depth(args.depth))
                .map_err(|err| anyhow!("pattern rejected: {err}"))?;
            context.save_graph(&graph)?;
            print_json(&report)
        }
        GraphCommand::DeletePattern(args) => {
            let mut graph = context.load_graph()?;
            let report = graph
                .delete_pattern(&args.id, context.depth(args.depth))
                .map_err(|err| anyhow!("pattern delete failed: {err}"))?;
            context.save_graph(&graph)?;
            print_json(&report)
        }
        GraphCommand::Lookup(args) => {
            let graph = context.load_graph()?;
            match (args.case_id, args.work_item_id) {
                (Some(case_id), _) => {
                    let links = graph
                        .lookup_auto_case(&case_id)
                        .map_err(|err| anyhow!("lookup failed: {err}"))?;
                    print_json(&links)
                }
                (None, Some(work_item_id)) => {
                    let links = graph
                        .lookup_work_item(&work_item_id)
                        .map_err(|err| anyhow!("lookup failed: {err}"))?;
                    print_json(&links)
                }
                (None, None) => Err(anyhow!("one of --case-id or --work-item-id is required")),
            }
        }
    }
}

/// Writes each submission batch to a JSON file and hands back a fresh
/// batch identifier.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SubmissionSink for JsonFileSink {
    fn submit(&mut self, batch: &SubmissionBatch) -> Result<String, LinkageError> {
        let external_id = format!("batch-{}", Ulid::new());
        let body = serde_json::to_string_pretty(&json!({
            "external_id": external_id,
            "batch": batch,
        }))
        .map_err(|err| LinkageError::Validation(format!("failed to encode batch: {err}")))?;
        std::fs::write(&self.path, body).map_err(|err| {
            LinkageError::Validation(format!(
                "failed to write batch to {}: {err}",
                self.path.display()
            ))
        })?;
        Ok(external_id)
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("config {} must be valid JSON", path.display()))?;
    EngineConfig::from_json(&value).map_err(|err| anyhow!("{err}"))
}

fn auto_input(args: AutoFieldsArgs) -> (RunId, AutoResultInput) {
    (
        args.run_id,
        AutoResultInput {
            case_id: args.case_id,
            time: args.time,
            skip: args.skip,
            failure: args.failure,
            output: args.output,
            source: args.source,
        },
    )
}

fn require_run(store: &SqliteResultStore, run_id: RunId) -> Result<Run> {
    store
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("run {run_id} not found"))
}

fn parse_properties(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|item| {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| anyhow!("--property must look like key=value: {item}"))?;
            if key.trim().is_empty() {
                return Err(anyhow!("--property key must be non-empty: {item}"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn map_verdict(value: VerdictArg) -> ManualVerdict {
    match value {
        VerdictArg::Passed => ManualVerdict::Passed,
        VerdictArg::Failed => ManualVerdict::Failed,
        VerdictArg::Skipped => ManualVerdict::Skipped,
        VerdictArg::Incomplete => ManualVerdict::Incomplete,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_runs_table(runs: &[Run]) {
    println!(
        "{:<8} {:<24} {:<16} {:<24} {:<10} {:<20} submitted",
        "run_id", "name", "component", "build", "arch", "date"
    );
    println!("{}", "-".repeat(116));
    for run in runs {
        let date = format_rfc3339(run.date).unwrap_or_default();
        println!(
            "{:<8} {:<24} {:<16} {:<24} {:<10} {:<20} {}",
            run.run_id,
            run.name,
            run.component,
            run.build,
            run.arch,
            date,
            run.external_id.as_deref().unwrap_or("-")
        );
    }
}

fn print_statistics(run_id: RunId, statistics: &RunStatistics) {
    println!("run_id: {run_id}");
    println!("{:<20} count", "counter");
    println!("{}", "-".repeat(28));
    for (name, value) in [
        ("auto_passed", statistics.auto_passed),
        ("auto_failed", statistics.auto_failed),
        ("auto_skipped", statistics.auto_skipped),
        ("auto_ignored", statistics.auto_ignored),
        ("auto_missing", statistics.auto_missing),
        ("auto_invalid", statistics.auto_invalid),
        ("auto_unknown_issue", statistics.auto_unknown_issue),
        ("auto_nolinkage", statistics.auto_nolinkage),
        ("manual_passed", statistics.manual_passed),
        ("manual_failed", statistics.manual_failed),
        ("manual_skipped", statistics.manual_skipped),
        ("manual_incomplete", statistics.manual_incomplete),
    ] {
        println!("{name:<20} {value}");
    }
}

fn print_linkage_errors(errors: &[LinkageResult]) {
    println!(
        "{:<16} {:<40} {:<16} detail",
        "error", "case_id", "work_item_id"
    );
    println!("{}", "-".repeat(96));
    for row in errors {
        println!(
            "{:<16} {:<40} {:<16} {}",
            row.error.map_or("-", |code| code.as_str()),
            row.case_id,
            row.work_item_id,
            row.detail.as_deref().unwrap_or("")
        );
    }
}

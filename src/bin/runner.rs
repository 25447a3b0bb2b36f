//! Evaluation runner CLI (§6 "CLI surface"): loads a golden dataset, runs
//! it through the agent graph, and writes a summary document (plus a
//! regression verdict against a prior summary, if one is given) to an
//! output directory.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use text2sql_core::eval::runner::{EvalCase, EvalRunner, EvalSummary, RunnerConfig, SqlGenerator};
use text2sql_core::execution::dal::StaticQueryTargetDatabase;
use text2sql_core::execution::{ExecutionEngine, ExecutionEngineConfig, NullToolInvoker};
use text2sql_core::llm::StaticLlmClient;
use text2sql_core::orchestrator::{AgentGraph, InMemoryCheckpointer, NullInteractionPersistence, WorkflowConfig};
use text2sql_core::registry::SqliteRegistryStore;
use text2sql_core::schema::{ColumnDef, StaticSchemaIntrospector, TableDef};
use text2sql_core::sql::tenant_rewriter::TenantRewriteSettings;
use text2sql_core::sql::validator::ValidatorConfig;
use text2sql_core::telemetry::{InMemoryTelemetryBackend, TelemetryBackend};
use text2sql_core::Error;

#[derive(Parser, Debug)]
#[command(name = "runner", about = "Runs a golden dataset through the text2sql agent graph")]
struct Args {
    #[arg(long)]
    dataset: PathBuf,

    #[arg(long = "output-dir")]
    output_dir: PathBuf,

    #[arg(long)]
    limit: Option<usize>,

    #[arg(long = "tenant-id")]
    tenant_id: Option<i64>,

    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long = "run-id")]
    run_id: Option<String>,

    /// A prior summary.json to diff the fresh run against for regression detection.
    #[arg(long = "baseline")]
    baseline: Option<PathBuf>,
}

/// Drives the full agent graph for each eval question. Wired here with the
/// crate's own reference/static collaborators (documented in
/// `schema`/`execution::dal`/`llm` as usable for replay runs, not only
/// tests); a deployment swaps these for real DAL/LLM/schema-store
/// implementations behind the same trait objects.
struct GraphGenerator {
    graph: AgentGraph,
}

#[async_trait::async_trait]
impl SqlGenerator for GraphGenerator {
    async fn generate(&self, question: &str, tenant_id: Option<i64>) -> text2sql_core::Result<String> {
        let state = text2sql_core::AgentState::new(question, tenant_id);
        let thread_id = uuid::Uuid::new_v4().to_string();
        let result = self.graph.run(&thread_id, state).await?;
        result
            .state
            .current_sql
            .ok_or_else(|| Error::Internal("graph run produced no current_sql".to_string()))
    }
}

fn build_generator() -> GraphGenerator {
    let registry = Arc::new(SqliteRegistryStore::in_memory().expect("in-memory registry store"));
    let schema = Arc::new(StaticSchemaIntrospector::new(vec![TableDef {
        name: "orders".to_string(),
        columns: vec![
            ColumnDef {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                nullable: false,
            },
            ColumnDef {
                name: "tenant_id".to_string(),
                data_type: "integer".to_string(),
                nullable: false,
            },
        ],
        foreign_keys: vec![],
        description: None,
    }]));
    let model_name = std::env::var("LLM_MODEL").unwrap_or_else(|_| "reference-static".to_string());
    let llm = Arc::new(StaticLlmClient::new(model_name, "SELECT id FROM orders"));
    let telemetry: Arc<dyn TelemetryBackend> = Arc::new(InMemoryTelemetryBackend::new());
    let db = Arc::new(StaticQueryTargetDatabase::new("sqlite"));
    let engine = Arc::new(ExecutionEngine::new(
        ExecutionEngineConfig::from_env(),
        ValidatorConfig::default(),
        TenantRewriteSettings::default(),
        db,
        Arc::new(NullToolInvoker),
        telemetry.clone(),
    ));

    let graph = AgentGraph::new(
        WorkflowConfig::from_env(),
        Arc::new(InMemoryCheckpointer::new()),
        telemetry,
        Arc::new(NullInteractionPersistence),
        registry,
        schema,
        llm,
        ValidatorConfig::default(),
        "sqlite".to_string(),
        engine,
        512,
    );

    GraphGenerator { graph }
}

fn run_id_for(args: &Args) -> String {
    args.run_id.clone().unwrap_or_else(|| {
        args.dataset
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string())
    })
}

fn apply_tenant_override(mut cases: Vec<EvalCase>, tenant_id: Option<i64>) -> Vec<EvalCase> {
    if let Some(tenant_id) = tenant_id {
        for case in &mut cases {
            if case.tenant_id.is_none() {
                case.tenant_id = Some(tenant_id);
            }
        }
    }
    cases
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let raw = match fs::read_to_string(&args.dataset) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("failed to read dataset {}: {e}", args.dataset.display());
            std::process::exit(1);
        }
    };

    let cases = match EvalRunner::parse_dataset(&raw) {
        Ok(cases) => apply_tenant_override(cases, args.tenant_id),
        Err(e) => {
            eprintln!("failed to parse dataset: {e}");
            std::process::exit(1);
        }
    };

    let config = RunnerConfig {
        concurrency: args.concurrency,
        limit: args.limit,
        seed: args.seed,
        ..RunnerConfig::default()
    };

    let generator: Arc<dyn SqlGenerator> = Arc::new(build_generator());
    let runner = EvalRunner::new(generator, config);
    let run_id = run_id_for(&args);

    let (results, summary) = runner.run(run_id.clone(), cases).await;

    if let Err(e) = fs::create_dir_all(&args.output_dir) {
        eprintln!("failed to create output directory {}: {e}", args.output_dir.display());
        std::process::exit(1);
    }

    if let Err(e) = write_json(&args.output_dir.join(format!("{run_id}.results.json")), &results) {
        eprintln!("failed to write results: {e}");
        std::process::exit(1);
    }
    if let Err(e) = write_json(&args.output_dir.join(format!("{run_id}.summary.json")), &summary) {
        eprintln!("failed to write summary: {e}");
        std::process::exit(1);
    }

    let mut exit_code = 0;
    if let Some(baseline_path) = &args.baseline {
        match fs::read_to_string(baseline_path).ok().and_then(|raw| serde_json::from_str::<EvalSummary>(&raw).ok()) {
            Some(baseline) => {
                let verdict = runner.detect_regression(&baseline, &summary);
                if let Err(e) = write_json(&args.output_dir.join(format!("{run_id}.regression.json")), &verdict) {
                    eprintln!("failed to write regression verdict: {e}");
                    std::process::exit(1);
                }
                if verdict.is_regression {
                    eprintln!("regression detected: {:?}", verdict.reasons);
                    exit_code = 1;
                }
            }
            None => {
                eprintln!("baseline {} unreadable or not a valid summary, skipping regression check", baseline_path.display());
            }
        }
    }

    if summary.error_count > 0 {
        exit_code = 1;
    }

    std::process::exit(exit_code);
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    fs::write(path, body)
}

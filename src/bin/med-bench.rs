use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use medbench::{
    providers::openrouter::OpenRouter,
    BatchRunner, CaseSet, Evaluator, EvaluationError, FaultAttributor, LLMProvider, LlmAgent,
    Orchestrator, RubricCriterion, RunConfig, TerminalStatus, UserSimulator, UserStrategy,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "med-bench")]
#[command(about = "Run multi-turn clinical tool-calling dialogue evaluations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a case set against a model and write JSONL results
    Run(RunArgs),
    /// Summarize an existing results file
    Status(StatusArgs),
}

#[derive(Debug, Clone, ValueEnum)]
enum StrategyArg {
    Direct,
    Reasoning,
    Verify,
    Reflect,
}

impl From<StrategyArg> for UserStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Direct => UserStrategy::Direct,
            StrategyArg::Reasoning => UserStrategy::ReasoningThenRespond,
            StrategyArg::Verify => UserStrategy::SelfVerifying,
            StrategyArg::Reflect => UserStrategy::SelfReflecting,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Path to cases directory or case file (YAML/JSON)
    #[arg(long, default_value = "bench/cases")]
    cases: PathBuf,

    /// Path to the tool specification file
    #[arg(long, default_value = "bench/tools.json")]
    tools: PathBuf,

    /// Model identifier for the agent under test
    #[arg(long)]
    model: String,

    /// Model identifier for the user simulator (defaults to --model)
    #[arg(long)]
    user_model: Option<String>,

    /// Enable fault attribution on failed trajectories with this judge model
    #[arg(long)]
    judge_model: Option<String>,

    /// Maximum trajectories in flight at once
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Output path for JSONL results
    #[arg(long)]
    out: Option<PathBuf>,

    /// Skip cases already recorded in the output file
    #[arg(long)]
    resume: bool,

    /// User simulation strategy
    #[arg(long, value_enum, default_value = "direct")]
    strategy: StrategyArg,

    /// Run only cases whose id contains this substring (repeatable)
    #[arg(long)]
    filter: Vec<String>,

    /// Agent-visible turn budget per trajectory
    #[arg(long, default_value_t = 10)]
    max_turns: usize,
}

#[derive(Args)]
struct StatusArgs {
    /// Results file to summarize
    results: PathBuf,
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn default_out_path() -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    PathBuf::from(format!("bench/runs/{ts}.jsonl"))
}

fn default_rubric() -> Vec<RubricCriterion> {
    vec![
        RubricCriterion::schema_validity(1.0),
        RubricCriterion::matches_reference_conclusion(2.0),
        RubricCriterion::new("efficiency", 1.0, |trajectory, case| {
            let expected = case.tool_responses.len().max(1);
            let calls = trajectory.tool_calls().count();
            let extra = calls.saturating_sub(expected);
            Ok::<_, EvaluationError>((1.0 - extra as f64 / expected as f64).max(0.0))
        })
        .with_description("no more tool calls than the case has data for"),
    ]
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut case_set = CaseSet::load(&args.cases, &args.tools)?;
    if !args.filter.is_empty() {
        case_set
            .cases
            .retain(|c| args.filter.iter().any(|f| c.id.contains(f)));
    }
    if case_set.cases.is_empty() {
        eprintln!("No cases matched.");
        std::process::exit(2);
    }

    let provider: Arc<dyn LLMProvider> = Arc::new(OpenRouter::from_env()?);
    let user_model = args.user_model.unwrap_or_else(|| args.model.clone());
    let strategy = UserStrategy::from(args.strategy);

    let config = RunConfig::default()
        .with_max_agent_turns(args.max_turns)
        .with_concurrency(args.concurrency)
        .with_user_strategy(strategy);

    let agent = Arc::new(
        LlmAgent::new(Arc::clone(&provider), &args.model)
            .with_timeout_ms(config.actor_timeout_ms)
            .with_retries(config.actor_retries),
    );
    let simulator = Arc::new(
        UserSimulator::new(Arc::clone(&provider), user_model, strategy)
            .with_timeout_ms(config.actor_timeout_ms)
            .with_retries(config.actor_retries),
    );
    let orchestrator = Arc::new(Orchestrator::new(agent, simulator, config));
    let evaluator = Arc::new(Evaluator::new(default_rubric()));

    let mut runner = BatchRunner::new(orchestrator, evaluator);
    if let Some(judge_model) = &args.judge_model {
        runner = runner.with_fault_attributor(Arc::new(FaultAttributor::new(
            Arc::clone(&provider),
            judge_model,
        )));
    }

    let out_path = args.out.unwrap_or_else(default_out_path);
    ensure_parent_dir(&out_path)?;

    let summary = runner
        .run(Arc::new(case_set), &out_path, args.resume)
        .await?;

    println!(
        "Model: {}, Cases: {} run / {} skipped, Completed: {}, Failures: {}, Output: {}",
        args.model,
        summary.attempted,
        summary.skipped,
        summary.completed,
        summary.failures(),
        out_path.display()
    );
    if let Some(mean) = summary.mean_score {
        println!("Mean score: {mean:.3}");
    }

    if summary.failures() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(&args.results)?;
    let records = medbench::batch::read_records(&contents)?;

    let mut completed = 0usize;
    let mut max_turns = 0usize;
    let mut agent_errors = 0usize;
    let mut user_errors = 0usize;
    let mut tool_errors = 0usize;
    let mut score_sum = 0.0f64;
    let mut scored = 0usize;

    for record in &records {
        match record.status {
            Some(TerminalStatus::Completed) => completed += 1,
            Some(TerminalStatus::MaxTurnsExceeded) => max_turns += 1,
            Some(TerminalStatus::AgentError) => agent_errors += 1,
            Some(TerminalStatus::UserError) => user_errors += 1,
            Some(TerminalStatus::ToolError) | None => tool_errors += 1,
        }
        if let Some(evaluation) = &record.evaluation {
            score_sum += evaluation.total;
            scored += 1;
        }
    }

    println!("Records: {}", records.len());
    println!(
        "Completed: {completed}, MaxTurns: {max_turns}, AgentErrors: {agent_errors}, \
         UserErrors: {user_errors}, ToolErrors: {tool_errors}"
    );
    if scored > 0 {
        println!("Mean score: {:.3}", score_sum / scored as f64);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => status(args),
    }
}

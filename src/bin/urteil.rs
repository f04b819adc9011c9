use std::{
    collections::BTreeSet,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use urteil::{
    config::resolve_on, load_definitions, ConfigOverrides, ConfigRequest, EvaluationConfig, HttpAgent,
    HttpAgentConfig, JudgeRegistry, ScenarioDefinition, ScenarioReport, ScenarioRunner, ScenarioStatus,
    SuiteReport,
};

#[derive(Parser)]
#[command(name = "urteil")]
#[command(about = "Judge conversational agents against natural-language criteria")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scenario definitions against an HTTP agent
    Run(RunArgs),
    /// Print the JSON schema of a scenario definition file
    Schema,
}

#[derive(Parser)]
struct RunArgs {
    /// Scenario file or directory of YAML/JSON files
    #[arg(long, default_value = "scenarios")]
    scenarios: PathBuf,

    /// Agent endpoint receiving `{message, session_id, context}`
    #[arg(long)]
    endpoint: String,

    /// Extra request header for the agent, as NAME:VALUE (repeatable)
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Agent request timeout in milliseconds
    #[arg(long, default_value_t = 60_000)]
    agent_timeout_ms: u64,

    /// Evaluation mode: fast, thorough or production
    #[arg(long)]
    mode: Option<String>,

    /// Judge backend key (repeatable); replaces the mode's backends
    #[arg(long = "backend")]
    backends: Vec<String>,

    /// Evaluation iterations per case
    #[arg(long)]
    iterations: Option<u32>,

    /// Per judge call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Run only scenarios whose id contains this substring (repeatable)
    #[arg(long)]
    filter: Vec<String>,

    /// Output path for JSONL scenario reports
    #[arg(long)]
    out: Option<PathBuf>,

    /// Stop at the first scenario that does not pass
    #[arg(long)]
    fail_fast: bool,
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn default_out_path() -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    PathBuf::from(format!("urteil/runs/{ts}.jsonl"))
}

fn filter_definitions(mut definitions: Vec<ScenarioDefinition>, filters: &[String]) -> Vec<ScenarioDefinition> {
    if filters.is_empty() {
        return definitions;
    }
    definitions.retain(|d| filters.iter().any(|f| d.id.contains(f)));
    definitions
}

/// Every backend key any scenario may ask for, so the registry is built once.
/// Overrides that fail to resolve are skipped here and reported by the runner.
fn judge_keys(base: &EvaluationConfig, definitions: &[ScenarioDefinition]) -> Vec<String> {
    let mut keys: BTreeSet<String> = base.backends.iter().cloned().collect();
    for definition in definitions {
        let scenario = match &definition.evaluation {
            Some(request) => match resolve_on(base, request) {
                Ok(config) => config,
                Err(_) => continue,
            },
            None => base.clone(),
        };
        keys.extend(scenario.backends.iter().cloned());
        for step in &definition.steps {
            if let Some(Ok(config)) = step.evaluation.as_ref().map(|request| resolve_on(&scenario, request)) {
                keys.extend(config.backends);
            }
        }
    }
    keys.into_iter().collect()
}

fn build_agent(args: &RunArgs) -> Result<HttpAgent, Box<dyn std::error::Error>> {
    let mut config =
        HttpAgentConfig::new(args.endpoint.clone()).with_timeout(Duration::from_millis(args.agent_timeout_ms));
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| format!("header `{header}` is not NAME:VALUE"))?;
        config = config.with_header(name.trim(), value.trim());
    }
    Ok(HttpAgent::from_config(config)?)
}

fn print_scenario(report: &ScenarioReport) {
    let score = report
        .score
        .map(|score| format!("{score:.2}"))
        .unwrap_or_else(|| "-".to_string());
    let label = match report.status {
        ScenarioStatus::Passed => "PASS ".green().bold(),
        ScenarioStatus::Failed => "FAIL ".red().bold(),
        ScenarioStatus::Errored => "ERROR".yellow().bold(),
    };
    println!("{label} {} (score {score}, {} ms)", report.id, report.elapsed_ms);

    if let Some(dimensions) = &report.dimensions {
        let parts: Vec<String> = [
            ("context", dimensions.context_retention),
            ("business", dimensions.business_logic),
            ("tools", dimensions.tool_usage),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| format!("{name} {value:.2}")))
        .collect();
        if !parts.is_empty() {
            println!("      {}", parts.join(", ").dimmed());
        }
    }
    for failure in &report.failures {
        println!("      - {failure}");
    }
    for error in &report.errors {
        println!("      ! {}", error.yellow());
    }
}

async fn run(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let definitions = filter_definitions(load_definitions(&args.scenarios)?, &args.filter);
    if definitions.is_empty() {
        eprintln!("No scenarios matched.");
        return Ok(2);
    }

    let overrides = ConfigOverrides {
        backends: (!args.backends.is_empty()).then(|| args.backends.clone()),
        iterations: args.iterations,
        timeout_ms: args.timeout_ms,
        ..Default::default()
    };
    let env_config = EvaluationConfig::from_env()?;
    let config = resolve_on(
        &env_config,
        &ConfigRequest {
            mode: args.mode.clone(),
            overrides,
        },
    )?;

    let registry = JudgeRegistry::from_env(&judge_keys(&config, &definitions))?;
    tracing::info!(
        mode = ?config.mode,
        backends = ?config.backends,
        scenarios = definitions.len(),
        "starting run"
    );

    let agent = build_agent(&args)?;
    let runner = ScenarioRunner::new(Arc::new(registry), Arc::new(config));
    let outcomes = runner.run_all(&agent, &definitions, args.fail_fast).await;
    let report = SuiteReport::from_outcomes(&outcomes);

    let out_path = args.out.unwrap_or_else(default_out_path);
    ensure_parent_dir(&out_path)?;
    let mut writer = BufWriter::new(fs::File::create(&out_path)?);
    for scenario in &report.scenarios {
        print_scenario(scenario);
        serde_json::to_writer(&mut writer, scenario)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    let summary = format!(
        "Results: {}/{} passed, {} failed, {} errored, Output: {}",
        report.passed,
        report.total,
        report.failed,
        report.errored,
        out_path.display()
    );
    if report.all_passed() {
        println!("{}", summary.green());
        Ok(0)
    } else {
        println!("{}", summary.red());
        Ok(1)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,urteil=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&ScenarioDefinition::json_schema())?);
            Ok(())
        }
        Command::Run(args) => {
            let code = run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use dar_kernel::canonical::canonicalize;
use dar_kernel::executor::{ExecuteOptions, Executor};
use dar_kernel::hash::plan_hash;
use dar_kernel::plan::{AgentExecutionResult, ExecutionMode};
use dar_kernel::replay::verify_execution_replay;
use dar_kernel::response::DeterministicResponse;
use dar_runs::{CreateRunRequest, ExecuteRequest, RunService, RunStatus, RuntimeConfig};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let plan = Arg::new("plan")
        .long("plan")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Path to a JSON plan");

    Command::new("dar")
        .version(dar_runs::VERSION)
        .about("Deterministic agent runtime")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Runtime config (TOML)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("execute")
                .about("Execute a plan once")
                .arg(plan.clone())
                .arg(
                    Arg::new("max-steps")
                        .long("max-steps")
                        .value_parser(value_parser!(i64))
                        .help("Step budget"),
                )
                .arg(
                    Arg::new("trace-id")
                        .long("trace-id")
                        .help("Correlation id for step events"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Replay a plan against a recorded result")
                .arg(plan.clone())
                .arg(
                    Arg::new("recorded")
                        .long("recorded")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Recorded result or response envelope"),
                ),
        )
        .subcommand(
            Command::new("hash")
                .about("Print the canonical plan and its hash")
                .arg(plan.clone()),
        )
        .subcommand(
            Command::new("run")
                .about("Create and execute a run with retries")
                .arg(plan)
                .arg(
                    Arg::new("agent-id")
                        .long("agent-id")
                        .default_value("cli")
                        .help("Agent owning the run"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&source).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn plan_arg(args: &ArgMatches) -> Result<Value> {
    let path = args
        .get_one::<PathBuf>("plan")
        .context("--plan is required")?;
    read_json(path)
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn execute(config: &RuntimeConfig, args: &ArgMatches) -> Result<ExitCode> {
    let plan = plan_arg(args)?;
    let max_steps = args
        .get_one::<i64>("max-steps")
        .copied()
        .unwrap_or(config.default_max_steps);
    let mut options = ExecuteOptions::default()
        .with_mode(ExecutionMode::Mock)
        .with_max_steps(max_steps);
    if let Some(trace_id) = args.get_one::<String>("trace-id") {
        options = options.with_trace_id(trace_id.clone());
    }

    let response = Executor::new().execute_deterministic_plan(&plan, &options);
    print(&response)?;
    Ok(exit_code(response.is_ok()))
}

fn verify(args: &ArgMatches) -> Result<ExitCode> {
    let plan = plan_arg(args)?;
    let path = args
        .get_one::<PathBuf>("recorded")
        .context("--recorded is required")?;
    let raw = read_json(path)?;

    let recorded: AgentExecutionResult =
        match serde_json::from_value::<DeterministicResponse<AgentExecutionResult>>(raw.clone()) {
            Ok(envelope) => envelope
                .into_result()
                .map_err(|err| anyhow::anyhow!("recorded envelope is a failure: {err}"))?,
            Err(_) => serde_json::from_value(raw)
                .with_context(|| format!("{} is not a recorded execution", path.display()))?,
        };

    let verification = verify_execution_replay(&plan, &recorded);
    print(&verification)?;
    Ok(exit_code(verification.is_ok()))
}

fn hash(args: &ArgMatches) -> Result<ExitCode> {
    let raw = plan_arg(args)?;
    match canonicalize(&raw) {
        Ok(plan) => {
            let hash = plan_hash(&plan)?;
            print(&json!({ "ok": true, "planHash": hash, "plan": plan }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print(&json!({ "ok": false, "message": err.to_string(), "issues": err.issues() }))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(config: RuntimeConfig, args: &ArgMatches) -> Result<ExitCode> {
    let plan = plan_arg(args)?;
    let agent_id = args
        .get_one::<String>("agent-id")
        .cloned()
        .unwrap_or_else(|| "cli".to_owned());
    let request = ExecuteRequest::new(plan).with_max_steps(config.default_max_steps);

    let service = RunService::new(config);
    let created = service.create_run(CreateRunRequest::new(agent_id));
    let record = service
        .execute_run_async(created.run_id.as_str(), &request)
        .await?;
    print(&record)?;
    Ok(exit_code(record.status == RunStatus::Completed))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    match matches.subcommand() {
        Some(("execute", args)) => execute(&config, args),
        Some(("verify", args)) => verify(args),
        Some(("hash", args)) => hash(args),
        Some(("run", args)) => run(config, args).await,
        _ => Ok(ExitCode::FAILURE),
    }
}

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hccl_runner::{
    Collaborators, CommandAffinity, HostEnv, LaunchError, LaunchMode, LspciProbe, Orchestrator,
    PathLocator, PreparedLaunch, PreparedRun, RunConfig, RunResult, ScriptBuild, Settings,
    TestKind, TracingReporter, WorkerStatus,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "run-hccl-demo", version = "0.3.0", about = "HCCL demo launcher")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Test to run (see list-tests)
    #[arg(long, default_value = "broadcast")]
    test: String,
    /// Number of ranks in the communicator
    #[arg(long, allow_negative_numbers = true)]
    nranks: Option<i64>,
    /// Number of ranks on this node; defaults to the number of devices found
    #[arg(long = "ranks-per-node", alias = "ranks_per_node", allow_negative_numbers = true)]
    ranks_per_node: Option<i64>,
    /// Index of this host, 0..num_nodes
    #[arg(long = "node-id", alias = "node_id", allow_negative_numbers = true)]
    node_id: Option<i64>,
    /// Data size in G, M, K, B or plain bytes
    #[arg(long, default_value = "33554432")]
    size: String,
    /// Number of loop iterations
    #[arg(long = "loop", default_value_t = 10)]
    loop_count: u32,
    /// Root rank for broadcast and reduce
    #[arg(long = "test-root", alias = "test_root", default_value_t = 0)]
    test_root: u32,
    /// File for results output
    #[arg(long = "csv-path", alias = "csv_path", default_value = "")]
    csv_path: String,
    /// Hand process launch and rank assignment to mpirun
    #[arg(long)]
    mpi: bool,
    /// Remove old logs, recipes, csv results and rebuild
    #[arg(long)]
    clean: bool,
    /// Suppress known benign MPI warnings
    #[arg(long = "ignore-mpi-errors", alias = "ignore_mpi_errors")]
    ignore_mpi_errors: bool,
    /// YAML file overriding installation settings
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    /// Extra mpirun arguments, given after `--`
    #[arg(last = true)]
    mpi_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the demo
    Run(RunArgs),
    /// Show the commands a run would launch, without launching them
    Plan(RunArgs),
    ListTests {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            let launch_err = err.downcast_ref::<LaunchError>();
            let exit_code = launch_err.map(|e| e.exit_code()).unwrap_or(1);
            tracing::error!(
                stage = launch_err.map(|e| e.stage()).unwrap_or("main"),
                exit_code,
                "hccl demo error: {:#}",
                err
            );
            if json_mode {
                let details = match launch_err {
                    Some(e) => json!({ "stage": e.stage(), "commands": e.commands() }),
                    None => json!({}),
                };
                let code = launch_err.map(|e| e.code()).unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), details));
            } else {
                eprintln!("hccl demo error: {:#}", err);
                eprintln!("exiting hccl demo with code: {}", exit_code);
            }
            std::process::exit(exit_code);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run(args) => {
            let settings = load_settings(&args)?;
            let cfg = run_config(&args)?;
            let host = HostEnv::capture();
            let result = with_orchestrator(&cfg, &settings, &host, |o| o.run())?;
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "config": serde_json::to_value(&cfg)?,
                    "run": serde_json::to_value(&result)?,
                })));
            }
            print_result(&result);
        }
        Commands::Plan(args) => {
            let settings = load_settings(&args)?;
            let cfg = run_config(&args)?;
            let host = HostEnv::capture();
            let prepared = with_orchestrator(&cfg, &settings, &host, |o| o.prepare())?;
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "plan": prepared_to_json(&prepared),
                })));
            }
            print_prepared(&prepared);
        }
        Commands::ListTests { json } => {
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list-tests",
                    "tests": TestKind::catalogue(),
                })));
            }
            println!("tests list:");
            for test in TestKind::catalogue() {
                println!("{}", test);
            }
        }
    }
    Ok(None)
}

fn load_settings(args: &RunArgs) -> Result<Settings> {
    Ok(match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    })
}

fn run_config(args: &RunArgs) -> Result<RunConfig> {
    let test: TestKind = args.test.parse()?;
    let mode = if args.mpi {
        LaunchMode::Mpi
    } else {
        LaunchMode::Local
    };
    Ok(RunConfig {
        test,
        nranks: args.nranks,
        ranks_per_node: args.ranks_per_node,
        node_id: args.node_id,
        size: args.size.clone(),
        loop_count: args.loop_count,
        test_root: args.test_root,
        csv_path: args.csv_path.clone(),
        mode,
        mpi_args: args.mpi_args.clone(),
        ignore_mpi_errors: args.ignore_mpi_errors,
        clean: args.clean,
    })
}

fn with_orchestrator<T>(
    cfg: &RunConfig,
    settings: &Settings,
    host: &HostEnv,
    f: impl FnOnce(&Orchestrator<'_>) -> hccl_runner::Result<T>,
) -> Result<T> {
    let probe = LspciProbe::new(settings.device_patterns.clone());
    let affinity = CommandAffinity::new(settings.affinity_command.clone(), settings.working_dir.clone());
    let locator = PathLocator::from_host(host);
    let build = ScriptBuild::from_settings(settings);
    let reporter = TracingReporter;
    let orchestrator = Orchestrator::new(
        cfg,
        settings,
        host,
        Collaborators {
            probe: &probe,
            affinity: &affinity,
            locator: &locator,
            build: &build,
        },
        &reporter,
    );
    Ok(f(&orchestrator)?)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run(args) | Commands::Plan(args) => args.json,
        Commands::ListTests { json } => *json,
    }
}

fn status_label(status: &WorkerStatus) -> String {
    match status {
        WorkerStatus::Success => "success".to_string(),
        WorkerStatus::Exited { code } => format!("exited with code {}", code),
        WorkerStatus::Signaled { signal } => format!("killed by signal {}", signal),
        WorkerStatus::SpawnFailed { message } => format!("failed to start: {}", message),
        WorkerStatus::Aborted => "aborted".to_string(),
        WorkerStatus::NotStarted => "not started".to_string(),
    }
}

fn print_result(result: &RunResult) {
    println!("mode: {}", result.mode.as_str());
    println!("state: {:?}", result.state);
    for worker in &result.workers {
        match worker.rank {
            Some(rank) => println!("rank {}: {}", rank, status_label(&worker.status)),
            None => println!("mpi: {}", status_label(&worker.status)),
        }
    }
    println!("started_at: {}", result.started_at);
    println!("finished_at: {}", result.finished_at);
}

fn prepared_to_json(prepared: &PreparedRun) -> Value {
    let (mode, plan) = match &prepared.launch {
        PreparedLaunch::Local { plan, .. } => ("local", json!(plan)),
        PreparedLaunch::Mpi { .. } => ("mpi", Value::Null),
    };
    json!({
        "mode": mode,
        "size_bytes": prepared.size_bytes,
        "dev_env": prepared.dev_env,
        "ranks": plan,
        "commands": prepared.commands().iter().map(|c| c.render()).collect::<Vec<_>>(),
    })
}

fn print_prepared(prepared: &PreparedRun) {
    if let PreparedLaunch::Local { plan, .. } = &prepared.launch {
        println!("node_id: {}", plan.node_id);
        println!("nranks: {}", plan.nranks);
        println!("ranks_per_node: {}", plan.ranks_per_node);
        println!("local_processes: {}", plan.local_processes);
    }
    println!("size_bytes: {}", prepared.size_bytes);
    println!("dev_env: {}", prepared.dev_env);
    for command in prepared.commands() {
        println!("command: {}", command.render());
    }
}

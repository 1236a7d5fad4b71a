use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};
use sweep_runner::{Decision, ProcessLauncher, SweepPlan};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "zkbench-sweep",
    version = "0.1.0",
    about = "Sweep zkVM benchmarks across programs, provers, hash functions and shard sizes"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every non-skipped combination through the harness.
    Run {
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long)]
        trials: Option<usize>,
        /// Directory the harness is launched from.
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print each combination and what would happen to it, without running anything.
    Describe {
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long)]
        trials: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Write the built-in plan as YAML.
    Init {
        #[arg(long, default_value = "sweep.yaml")]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        plan: None,
        trials: None,
        workdir: None,
        json: false,
    });
    let json_mode = command_json_mode(&command);
    let details = command_details(&command);
    let result = run_command(command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(io::stderr)
        .with_env_filter(env_filter)
        .init();
}

fn load_plan(path: Option<&Path>, trials: Option<usize>) -> Result<SweepPlan> {
    let mut plan = match path {
        Some(path) => SweepPlan::load(path)?,
        None => SweepPlan::default(),
    };
    if let Some(trials) = trials {
        plan.trials = trials;
    }
    Ok(plan)
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            plan,
            trials,
            workdir,
            json,
        } => {
            let plan = load_plan(plan.as_deref(), trials)?;
            let mut launcher = ProcessLauncher::new(workdir);
            if json {
                let mut progress = io::stderr();
                let report =
                    sweep_runner::run_sweep_with_output(&plan, &mut launcher, &mut progress)?;
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": report,
                })));
            }
            let report = sweep_runner::run_sweep(&plan, &mut launcher)?;
            println!("sweep_id: {}", report.sweep_id);
            println!("invocations: {}", report.summary.invocations);
        }
        Commands::Describe { plan, trials, json } => {
            let plan = load_plan(plan.as_deref(), trials)?;
            let planned = sweep_runner::plan_sweep(&plan);
            let summary = sweep_runner::describe_sweep(&plan);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                    "combinations": planned,
                })));
            }
            for entry in &planned {
                match &entry.decision {
                    Decision::Run { invocation } => println!(
                        "run  {} -> {}={} {}",
                        entry.combination,
                        invocation.env_key,
                        invocation.env_value,
                        invocation.command_line().join(" ")
                    ),
                    Decision::Skip { reason } => {
                        println!("skip {} ({})", entry.combination, reason)
                    }
                }
            }
            println!("combinations: {}", summary.combinations);
            println!("runnable: {}", summary.runnable);
            println!("skipped: {}", summary.skipped);
            println!("trials: {}", summary.trials);
            println!("invocations: {}", summary.invocations);
        }
        Commands::Init { out, force } => {
            if !force && out.exists() {
                return Err(anyhow::anyhow!(
                    "plan file already exists (use --force): {}",
                    out.display()
                ));
            }
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, SweepPlan::default().to_yaml()?)?;
            println!("wrote {}", out.display());
            println!("next: zkbench-sweep describe --plan {}", out.display());
        }
    }
    Ok(None)
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
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn command_details(command: &Commands) -> Value {
    match command {
        Commands::Run { plan, trials, .. } => json!({
            "command": "run",
            "plan": plan.as_ref().map(|p| p.display().to_string()),
            "trials": trials,
        }),
        Commands::Describe { plan, trials, .. } => json!({
            "command": "describe",
            "plan": plan.as_ref().map(|p| p.display().to_string()),
            "trials": trials,
        }),
        Commands::Init { out, .. } => json!({
            "command": "init",
            "out": out.display().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_means_default_run() {
        let cli = Cli::try_parse_from(["zkbench-sweep"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "zkbench-sweep",
            "run",
            "--plan",
            "sweep.yaml",
            "--trials",
            "3",
            "--json",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Run {
                plan, trials, json, ..
            }) => {
                assert_eq!(plan, Some(PathBuf::from("sweep.yaml")));
                assert_eq!(trials, Some(3));
                assert!(json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn trials_flag_overrides_plan() {
        let plan = load_plan(None, Some(4)).expect("plan");
        assert_eq!(plan.trials, 4);
        assert_eq!(plan.programs, SweepPlan::default().programs);
    }

    #[test]
    fn failed_describe_reports_plan_path() {
        let missing = std::env::temp_dir().join(format!(
            "zkbench_sweep_cli_missing_{}.yaml",
            std::process::id()
        ));
        let command = Commands::Describe {
            plan: Some(missing.clone()),
            trials: Some(2),
            json: true,
        };
        let details = command_details(&command);
        let err = run_command(command).expect_err("missing plan");
        let v = json_error("command_failed", err.to_string(), details);
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("command_failed"));
        assert_eq!(v["error"]["details"]["command"], json!("describe"));
        assert_eq!(
            v["error"]["details"]["plan"],
            json!(missing.display().to_string())
        );
        assert_eq!(v["error"]["details"]["trials"], json!(2));
        assert!(v["error"]["message"]
            .as_str()
            .expect("message")
            .contains("failed to read sweep plan"));
    }
}

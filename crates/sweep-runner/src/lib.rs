use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use itertools::iproduct;
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

pub mod plan;

pub use plan::{InputFamily, PlanError, ProverRestriction, ReplayAlias, SweepPlan};

/// One point of the cartesian product of the plan's option sets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Combination {
    pub program: String,
    pub prover: String,
    pub hashfn: String,
    pub shard_size: u32,
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}",
            self.program, self.prover, self.hashfn, self.shard_size
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SkipReason {
    ShardSizeUnsupported { prover: String, reference: u32 },
    ProverUnsupported { program: String, prover_prefix: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ShardSizeUnsupported { prover, reference } => write!(
                f,
                "{} only runs with the reference shard size {}",
                prover, reference
            ),
            SkipReason::ProverUnsupported {
                program,
                prover_prefix,
            } => write!(f, "{} requires a {} prover", program, prover_prefix),
        }
    }
}

/// Shell used to run the harness script.
pub const HARNESS_INTERPRETER: &str = "bash";

/// A single harness call: `bash <harness> <args...>` with one extra
/// environment variable on top of the inherited environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub harness: PathBuf,
    pub args: Vec<String>,
    pub env_key: String,
    pub env_value: String,
}

impl Invocation {
    pub fn command_line(&self) -> Vec<String> {
        let mut parts = vec![
            HARNESS_INTERPRETER.to_string(),
            self.harness.to_string_lossy().to_string(),
        ];
        parts.extend(self.args.iter().cloned());
        parts
    }

    fn to_command(&self, working_dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(HARNESS_INTERPRETER);
        cmd.arg(&self.harness);
        cmd.args(&self.args);
        cmd.env(&self.env_key, &self.env_value);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Run { invocation: Invocation },
    Skip { reason: SkipReason },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedCombination {
    pub combination: Combination,
    pub decision: Decision,
}

/// Runs one invocation to completion and reports how it ended. The status is
/// informational only; the sweep never acts on it.
pub trait Launcher {
    fn launch(&mut self, invocation: &Invocation) -> Result<String>;
}

pub struct ProcessLauncher {
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, invocation: &Invocation) -> Result<String> {
        let mut cmd = invocation.to_command(self.working_dir.as_deref());
        let status = cmd.status().map_err(|e| {
            anyhow!(
                "failed to launch harness {}: {}",
                invocation.harness.display(),
                e
            )
        })?;
        Ok(status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SweepSummary {
    pub combinations: usize,
    pub runnable: usize,
    pub skipped: usize,
    pub trials: usize,
    pub invocations: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SweepReport {
    pub sweep_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: SweepSummary,
}

/// Nested iteration over the option sets, programs outermost and shard sizes
/// innermost.
pub fn combinations(plan: &SweepPlan) -> Vec<Combination> {
    iproduct!(
        plan.programs.iter(),
        plan.provers.iter(),
        plan.hashfns.iter(),
        plan.shard_sizes.iter()
    )
    .map(|(program, prover, hashfn, shard_size)| Combination {
        program: program.clone(),
        prover: prover.clone(),
        hashfn: hashfn.clone(),
        shard_size: *shard_size,
    })
    .collect()
}

pub fn check_exclusions(plan: &SweepPlan, combination: &Combination) -> Option<SkipReason> {
    if plan.shard_size_rule && !plan.supports_shard_sizes(&combination.prover) {
        if let Some(reference) = plan.reference_shard_size() {
            if combination.shard_size != reference {
                return Some(SkipReason::ShardSizeUnsupported {
                    prover: combination.prover.clone(),
                    reference,
                });
            }
        }
    }
    if let Some(prefix) = plan.required_prover_prefix(&combination.program) {
        if !combination.prover.starts_with(prefix) {
            return Some(SkipReason::ProverUnsupported {
                program: combination.program.clone(),
                prover_prefix: prefix.to_string(),
            });
        }
    }
    None
}

pub fn build_invocation(plan: &SweepPlan, combination: &Combination) -> Invocation {
    let shard_size = combination.shard_size.to_string();
    let alias = plan.replay_alias(&combination.program);
    let program = alias
        .map(|a| a.program.clone())
        .unwrap_or_else(|| combination.program.clone());

    let mut args = vec![
        program,
        combination.prover.clone(),
        combination.hashfn.clone(),
        shard_size.clone(),
        plan.filename.clone(),
    ];
    if let Some(alias) = alias {
        args.push(alias.block.clone());
    } else if let Some(family) = plan.input_family(&combination.program) {
        args.push(family.program_file.clone());
        args.push(family.input_file.clone());
    }

    Invocation {
        harness: plan.harness.clone(),
        args,
        env_key: plan.shard_size_env.clone(),
        env_value: shard_size,
    }
}

pub fn plan_sweep(plan: &SweepPlan) -> Vec<PlannedCombination> {
    combinations(plan)
        .into_iter()
        .map(|combination| {
            let decision = match check_exclusions(plan, &combination) {
                Some(reason) => Decision::Skip { reason },
                None => Decision::Run {
                    invocation: build_invocation(plan, &combination),
                },
            };
            PlannedCombination {
                combination,
                decision,
            }
        })
        .collect()
}

pub fn describe_sweep(plan: &SweepPlan) -> SweepSummary {
    summarize(plan, &plan_sweep(plan))
}

fn summarize(plan: &SweepPlan, planned: &[PlannedCombination]) -> SweepSummary {
    let runnable = planned
        .iter()
        .filter(|p| matches!(p.decision, Decision::Run { .. }))
        .count();
    SweepSummary {
        combinations: planned.len(),
        runnable,
        skipped: planned.len() - runnable,
        trials: plan.trials,
        invocations: runnable * plan.trials,
    }
}

pub fn run_sweep(plan: &SweepPlan, launcher: &mut dyn Launcher) -> Result<SweepReport> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_sweep_with_output(plan, launcher, &mut out)
}

/// Like [`run_sweep`], writing the per-combination lines to `out`.
pub fn run_sweep_with_output<W: Write>(
    plan: &SweepPlan,
    launcher: &mut dyn Launcher,
    out: &mut W,
) -> Result<SweepReport> {
    let started_at = Utc::now();
    let sweep_id = format!("sweep_{}", started_at.format("%Y%m%d_%H%M%S"));
    let planned = plan_sweep(plan);
    info!(
        sweep_id = %sweep_id,
        combinations = planned.len(),
        trials = plan.trials,
        "starting sweep"
    );

    for entry in &planned {
        match &entry.decision {
            Decision::Skip { reason } => {
                writeln!(out, "Skipping: {} ({})", entry.combination, reason)?;
                warn!(combination = %entry.combination, %reason, "combination skipped");
            }
            Decision::Run { invocation } => {
                writeln!(out, "Running: {}", entry.combination)?;
                out.flush()?;
                for trial in 1..=plan.trials {
                    debug!(
                        trial,
                        command = %invocation.command_line().join(" "),
                        "launching harness"
                    );
                    let status = launcher.launch(invocation)?;
                    debug!(trial, %status, "harness exited");
                }
            }
        }
    }

    let summary = summarize(plan, &planned);
    info!(
        sweep_id = %sweep_id,
        runnable = summary.runnable,
        skipped = summary.skipped,
        invocations = summary.invocations,
        "sweep finished"
    );
    Ok(SweepReport {
        sweep_id,
        started_at,
        finished_at: Utc::now(),
        summary,
    })
}

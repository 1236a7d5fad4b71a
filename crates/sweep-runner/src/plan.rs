use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Everything the sweep needs to know: the four option sets plus the tables
/// that decide which combinations are skipped and which get extra arguments.
///
/// Fields omitted from a YAML plan fall back to [`SweepPlan::default`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepPlan {
    pub programs: Vec<String>,
    pub provers: Vec<String>,
    pub hashfns: Vec<String>,
    /// Log2 shard sizes. The first entry is the reference size for provers
    /// that cannot vary it.
    pub shard_sizes: Vec<u32>,
    pub trials: usize,
    pub filename: String,
    pub harness: PathBuf,
    pub shard_size_env: String,
    pub shard_size_rule: bool,
    pub shard_size_provers: Vec<String>,
    pub restrictions: Vec<ProverRestriction>,
    pub replay_aliases: Vec<ReplayAlias>,
    pub input_families: Vec<InputFamily>,
}

/// Programs that only run on provers whose name starts with `prover_prefix`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProverRestriction {
    pub programs: Vec<String>,
    pub prover_prefix: String,
}

/// A program name that stands for `program` replayed at a fixed block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayAlias {
    pub alias: String,
    pub program: String,
    pub block: String,
}

/// Programs sharing `prefix` read their source and input from these files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputFamily {
    pub prefix: String,
    pub program_file: String,
    pub input_file: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("harness path is empty")]
    EmptyHarness,
    #[error("shard_size_env is empty")]
    EmptyShardSizeEnv,
    #[error("replay alias '{0}' has no target program")]
    EmptyAliasTarget(String),
    #[error("input family prefix is empty")]
    EmptyFamilyPrefix,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            programs: strings(&["loop", "fibonacci", "tendermint", "keccak"]),
            provers: strings(&["sp1", "risc0", "powdr-plonky3"]),
            hashfns: strings(&["poseidon"]),
            shard_sizes: vec![20],
            trials: 1,
            filename: "benchmark".to_string(),
            harness: PathBuf::from("eval.sh"),
            shard_size_env: "MAX_DEGREE_LOG".to_string(),
            shard_size_rule: true,
            shard_size_provers: strings(&["sp1", "powdr-plonky3"]),
            restrictions: vec![ProverRestriction {
                programs: strings(&["brainfuck-asm", "brainfuck-compiler"]),
                prover_prefix: "powdr".to_string(),
            }],
            replay_aliases: vec![
                ReplayAlias {
                    alias: "reth1".to_string(),
                    program: "reth".to_string(),
                    block: "17106222".to_string(),
                },
                ReplayAlias {
                    alias: "reth2".to_string(),
                    program: "reth".to_string(),
                    block: "19409768".to_string(),
                },
            ],
            input_families: vec![InputFamily {
                prefix: "brainfuck".to_string(),
                program_file: "programs/brainfuck/bf/primes.bf".to_string(),
                input_file: "programs/brainfuck/bf/primes.in".to_string(),
            }],
        }
    }
}

impl SweepPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read sweep plan {}: {}", path.display(), e))?;
        let plan = Self::from_yaml(&raw)
            .map_err(|e| anyhow!("invalid sweep plan {}: {}", path.display(), e))?;
        Ok(plan)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let plan: SweepPlan = serde_yaml::from_str(raw)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> std::result::Result<(), PlanError> {
        if self.harness.as_os_str().is_empty() {
            return Err(PlanError::EmptyHarness);
        }
        if self.shard_size_env.is_empty() {
            return Err(PlanError::EmptyShardSizeEnv);
        }
        if let Some(alias) = self.replay_aliases.iter().find(|a| a.program.is_empty()) {
            return Err(PlanError::EmptyAliasTarget(alias.alias.clone()));
        }
        if self.input_families.iter().any(|f| f.prefix.is_empty()) {
            return Err(PlanError::EmptyFamilyPrefix);
        }
        Ok(())
    }

    pub fn reference_shard_size(&self) -> Option<u32> {
        self.shard_sizes.first().copied()
    }

    pub fn supports_shard_sizes(&self, prover: &str) -> bool {
        self.shard_size_provers.iter().any(|p| p == prover)
    }

    /// The prefix a prover must carry to run `program`, if the program is
    /// restricted at all.
    pub fn required_prover_prefix(&self, program: &str) -> Option<&str> {
        self.restrictions
            .iter()
            .find(|r| r.programs.iter().any(|p| p == program))
            .map(|r| r.prover_prefix.as_str())
    }

    pub fn replay_alias(&self, program: &str) -> Option<&ReplayAlias> {
        self.replay_aliases.iter().find(|a| a.alias == program)
    }

    pub fn input_family(&self, program: &str) -> Option<&InputFamily> {
        self.input_families
            .iter()
            .find(|f| program.starts_with(f.prefix.as_str()))
    }
}

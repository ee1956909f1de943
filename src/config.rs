//! Engine configuration, read from TOML.

use crate::ProfitYear;
use crate::codes::VestingPlan;
use crate::error::Result as ReconcileResult;
use crate::vesting::{ScheduleDetail, VestingSchedules};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_ENV: &str = "PSLEDGER_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Years-in-plan given to beneficiary-only members so they always clear
    /// the tenure gate.
    #[serde(default = "default_beneficiary_years_in_plan")]
    pub beneficiary_years_in_plan: u8,

    /// Archived report the recomputed totals are checked against.
    #[serde(default = "default_report_type")]
    pub report_type: String,

    /// Archived report that states its own ending balance.
    #[serde(default = "default_statement_report_type")]
    pub statement_report_type: String,

    /// Settle SSN partitions on the rayon pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    #[serde(default = "default_max_reversal_batch")]
    pub max_reversal_batch: usize,

    /// Years up to and including this one are frozen against reversals.
    #[serde(default)]
    pub frozen_through: Option<ProfitYear>,

    #[serde(default)]
    pub vesting: VestingOverrides,
}

fn default_beneficiary_years_in_plan() -> u8 {
    10
}

fn default_report_type() -> String {
    "TerminatedEmployees".to_string()
}

fn default_statement_report_type() -> String {
    "PAY444".to_string()
}

fn default_parallel() -> bool {
    true
}

fn default_max_reversal_batch() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            beneficiary_years_in_plan: default_beneficiary_years_in_plan(),
            report_type: default_report_type(),
            statement_report_type: default_statement_report_type(),
            parallel: default_parallel(),
            max_reversal_batch: default_max_reversal_batch(),
            frozen_through: None,
            vesting: VestingOverrides::default(),
        }
    }
}

/// Replaces a plan's schedule outright. Old plan takes 7 steps, new plan 6.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingOverrides {
    #[serde(default)]
    pub old_plan: Option<Vec<u8>>,
    #[serde(default)]
    pub new_plan: Option<Vec<u8>>,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Reads the file named by `PSLEDGER_CONFIG`. Defaults apply only when the
    /// variable is unset; a named file that cannot be read or parsed is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_path_var(std::env::var_os(CONFIG_ENV))
    }

    fn from_path_var(path: Option<std::ffi::OsString>) -> Result<Self> {
        match path {
            None => {
                log::debug!("{CONFIG_ENV} not set; using default config");
                Ok(Self::default())
            }
            Some(path) => Self::load(&path)
                .with_context(|| format!("{CONFIG_ENV} names an unusable config")),
        }
    }

    /// Reference rows if any were supplied, else the standard tables, then
    /// any configured overrides on top.
    pub fn schedules(
        &self,
        year: ProfitYear,
        details: &[ScheduleDetail],
    ) -> ReconcileResult<VestingSchedules> {
        let base = if details.is_empty() {
            VestingSchedules::standard()
        } else {
            VestingSchedules::from_details(year, details)?
        };
        if self.vesting.old_plan.is_none() && self.vesting.new_plan.is_none() {
            return Ok(base);
        }
        let old_plan = self
            .vesting
            .old_plan
            .clone()
            .unwrap_or_else(|| base.steps(VestingPlan::Old));
        let new_plan = self
            .vesting
            .new_plan
            .clone()
            .unwrap_or_else(|| base.steps(VestingPlan::New));
        VestingSchedules::new(year, &old_plan, &new_plan)
    }
}

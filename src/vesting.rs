use crate::codes::VestingPlan;
use crate::error::{ReconcileError, Result};
use crate::members::ResolvedMember;
use crate::{Money, ProfitYear};
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};

pub const OLD_PLAN_STEPS: usize = 7;
pub const NEW_PLAN_STEPS: usize = 6;

/// One row of the reference schedule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScheduleDetail {
    pub plan: VestingPlan,
    pub years_of_service: u8,
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VestingSchedules {
    old_plan: [u8; OLD_PLAN_STEPS],
    new_plan: [u8; NEW_PLAN_STEPS],
}

impl Default for VestingSchedules {
    fn default() -> Self {
        Self::standard()
    }
}

impl VestingSchedules {
    pub fn standard() -> Self {
        Self {
            old_plan: [0, 0, 20, 40, 60, 80, 100],
            new_plan: [0, 20, 40, 60, 80, 100],
        }
    }

    pub fn new(year: ProfitYear, old_plan: &[u8], new_plan: &[u8]) -> Result<Self> {
        Ok(Self {
            old_plan: steps(year, "old plan", old_plan)?,
            new_plan: steps(year, "new plan", new_plan)?,
        })
    }

    /// Builds both schedules from reference rows. Every step of both plans must
    /// be present.
    pub fn from_details(year: ProfitYear, details: &[ScheduleDetail]) -> Result<Self> {
        let mut old_plan = [None; OLD_PLAN_STEPS];
        let mut new_plan = [None; NEW_PLAN_STEPS];
        for detail in details {
            let table: &mut [Option<u8>] = match detail.plan {
                VestingPlan::Old => &mut old_plan,
                VestingPlan::New => &mut new_plan,
            };
            let slot = usize::from(detail.years_of_service)
                .checked_sub(1)
                .and_then(|i| table.get_mut(i))
                .ok_or_else(|| ReconcileError::Configuration {
                    year,
                    reason: format!(
                        "{:?} plan has no step for {} years of service",
                        detail.plan, detail.years_of_service
                    ),
                })?;
            *slot = Some(detail.percent);
        }
        let collect = |name: &str, table: &[Option<u8>]| -> Result<Vec<u8>> {
            table
                .iter()
                .enumerate()
                .map(|(i, step)| {
                    step.ok_or_else(|| ReconcileError::Configuration {
                        year,
                        reason: format!("{name} schedule is missing year {}", i + 1),
                    })
                })
                .collect()
        };
        Self::new(
            year,
            &collect("old plan", &old_plan)?,
            &collect("new plan", &new_plan)?,
        )
    }

    pub fn steps(&self, plan: VestingPlan) -> Vec<u8> {
        match plan {
            VestingPlan::Old => self.old_plan.to_vec(),
            VestingPlan::New => self.new_plan.to_vec(),
        }
    }

    pub fn percent(&self, plan: VestingPlan, years_in_plan: u8) -> u8 {
        match plan {
            VestingPlan::Old => self.old_plan[step_index(years_in_plan, OLD_PLAN_STEPS)],
            VestingPlan::New => self.new_plan[step_index(years_in_plan, NEW_PLAN_STEPS)],
        }
    }
}

fn step_index(years_in_plan: u8, steps: usize) -> usize {
    usize::from(years_in_plan).clamp(1, steps) - 1
}

fn steps<const N: usize>(year: ProfitYear, name: &str, values: &[u8]) -> Result<[u8; N]> {
    let table: [u8; N] = values
        .try_into()
        .map_err(|_| ReconcileError::Configuration {
            year,
            reason: format!("{name} schedule needs {N} steps, got {}", values.len()),
        })?;
    if table.iter().any(|percent| *percent > 100) {
        return Err(ReconcileError::Configuration {
            year,
            reason: format!("{name} schedule exceeds 100%"),
        });
    }
    if table.windows(2).any(|pair| pair[0] > pair[1]) {
        return Err(ReconcileError::Configuration {
            year,
            reason: format!("{name} schedule decreases with tenure"),
        });
    }
    Ok(table)
}

/// Beneficiaries carry a "fully vested" marker outside the 0-100 scale; its
/// historical stored value is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VestingPercent {
    Percent(u8),
    BeneficiaryMarker,
}

impl VestingPercent {
    pub const MARKER_VALUE: u8 = 1;

    /// The value as historically stored and reported.
    pub fn stored(self) -> u8 {
        match self {
            VestingPercent::Percent(percent) => percent,
            VestingPercent::BeneficiaryMarker => Self::MARKER_VALUE,
        }
    }

    fn ratio(self) -> Money {
        match self {
            VestingPercent::Percent(percent) => Money::from(percent) / Money::ONE_HUNDRED,
            VestingPercent::BeneficiaryMarker => Money::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vesting {
    pub percent: VestingPercent,
    pub vested_balance: Money,
}

pub struct VestingCalculator {
    schedules: VestingSchedules,
}

impl VestingCalculator {
    pub fn new(schedules: VestingSchedules) -> Self {
        Self { schedules }
    }

    pub fn schedules(&self) -> &VestingSchedules {
        &self.schedules
    }

    pub fn vest(&self, member: &ResolvedMember, ending_balance: Money) -> Vesting {
        let percent = if ending_balance.is_zero() {
            VestingPercent::Percent(0)
        } else if member.is_beneficiary_only() {
            VestingPercent::BeneficiaryMarker
        } else if member.zero_contribution_reason.forces_full_vesting() {
            VestingPercent::Percent(100)
        } else {
            VestingPercent::Percent(
                self.schedules
                    .percent(member.enrollment.plan(), member.years_in_plan),
            )
        };
        let vested_balance = (ending_balance * percent.ratio())
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        Vesting {
            percent,
            vested_balance,
        }
    }
}

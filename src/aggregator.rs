use crate::classifier::{CategoryAmounts, allocation_columns, classify};
use crate::codes::VestingPlan;
use crate::error::{ReconcileError, Result};
use crate::ledger::LedgerTransaction;
use crate::members::ResolvedMember;
use crate::{Money, ProfitYear, Projector, Ssn};
use log::debug;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Why a person-year row was kept. Both gates must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inclusion {
    /// Something happened or was carried in: a beginning balance, a
    /// distribution, a forfeiture or a beneficiary allocation.
    pub interesting: bool,
    /// Tenure clears the plan minimum, or a beneficiary allocation overrides it.
    pub eligible: bool,
}

impl Inclusion {
    pub fn evaluate(member: &ResolvedMember, beginning: Money, amounts: &CategoryAmounts) -> Self {
        let allocation = amounts.beneficiary_allocation();
        let interesting = !beginning.is_zero()
            || !amounts.distributions.is_zero()
            || !amounts.forfeitures.is_zero()
            || !allocation.is_zero();
        let tenured = match member.enrollment.plan() {
            VestingPlan::Old => member.years_in_plan > 2,
            VestingPlan::New => member.years_in_plan > 1,
        };
        Self {
            interesting,
            eligible: tenured || !allocation.is_zero(),
        }
    }

    pub fn retained(&self) -> bool {
        self.interesting && self.eligible
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRecord {
    pub member: ResolvedMember,
    pub beginning_balance: Money,
    pub amounts: CategoryAmounts,
    pub ending_balance: Money,
    pub inclusion: Inclusion,
}

impl BalanceRecord {
    pub fn reconciles(&self) -> bool {
        self.ending_balance == self.beginning_balance + self.amounts.movement()
    }
}

/// Accumulates one SSN's ledger across years. Each partition owns exactly one.
#[derive(Debug, Clone)]
pub struct PartitionAccumulator {
    ssn: Ssn,
    years: BTreeMap<ProfitYear, CategoryAmounts>,
}

impl PartitionAccumulator {
    pub fn new(ssn: Ssn) -> Self {
        Self {
            ssn,
            years: BTreeMap::new(),
        }
    }

    pub fn amounts(&self, year: ProfitYear) -> CategoryAmounts {
        self.years.get(&year).copied().unwrap_or_default()
    }

    /// Chains beginning to ending balance through `years`, starting from
    /// `opening`, and keeps the rows that pass both gates.
    pub fn settle(
        self,
        members: &[&ResolvedMember],
        opening: Money,
        years: RangeInclusive<ProfitYear>,
    ) -> Result<Vec<BalanceRecord>> {
        let mut records = Vec::new();
        let mut beginning = opening;
        for year in years {
            let amounts = self.amounts(year);
            let ending = beginning + amounts.movement();
            for member in members.iter().filter(|m| m.year == year) {
                let record = BalanceRecord {
                    member: (*member).clone(),
                    beginning_balance: beginning,
                    amounts,
                    ending_balance: ending,
                    inclusion: Inclusion::evaluate(member, beginning, &amounts),
                };
                if !record.reconciles() {
                    return Err(ReconcileError::ArithmeticInvariant {
                        ssn: self.ssn,
                        year,
                        stated: record.ending_balance,
                        recomputed: record.beginning_balance + record.amounts.movement(),
                    });
                }
                if record.inclusion.retained() {
                    records.push(record);
                } else {
                    debug!(
                        "ssn {} year {year} dropped: {:?}",
                        self.ssn, record.inclusion
                    );
                }
            }
            beginning = ending;
        }
        Ok(records)
    }
}

impl Projector for PartitionAccumulator {
    fn project(&mut self, tx: &LedgerTransaction) -> Result<()> {
        if tx.ssn != self.ssn {
            return Err(ReconcileError::PartitionMismatch {
                expected: self.ssn,
                got: tx.ssn,
            });
        }
        let year = self.years.entry(tx.year).or_default();
        *year += classify(tx);
        let (contribution, earnings) = allocation_columns(tx);
        year.contributions += contribution;
        year.earnings += earnings;
        Ok(())
    }
}

/// Classifies and settles one person's partition.
pub fn aggregate_partition<'a>(
    ssn: Ssn,
    members: &[&ResolvedMember],
    transactions: impl IntoIterator<Item = &'a LedgerTransaction>,
    opening: Money,
    years: RangeInclusive<ProfitYear>,
) -> Result<Vec<BalanceRecord>> {
    let mut accumulator = PartitionAccumulator::new(ssn);
    for tx in transactions {
        accumulator.project(tx)?;
    }
    accumulator.settle(members, opening, years)
}

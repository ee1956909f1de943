//! Maps a ledger row to signed amounts across the six financial categories.

use crate::codes::ProfitCode;
use crate::ledger::LedgerTransaction;
use crate::Money;
use std::ops::{Add, AddAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Contribution,
    Earnings,
    Forfeiture,
    Distribution,
    AllocationIn,
    AllocationOut,
}

/// Which amount column of the row a code reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Contribution,
    Earnings,
    Forfeiture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Add,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    pub source: FieldSource,
    pub sign: Sign,
}

const fn row(category: Category, source: FieldSource, sign: Sign) -> Classification {
    Classification {
        category,
        source,
        sign,
    }
}

/// The code table. Every code reads the forfeiture column except incoming QDRO
/// (contribution) and 100%-vested earnings (earnings).
pub const fn classification(code: ProfitCode) -> Classification {
    use Category as C;
    use FieldSource as F;
    match code {
        ProfitCode::IncomingContributions => row(C::Forfeiture, F::Forfeiture, Sign::Add),
        ProfitCode::OutgoingPartialWithdrawal => row(C::Distribution, F::Forfeiture, Sign::Negate),
        ProfitCode::OutgoingForfeitures => row(C::Forfeiture, F::Forfeiture, Sign::Negate),
        ProfitCode::OutgoingDirectPayments => row(C::Distribution, F::Forfeiture, Sign::Negate),
        ProfitCode::OutgoingXferBeneficiary => row(C::AllocationOut, F::Forfeiture, Sign::Negate),
        ProfitCode::IncomingQdroBeneficiary => row(C::AllocationIn, F::Contribution, Sign::Add),
        ProfitCode::Incoming100PercentVestedEarnings => row(C::Earnings, F::Earnings, Sign::Add),
        ProfitCode::Outgoing100PercentVestedPayment => {
            row(C::Distribution, F::Forfeiture, Sign::Negate)
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CategoryAmounts {
    pub contributions: Money,
    pub earnings: Money,
    pub forfeitures: Money,
    pub distributions: Money,
    pub allocations_in: Money,
    pub allocations_out: Money,
}

impl CategoryAmounts {
    pub fn get(&self, category: Category) -> Money {
        match category {
            Category::Contribution => self.contributions,
            Category::Earnings => self.earnings,
            Category::Forfeiture => self.forfeitures,
            Category::Distribution => self.distributions,
            Category::AllocationIn => self.allocations_in,
            Category::AllocationOut => self.allocations_out,
        }
    }

    fn slot(&mut self, category: Category) -> &mut Money {
        match category {
            Category::Contribution => &mut self.contributions,
            Category::Earnings => &mut self.earnings,
            Category::Forfeiture => &mut self.forfeitures,
            Category::Distribution => &mut self.distributions,
            Category::AllocationIn => &mut self.allocations_in,
            Category::AllocationOut => &mut self.allocations_out,
        }
    }

    /// Net beneficiary allocation; `allocations_out` is already negative.
    pub fn beneficiary_allocation(&self) -> Money {
        self.allocations_in + self.allocations_out
    }

    /// What moves the ending balance: forfeitures, distributions and net allocation.
    pub fn movement(&self) -> Money {
        self.forfeitures + self.distributions + self.beneficiary_allocation()
    }
}

impl AddAssign for CategoryAmounts {
    fn add_assign(&mut self, other: Self) {
        self.contributions += other.contributions;
        self.earnings += other.earnings;
        self.forfeitures += other.forfeitures;
        self.distributions += other.distributions;
        self.allocations_in += other.allocations_in;
        self.allocations_out += other.allocations_out;
    }
}

impl Add for CategoryAmounts {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

pub fn classify(tx: &LedgerTransaction) -> CategoryAmounts {
    let rule = classification(tx.code);
    let value = match rule.source {
        FieldSource::Contribution => tx.contribution,
        FieldSource::Earnings => tx.earnings,
        FieldSource::Forfeiture => tx.forfeiture,
    };
    let mut amounts = CategoryAmounts::default();
    *amounts.slot(rule.category) = match rule.sign {
        Sign::Add => value,
        Sign::Negate => -value,
    };
    amounts
}

/// Year-end allocation columns posted alongside an incoming-contribution row.
/// They feed the contribution and earnings totals of the balance statement but
/// never the ending balance.
pub fn allocation_columns(tx: &LedgerTransaction) -> (Money, Money) {
    match tx.code {
        ProfitCode::IncomingContributions => (tx.contribution, tx.earnings),
        _ => (Money::ZERO, Money::ZERO),
    }
}

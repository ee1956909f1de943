use crate::error::Result;
use crate::ledger::LedgerTransaction;
use rust_decimal::Decimal;

pub mod aggregator;
pub mod checksum;
pub mod classifier;
pub mod codes;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod ledger_store;
pub mod members;
pub mod source;
pub mod validation;
pub mod vesting;
#[cfg(test)]
mod tests;

pub type Ssn = u32;
pub type BadgeNumber = u32;
pub type PsnSuffix = u16;
pub type ProfitYear = i16;
pub type TransactionID = u64;
pub type RunID = u32;
pub type Money = Decimal;

pub trait Projector {
    fn project(&mut self, tx: &LedgerTransaction) -> Result<()>;
}

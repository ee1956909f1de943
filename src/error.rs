use crate::{BadgeNumber, Money, ProfitYear, PsnSuffix, Ssn, TransactionID};
use std::collections::BTreeMap;
use thiserror::Error;

/// Failures that stop a run. Person-level problems never show up here; they are
/// collected as [`MissingReference`] values and the batch carries on.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("configuration incomplete for profit year {year}: {reason}")]
    Configuration { year: ProfitYear, reason: String },

    #[error(
        "ending balance does not reconcile for ssn {ssn} year {year}: \
         stated {stated}, recomputed {recomputed}"
    )]
    ArithmeticInvariant {
        ssn: Ssn,
        year: ProfitYear,
        stated: Money,
        recomputed: Money,
    },

    #[error("run cancelled; partial results discarded")]
    Cancelled,

    #[error("unknown {table} code {raw:?}")]
    UnknownCode { table: &'static str, raw: String },

    #[error("reversal batch rejected: {0}")]
    Reversal(ReversalRejection),

    #[error("duplicate transaction id {0}")]
    DuplicateTransaction(TransactionID),

    #[error("transaction for ssn {got} projected into partition for ssn {expected}")]
    PartitionMismatch { expected: Ssn, got: Ssn },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn summarize(errors: &BTreeMap<TransactionID, Vec<String>>) -> String {
    errors
        .iter()
        .map(|(id, reasons)| format!("#{id}: {}", reasons.join("; ")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a reversal batch was refused. Nothing from a refused batch is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReversalRejection {
    /// The batch as a whole is unusable: empty or over the size limit.
    #[error("{0}")]
    Batch(String),
    /// Every failing row with all of its reasons.
    #[error("{}", summarize(.0))]
    Rows(BTreeMap<TransactionID, Vec<String>>),
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

/// A single record that could not be resolved. Skipped and logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MissingReference {
    #[error("beneficiary {badge}/{psn_suffix} (ssn {ssn}) has no employee link")]
    UnlinkedBeneficiary {
        badge: BadgeNumber,
        psn_suffix: PsnSuffix,
        ssn: Ssn,
    },

    #[error("ssn {ssn} year {year}: enrollment code {raw} has no vesting schedule")]
    NoVestingSchedule { ssn: Ssn, year: ProfitYear, raw: u8 },

    #[error("ssn {ssn} year {year}: zero-contribution reason {raw} is not a known code")]
    UnknownZeroContributionReason { ssn: Ssn, year: ProfitYear, raw: u8 },

    #[error("ssn {ssn} year {year}: termination code {raw:?} is not a known code")]
    UnknownTerminationCode { ssn: Ssn, year: ProfitYear, raw: char },
}

/// A reconciliation rule that did not hold. Reported for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{rule} failed for profit year {year}: expected {expected}, got {actual} (variance {variance})")]
pub struct DataIntegrityError {
    pub rule: String,
    pub year: ProfitYear,
    pub expected: Money,
    pub actual: Money,
    pub variance: Money,
}

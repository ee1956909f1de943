use crate::codes::{CommentType, CommentTypeId, ProfitCode, ProfitCodeId};
use crate::error::{ReconcileError, Result};
use crate::{Money, ProfitYear, RunID, Ssn, TransactionID};
use serde::{Deserialize, Serialize};

/// One immutable ledger row. Belongs to exactly one (ssn, year).
///
/// `forfeiture` is overloaded: besides forfeitures it carries distribution and
/// transfer-out amounts. Which field a code reads is decided by the classifier
/// table, never here.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTransaction {
    pub id: TransactionID,
    pub ssn: Ssn,
    pub year: ProfitYear,
    pub code: ProfitCode,
    pub contribution: Money,
    pub earnings: Money,
    pub forfeiture: Money,
    pub federal_taxes: Money,
    pub state_taxes: Money,
    pub years_of_service_credit: i8,
    pub month_to_date: u8,
    pub tax_code: Option<char>,
    pub comment: Option<CommentType>,
    pub remark: Option<String>,
    pub run_id: Option<RunID>,
}

/// Storage shape of a ledger row, as read from and written to CSV.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerRow {
    pub id: TransactionID,
    pub ssn: Ssn,
    pub year: ProfitYear,
    pub code: ProfitCodeId,
    #[serde(default)]
    pub contribution: Money,
    #[serde(default)]
    pub earnings: Money,
    #[serde(default)]
    pub forfeiture: Money,
    #[serde(default)]
    pub federal_taxes: Money,
    #[serde(default)]
    pub state_taxes: Money,
    #[serde(default)]
    pub years_of_service_credit: i8,
    #[serde(default)]
    pub month_to_date: u8,
    #[serde(default)]
    pub tax_code: Option<char>,
    #[serde(default)]
    pub comment_type: Option<CommentTypeId>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub run_id: Option<RunID>,
}

impl TryFrom<LedgerRow> for LedgerTransaction {
    type Error = ReconcileError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            ssn: row.ssn,
            year: row.year,
            code: ProfitCode::from_raw(row.code)?,
            contribution: row.contribution,
            earnings: row.earnings,
            forfeiture: row.forfeiture,
            federal_taxes: row.federal_taxes,
            state_taxes: row.state_taxes,
            years_of_service_credit: row.years_of_service_credit,
            month_to_date: row.month_to_date,
            tax_code: row.tax_code,
            comment: row.comment_type.map(CommentType::from_raw).transpose()?,
            remark: row.remark.filter(|remark| !remark.is_empty()),
            run_id: row.run_id,
        })
    }
}

impl From<&LedgerTransaction> for LedgerRow {
    fn from(tx: &LedgerTransaction) -> Self {
        Self {
            id: tx.id,
            ssn: tx.ssn,
            year: tx.year,
            code: tx.code.raw(),
            contribution: tx.contribution,
            earnings: tx.earnings,
            forfeiture: tx.forfeiture,
            federal_taxes: tx.federal_taxes,
            state_taxes: tx.state_taxes,
            years_of_service_credit: tx.years_of_service_credit,
            month_to_date: tx.month_to_date,
            tax_code: tx.tax_code,
            comment_type: tx.comment.map(CommentType::raw),
            remark: tx.remark.clone(),
            run_id: tx.run_id,
        }
    }
}

impl LedgerTransaction {
    /// A row with every amount zeroed.
    pub fn new(id: TransactionID, ssn: Ssn, year: ProfitYear, code: ProfitCode) -> Self {
        Self {
            id,
            ssn,
            year,
            code,
            contribution: Money::ZERO,
            earnings: Money::ZERO,
            forfeiture: Money::ZERO,
            federal_taxes: Money::ZERO,
            state_taxes: Money::ZERO,
            years_of_service_credit: 0,
            month_to_date: 12,
            tax_code: None,
            comment: None,
            remark: None,
            run_id: None,
        }
    }
}

#[cfg(test)]
impl LedgerTransaction {
    pub fn with_contribution<A: Into<Money>>(mut self, amount: A) -> Self {
        self.contribution = amount.into();
        self
    }

    pub fn with_earnings<A: Into<Money>>(mut self, amount: A) -> Self {
        self.earnings = amount.into();
        self
    }

    pub fn with_forfeiture<A: Into<Money>>(mut self, amount: A) -> Self {
        self.forfeiture = amount.into();
        self
    }

    pub fn with_run(mut self, run_id: RunID) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_month(mut self, month: u8) -> Self {
        self.month_to_date = month;
        self
    }

    pub fn with_remark(mut self, remark: &str) -> Self {
        self.remark = Some(remark.to_string());
        self
    }

    pub fn contribution_entry<A: Into<Money>>(
        id: TransactionID,
        ssn: Ssn,
        year: ProfitYear,
        forfeiture: A,
    ) -> Self {
        Self::new(id, ssn, year, ProfitCode::IncomingContributions).with_forfeiture(forfeiture)
    }

    pub fn forfeit<A: Into<Money>>(
        id: TransactionID,
        ssn: Ssn,
        year: ProfitYear,
        amount: A,
    ) -> Self {
        Self::new(id, ssn, year, ProfitCode::OutgoingForfeitures).with_forfeiture(amount)
    }

    pub fn withdrawal<A: Into<Money>>(
        id: TransactionID,
        ssn: Ssn,
        year: ProfitYear,
        amount: A,
    ) -> Self {
        Self::new(id, ssn, year, ProfitCode::OutgoingPartialWithdrawal).with_forfeiture(amount)
    }

    pub fn transfer_out<A: Into<Money>>(
        id: TransactionID,
        ssn: Ssn,
        year: ProfitYear,
        amount: A,
    ) -> Self {
        Self::new(id, ssn, year, ProfitCode::OutgoingXferBeneficiary).with_forfeiture(amount)
    }

    pub fn qdro_in<A: Into<Money>>(id: TransactionID, ssn: Ssn, year: ProfitYear, amount: A) -> Self {
        Self::new(id, ssn, year, ProfitCode::IncomingQdroBeneficiary).with_contribution(amount)
    }
}

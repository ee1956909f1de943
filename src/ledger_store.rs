use crate::codes::{CommentType, ProfitCode};
use crate::error::{ReconcileError, Result, ReversalRejection};
use crate::ledger::{LedgerRow, LedgerTransaction};
use crate::{Money, ProfitYear, RunID, Ssn, TransactionID};
use chrono::{Datelike, NaiveDate};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

/// What [`Ledger::revert_run`] removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevertSummary {
    pub run_id: RunID,
    pub removed: usize,
    pub affected: BTreeSet<Ssn>,
    pub years: BTreeSet<ProfitYear>,
}

/// Limits applied to an ad-hoc reversal batch.
#[derive(Debug, Clone)]
pub struct ReversalPolicy {
    /// Years up to and including this one are frozen.
    pub frozen_through: Option<ProfitYear>,
    pub max_batch: usize,
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReversalOutcome {
    pub created: Vec<TransactionID>,
    /// Change to each member's 100%-vested earnings balance from reversing
    /// codes 6 and 9. Applied by the caller for members who are employees.
    pub etva_adjustments: BTreeMap<Ssn, Money>,
}

/// Ledger rows are immutable; only a run revert ([`Ledger::revert_run`]) removes them.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    transactions: Vec<LedgerTransaction>,
    index: BTreeMap<TransactionID, usize>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            transactions: Default::default(),
            index: Default::default(),
        }
    }

    pub fn from_csv<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut ledger = Self::new();
        ledger.load_csv(reader)?;
        Ok(ledger)
    }

    /// Rows with unknown codes or duplicate ids are logged and skipped.
    pub fn load_csv<R: std::io::Read>(&mut self, reader: R) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        for record in reader.deserialize::<LedgerRow>() {
            let row = record?;
            let id = row.id;
            if let Err(err) = LedgerTransaction::try_from(row).and_then(|tx| self.save(tx)) {
                warn!("ledger row {id}: {err}; skipping");
            }
        }
        Ok(())
    }

    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        for tx in &self.transactions {
            writer.serialize(LedgerRow::from(tx))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn commit(&mut self, tx: LedgerTransaction) {
        self.index.insert(tx.id, self.transactions.len());
        self.transactions.push(tx);
    }

    pub fn save(&mut self, tx: LedgerTransaction) -> Result<()> {
        if self.index.contains_key(&tx.id) {
            return Err(ReconcileError::DuplicateTransaction(tx.id));
        }
        self.commit(tx);
        Ok(())
    }

    pub fn get(&self, id: TransactionID) -> Option<&LedgerTransaction> {
        self.index.get(&id).and_then(|i| self.transactions.get(*i))
    }

    pub fn transactions(&self) -> &[LedgerTransaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Rows for the given members within the year range. `None` selects everyone.
    pub fn select<'a>(
        &'a self,
        ssns: Option<&'a BTreeSet<Ssn>>,
        years: RangeInclusive<ProfitYear>,
    ) -> impl Iterator<Item = &'a LedgerTransaction> + 'a {
        self.transactions.iter().filter(move |tx| {
            years.contains(&tx.year) && ssns.is_none_or(|ssns| ssns.contains(&tx.ssn))
        })
    }

    fn next_id(&self) -> TransactionID {
        self.index.keys().next_back().map_or(1, |id| id + 1)
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .transactions
            .iter()
            .enumerate()
            .map(|(i, tx)| (tx.id, i))
            .collect();
    }

    /// Physically removes every row created by `run_id`.
    pub fn revert_run(&mut self, run_id: RunID) -> RevertSummary {
        let mut summary = RevertSummary {
            run_id,
            ..Default::default()
        };
        self.transactions.retain(|tx| {
            if tx.run_id == Some(run_id) {
                summary.removed += 1;
                summary.affected.insert(tx.ssn);
                summary.years.insert(tx.year);
                false
            } else {
                true
            }
        });
        self.rebuild_index();
        if summary.removed == 0 {
            warn!("run {run_id} has no ledger rows; nothing reverted");
        } else {
            info!(
                "reverted run {run_id}: {} rows removed, {} members affected",
                summary.removed,
                summary.affected.len()
            );
        }
        summary
    }

    /// Appends one offsetting entry per distinct id, in first-seen order. The
    /// whole batch is validated before anything is written; any failure rejects
    /// every row.
    pub fn reverse(
        &mut self,
        ids: &[TransactionID],
        policy: &ReversalPolicy,
    ) -> Result<ReversalOutcome> {
        let mut seen = BTreeSet::new();
        let ids: Vec<TransactionID> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Err(ReconcileError::Reversal(ReversalRejection::Batch(
                "no transaction ids given".to_string(),
            )));
        }
        if ids.len() > policy.max_batch {
            return Err(ReconcileError::Reversal(ReversalRejection::Batch(format!(
                "{} ids exceeds the maximum batch of {}",
                ids.len(),
                policy.max_batch
            ))));
        }

        let mut errors: BTreeMap<TransactionID, Vec<String>> = BTreeMap::new();
        for &id in &ids {
            match self.get(id) {
                None => {
                    errors.entry(id).or_default().push("not found".to_string());
                }
                Some(tx) => {
                    let reasons = reversal_issues(tx, policy);
                    if !reasons.is_empty() {
                        errors.entry(id).or_default().extend(reasons);
                    }
                }
            }
        }
        if !errors.is_empty() {
            warn!(
                "reversal rejected: {} of {} rows failed validation",
                errors.len(),
                ids.len()
            );
            return Err(ReconcileError::Reversal(ReversalRejection::Rows(errors)));
        }

        let originals = ids
            .iter()
            .filter_map(|id| self.get(*id).cloned())
            .collect::<Vec<_>>();
        let mut outcome = ReversalOutcome::default();
        for original in originals {
            let reversal = reversal_of(&original, self.next_id(), policy.as_of);
            if matches!(
                original.code,
                ProfitCode::IncomingQdroBeneficiary | ProfitCode::Outgoing100PercentVestedPayment
            ) {
                *outcome.etva_adjustments.entry(original.ssn).or_default() +=
                    reversal.contribution + reversal.forfeiture;
            }
            outcome.created.push(reversal.id);
            self.commit(reversal);
        }
        info!("reversed {} ledger rows", outcome.created.len());
        Ok(outcome)
    }
}

fn reversal_issues(tx: &LedgerTransaction, policy: &ReversalPolicy) -> Vec<String> {
    let mut reasons = Vec::new();
    if matches!(
        tx.code,
        ProfitCode::IncomingContributions
            | ProfitCode::OutgoingForfeitures
            | ProfitCode::Incoming100PercentVestedEarnings
    ) {
        reasons.push(format!("profit code {} is not reversible", tx.code.raw()));
    }
    if policy.frozen_through.is_some_and(|frozen| tx.year <= frozen) {
        reasons.push(format!("profit year {} is frozen", tx.year));
    }
    let month = policy.as_of.month();
    if month == 1 && tx.month_to_date > 1 && tx.month_to_date < 12 {
        reasons.push(format!(
            "in January only months 1 or 12 can be reversed, not month {}",
            tx.month_to_date
        ));
    }
    if u32::from(tx.month_to_date) + 2 < month {
        reasons.push(format!(
            "month {} is more than 2 months old",
            tx.month_to_date
        ));
    }
    reasons
}

fn reversal_of(
    original: &LedgerTransaction,
    id: TransactionID,
    as_of: NaiveDate,
) -> LedgerTransaction {
    let undo = original
        .remark
        .as_deref()
        .is_some_and(|remark| remark.starts_with("REV"));
    let state = original
        .remark
        .as_deref()
        .and_then(|remark| remark.get(15..17))
        .unwrap_or_default();
    let prefix = if undo { "UN-REV" } else { "REV   " };
    let remark = format!("{prefix} {}  {state}", as_of.format("%m/%y"))
        .trim()
        .to_string();

    LedgerTransaction {
        id,
        ssn: original.ssn,
        year: original.year,
        code: original.code,
        contribution: match original.code {
            ProfitCode::IncomingQdroBeneficiary => -original.contribution,
            _ => Money::ZERO,
        },
        earnings: Money::ZERO,
        forfeiture: match original.code {
            ProfitCode::OutgoingPartialWithdrawal
            | ProfitCode::OutgoingDirectPayments
            | ProfitCode::OutgoingXferBeneficiary
            | ProfitCode::Outgoing100PercentVestedPayment => -original.forfeiture,
            _ => Money::ZERO,
        },
        federal_taxes: -original.federal_taxes,
        state_taxes: -original.state_taxes,
        years_of_service_credit: original.years_of_service_credit.saturating_neg(),
        month_to_date: as_of.month() as u8,
        tax_code: original.tax_code,
        comment: Some(if undo {
            CommentType::UndoReversal
        } else {
            CommentType::Reversal
        }),
        remark: Some(remark),
        run_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn policy(month: u32) -> ReversalPolicy {
        ReversalPolicy {
            frozen_through: Some(2022),
            max_batch: 1000,
            as_of: NaiveDate::from_ymd_opt(2024, month, 15).unwrap(),
        }
    }

    fn ledger(rows: Vec<LedgerTransaction>) -> Ledger {
        let mut ledger = Ledger::new();
        for row in rows {
            ledger.save(row).unwrap();
        }
        ledger
    }

    #[test]
    fn load_skips_unknown_codes() -> anyhow::Result<()> {
        let csv = "id,ssn,year,code,contribution,earnings,forfeiture\n\
                   1,100,2023,0,0,0,5\n\
                   2,100,2023,4,0,0,5\n\
                   3,100,2023,9,0,0,7\n";
        let ledger = Ledger::from_csv(Cursor::new(csv))?;
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get(2).is_none());
        assert_eq!(ledger.get(3).map(|tx| tx.code), Some(ProfitCode::Outgoing100PercentVestedPayment));
        Ok(())
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut ledger = ledger(vec![LedgerTransaction::forfeit(1, 100, 2023, 5)]);
        let err = ledger
            .save(LedgerTransaction::forfeit(1, 200, 2023, 5))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::DuplicateTransaction(1)));
    }

    #[test]
    fn revert_run_removes_only_that_run() {
        let mut ledger = ledger(vec![
            LedgerTransaction::contribution_entry(1, 100, 2023, 10).with_run(7),
            LedgerTransaction::contribution_entry(2, 200, 2023, 10).with_run(7),
            LedgerTransaction::contribution_entry(3, 300, 2023, 10).with_run(8),
            LedgerTransaction::withdrawal(4, 100, 2023, 3),
        ]);
        let summary = ledger.revert_run(7);
        assert_eq!(summary.removed, 2);
        assert_eq!(summary.affected, BTreeSet::from([100, 200]));
        assert_eq!(summary.years, BTreeSet::from([2023]));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get(1).is_none());
        assert_eq!(ledger.get(4).map(|tx| tx.ssn), Some(100));
        assert_eq!(ledger.revert_run(7).removed, 0);
    }

    #[test]
    fn reversal_negates_the_field_the_code_reads() -> anyhow::Result<()> {
        let mut ledger = ledger(vec![
            LedgerTransaction::withdrawal(1, 100, 2024, 250).with_month(5),
            LedgerTransaction::qdro_in(2, 200, 2024, 750).with_month(5),
        ]);
        let outcome = ledger.reverse(&[1, 2], &policy(6))?;
        assert_eq!(outcome.created, vec![3, 4]);

        let withdrawal = ledger.get(3).unwrap();
        assert_eq!(withdrawal.forfeiture, Money::from(-250));
        assert_eq!(withdrawal.contribution, Money::ZERO);
        assert_eq!(withdrawal.comment, Some(CommentType::Reversal));
        assert_eq!(withdrawal.remark.as_deref(), Some("REV    06/24"));
        assert_eq!(withdrawal.month_to_date, 6);

        let qdro = ledger.get(4).unwrap();
        assert_eq!(qdro.contribution, Money::from(-750));
        assert_eq!(qdro.forfeiture, Money::ZERO);
        assert_eq!(outcome.etva_adjustments.get(&200), Some(&Money::from(-750)));
        assert!(!outcome.etva_adjustments.contains_key(&100));
        Ok(())
    }

    #[test]
    fn reversing_a_reversal_is_an_undo() -> anyhow::Result<()> {
        let mut ledger = ledger(vec![
            LedgerTransaction::withdrawal(1, 100, 2024, 10)
                .with_month(6)
                .with_remark("REV    05/24   MA"),
        ]);
        ledger.reverse(&[1], &policy(6))?;
        let undo = ledger.get(2).unwrap();
        assert_eq!(undo.comment, Some(CommentType::UndoReversal));
        assert_eq!(undo.remark.as_deref(), Some("UN-REV 06/24  MA"));
        Ok(())
    }

    #[test]
    fn batch_is_rejected_atomically() {
        let mut ledger = ledger(vec![
            LedgerTransaction::withdrawal(1, 100, 2024, 10).with_month(6),
            LedgerTransaction::forfeit(2, 100, 2024, 10).with_month(6),
            LedgerTransaction::withdrawal(3, 100, 2022, 10).with_month(6),
            LedgerTransaction::withdrawal(4, 100, 2024, 10).with_month(2),
        ]);
        let err = ledger.reverse(&[1, 2, 3, 4, 99], &policy(6)).unwrap_err();
        let ReconcileError::Reversal(ReversalRejection::Rows(errors)) = err else {
            panic!("expected a rejected batch, got {err:?}");
        };
        assert_eq!(errors.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4, 99]);
        assert!(errors[&2][0].contains("not reversible"));
        assert!(errors[&3][0].contains("frozen"));
        assert!(errors[&4][0].contains("more than 2 months old"));
        assert_eq!(ledger.len(), 4);
    }

    #[test]
    fn january_only_reverses_december_or_january() {
        let mut ledger = ledger(vec![
            LedgerTransaction::withdrawal(1, 100, 2024, 10).with_month(12),
            LedgerTransaction::withdrawal(2, 100, 2024, 10).with_month(6),
        ]);
        let january = policy(1);
        assert!(ledger.reverse(&[1], &january).is_ok());
        assert!(matches!(
            ledger.reverse(&[2], &january),
            Err(ReconcileError::Reversal(ReversalRejection::Rows(_)))
        ));
    }

    #[test]
    fn repeated_ids_are_reversed_once() -> anyhow::Result<()> {
        let mut ledger = ledger(vec![
            LedgerTransaction::withdrawal(1, 100, 2024, 40).with_month(6),
            LedgerTransaction::transfer_out(2, 100, 2024, 15).with_month(6),
        ]);
        let outcome = ledger.reverse(&[2, 1, 2, 1], &policy(6))?;
        assert_eq!(outcome.created, vec![3, 4]);
        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.get(3).map(|tx| tx.forfeiture), Some(Money::from(-15)));
        assert_eq!(ledger.get(4).map(|tx| tx.forfeiture), Some(Money::from(-40)));
        Ok(())
    }

    #[test]
    fn batch_limits() {
        let mut ledger = Ledger::new();
        let mut small = policy(6);
        small.max_batch = 2;
        assert!(matches!(
            ledger.reverse(&[], &small),
            Err(ReconcileError::Reversal(ReversalRejection::Batch(_)))
        ));
        assert!(matches!(
            ledger.reverse(&[1, 2, 3], &small),
            Err(ReconcileError::Reversal(ReversalRejection::Batch(_)))
        ));
    }
}

use crate::aggregator::{BalanceRecord, aggregate_partition};
use crate::checksum::latest;
use crate::config::EngineConfig;
use crate::error::{MissingReference, ReconcileError, Result};
use crate::ledger::LedgerTransaction;
use crate::ledger_store::RevertSummary;
use crate::members::{MemberFilter, MemberIdentity, MemberResolver, ResolvedMember, by_ssn};
use crate::source::{LedgerSource, RevertibleSource};
use crate::validation::{BalanceStatement, Totals, ValidationReport, validate};
use crate::vesting::{Vesting, VestingCalculator};
use crate::{BadgeNumber, Money, ProfitYear, PsnSuffix, RunID, Ssn};
use anyhow::Context;
use chrono::NaiveDate;
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation, checked at partition boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ReconcileError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A settled person-year with its vesting.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberYearRecord {
    pub balance: BalanceRecord,
    pub vesting: Vesting,
}

impl MemberYearRecord {
    pub fn member(&self) -> &ResolvedMember {
        &self.balance.member
    }

    pub fn suggested_forfeit(&self) -> Money {
        self.balance.ending_balance - self.vesting.vested_balance
    }

    fn sort_key(&self) -> (BadgeNumber, PsnSuffix, ProfitYear, Ssn) {
        let member = self.member();
        (member.badge, member.psn_suffix, member.year, member.ssn)
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct Output {
    badge: BadgeNumber,
    psn_suffix: PsnSuffix,
    ssn: Ssn,
    year: ProfitYear,
    identity: MemberIdentity,
    enrollment: u8,
    years_in_plan: u8,
    beginning_balance: Money,
    contributions: Money,
    earnings: Money,
    forfeitures: Money,
    distributions: Money,
    beneficiary_allocation: Money,
    ending_balance: Money,
    vesting_percent: u8,
    vested_balance: Money,
    suggested_forfeit: Money,
}

impl From<&MemberYearRecord> for Output {
    fn from(record: &MemberYearRecord) -> Self {
        let member = record.member();
        let balance = &record.balance;
        Self {
            badge: member.badge,
            psn_suffix: member.psn_suffix,
            ssn: member.ssn,
            year: member.year,
            identity: member.identity,
            enrollment: member.enrollment.raw().0,
            years_in_plan: member.years_in_plan,
            beginning_balance: balance.beginning_balance,
            contributions: balance.amounts.contributions,
            earnings: balance.amounts.earnings,
            forfeitures: balance.amounts.forfeitures,
            distributions: balance.amounts.distributions,
            beneficiary_allocation: balance.amounts.beneficiary_allocation(),
            ending_balance: balance.ending_balance,
            vesting_percent: record.vesting.percent.stored(),
            vested_balance: record.vesting.vested_balance,
            suggested_forfeit: record.suggested_forfeit(),
        }
    }
}

pub fn write_csv<'a, W: std::io::Write>(
    records: impl IntoIterator<Item = &'a MemberYearRecord>,
    writer: W,
) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for output in records.into_iter().map(Output::from) {
        writer
            .serialize(output)
            .context("Failed to write to CSV")?;
    }
    writer.flush().context("Failed to flush CSV")?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeRequest {
    pub years: RangeInclusive<ProfitYear>,
    pub badges: Option<BTreeSet<BadgeNumber>>,
    pub terminated_between: Option<(NaiveDate, NaiveDate)>,
    /// Restrict the returned records to these people. Like `badges`, this never
    /// narrows the population the year is validated over.
    pub ssns: Option<BTreeSet<Ssn>>,
    pub skip: usize,
    pub take: Option<usize>,
}

impl ComputeRequest {
    pub fn year(year: ProfitYear) -> Self {
        Self::years(year..=year)
    }

    pub fn years(years: RangeInclusive<ProfitYear>) -> Self {
        Self {
            years,
            badges: None,
            terminated_between: None,
            ssns: None,
            skip: 0,
            take: None,
        }
    }

    /// The reporting population: every member of the requested years in the
    /// termination window, whatever badges or people were asked for.
    fn population(&self) -> MemberFilter {
        MemberFilter {
            years: self.years.clone(),
            badges: None,
            terminated_between: self.terminated_between,
        }
    }

    fn selects(&self, member: &ResolvedMember) -> bool {
        self.badges
            .as_ref()
            .is_none_or(|badges| badges.contains(&member.badge))
            && self.ssns.as_ref().is_none_or(|ssns| ssns.contains(&member.ssn))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeResult {
    /// The requested page, ordered by badge, PSN suffix, then year.
    pub records: Vec<MemberYearRecord>,
    /// Retained records matching the badge and SSN filters, before pagination.
    pub total_records: usize,
    /// Over the whole population of the requested years, regardless of filters
    /// or page. `year_totals` and `validation` cover the same population.
    pub totals: Totals,
    pub year_totals: BTreeMap<ProfitYear, Totals>,
    pub validation: Vec<ValidationReport>,
    pub skipped: Vec<MissingReference>,
}

impl ComputeResult {
    pub fn blocked(&self) -> bool {
        self.validation.iter().any(|report| report.cross_reference.block)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevertOutcome {
    pub summary: RevertSummary,
    pub recomputed: ComputeResult,
}

/// One person's history, newest year first.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberHistory<'a> {
    pub badge: BadgeNumber,
    pub psn_suffix: PsnSuffix,
    pub years: Vec<&'a MemberYearRecord>,
    /// Ending less vested for `last_year`; zero when that year was not retained.
    pub suggested_forfeit: Money,
}

pub fn group_by_member(
    records: &[MemberYearRecord],
    last_year: ProfitYear,
) -> Vec<MemberHistory<'_>> {
    let mut groups: BTreeMap<(BadgeNumber, PsnSuffix), Vec<&MemberYearRecord>> = BTreeMap::new();
    for record in records {
        let member = record.member();
        groups
            .entry((member.badge, member.psn_suffix))
            .or_default()
            .push(record);
    }
    groups
        .into_iter()
        .map(|((badge, psn_suffix), mut years)| {
            years.sort_by_key(|record| std::cmp::Reverse(record.member().year));
            let suggested_forfeit = years
                .iter()
                .find(|record| record.member().year == last_year)
                .map_or(Money::ZERO, |record| record.suggested_forfeit());
            MemberHistory {
                badge,
                psn_suffix,
                years,
                suggested_forfeit,
            }
        })
        .collect()
}

pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fetches once, settles every SSN partition of the population, validates
    /// each year over all of it, then filters and paginates what is returned.
    pub fn compute<S: LedgerSource + ?Sized>(
        &self,
        source: &S,
        request: &ComputeRequest,
        cancel: &CancellationToken,
    ) -> Result<ComputeResult> {
        let years = request.years.clone();
        let first_year = *years.start();

        let mut calculators = BTreeMap::new();
        for year in years.clone() {
            let schedules = self
                .config
                .schedules(year, &source.schedule_details(year)?)?;
            calculators.insert(year, VestingCalculator::new(schedules));
        }

        let employees = source.employees(years.clone())?;
        let beneficiaries = source.beneficiaries()?;
        let resolution = MemberResolver::new(self.config.beneficiary_years_in_plan).resolve(
            &employees,
            &beneficiaries,
            &request.population(),
        );
        let ssns = resolution.ssns();
        let transactions = source.transactions(&ssns, years.clone())?;
        let openings = source.prior_balances(first_year - 1, &ssns)?;
        cancel.check()?;

        let mut ledgers: BTreeMap<Ssn, Vec<&LedgerTransaction>> = BTreeMap::new();
        for tx in &transactions {
            ledgers.entry(tx.ssn).or_default().push(tx);
        }
        let partitions: Vec<(Ssn, Vec<&ResolvedMember>)> =
            by_ssn(&resolution.members).into_iter().collect();

        let settle = |(ssn, members): &(Ssn, Vec<&ResolvedMember>)| -> Result<Vec<MemberYearRecord>> {
            cancel.check()?;
            let ledger = ledgers.get(ssn).map(Vec::as_slice).unwrap_or_default();
            let opening = openings.get(ssn).copied().unwrap_or_default();
            let balances = aggregate_partition(
                *ssn,
                members,
                ledger.iter().copied(),
                opening,
                years.clone(),
            )?;
            Ok(balances
                .into_iter()
                .filter_map(|balance| {
                    let calculator = calculators.get(&balance.member.year)?;
                    let vesting = calculator.vest(&balance.member, balance.ending_balance);
                    Some(MemberYearRecord { balance, vesting })
                })
                .collect())
        };
        let settled: Vec<Vec<MemberYearRecord>> = if self.config.parallel {
            partitions.par_iter().map(settle).collect::<Result<_>>()?
        } else {
            partitions.iter().map(settle).collect::<Result<_>>()?
        };
        if cancel.is_cancelled() {
            warn!("run cancelled after settling; discarding results");
            return Err(ReconcileError::Cancelled);
        }

        let mut records: Vec<MemberYearRecord> = settled.into_iter().flatten().collect();
        records.sort_by_key(MemberYearRecord::sort_key);

        let mut validation = Vec::new();
        let mut year_totals = BTreeMap::new();
        for year in years.clone() {
            let totals = Totals::of(records.iter().filter(|r| r.member().year == year));
            let archives = source.archived_checksums(year)?;
            let archived = latest(&archives, year, &self.config.report_type);
            let statement = latest(&archives, year, &self.config.statement_report_type)
                .map(|archive| BalanceStatement::from_fields(&archive.values()));
            validation.push(validate(year, &totals, archived, statement.as_ref()));
            year_totals.insert(year, totals);
        }

        let totals = Totals::of(&records);
        let selected: Vec<MemberYearRecord> = records
            .into_iter()
            .filter(|record| request.selects(record.member()))
            .collect();
        let total_records = selected.len();
        let records: Vec<MemberYearRecord> = selected
            .into_iter()
            .skip(request.skip)
            .take(request.take.unwrap_or(usize::MAX))
            .collect();
        info!(
            "years {}..={}: {} records retained from {} partitions, {} selected, {} on this page",
            years.start(),
            years.end(),
            totals.members,
            partitions.len(),
            total_records,
            records.len()
        );

        Ok(ComputeResult {
            records,
            total_records,
            totals,
            year_totals,
            validation,
            skipped: resolution.skipped,
        })
    }

    /// Drops a processing run's rows and recomputes every affected person over
    /// `years`, or over the years the run touched when none are given. The
    /// returned records are the affected people's; validation and totals are
    /// over the whole population.
    pub fn revert<S: RevertibleSource + ?Sized>(
        &self,
        source: &mut S,
        run_id: RunID,
        years: Option<RangeInclusive<ProfitYear>>,
        cancel: &CancellationToken,
    ) -> Result<RevertOutcome> {
        cancel.check()?;
        let summary = source.revert_run(run_id)?;
        let years = match (years, summary.years.first(), summary.years.last()) {
            (Some(years), _, _) => years,
            (None, Some(first), Some(last)) => *first..=*last,
            (None, _, _) => {
                return Ok(RevertOutcome {
                    summary,
                    recomputed: ComputeResult {
                        records: Vec::new(),
                        total_records: 0,
                        totals: Totals::default(),
                        year_totals: BTreeMap::new(),
                        validation: Vec::new(),
                        skipped: Vec::new(),
                    },
                });
            }
        };
        let request = ComputeRequest {
            ssns: Some(summary.affected.clone()),
            ..ComputeRequest::years(years)
        };
        let recomputed = self.compute(&*source, &request, cancel)?;
        Ok(RevertOutcome {
            summary,
            recomputed,
        })
    }
}

use crate::Money;
use crate::checksum::ReportChecksum;
use crate::codes::{Enrollment, ZeroContributionReason};
use crate::config::EngineConfig;
use crate::engine::{self, CancellationToken, ComputeRequest, ComputeResult, Engine};
use crate::error::{MissingReference, ReconcileError};
use crate::ledger::LedgerTransaction;
use crate::ledger_store::Ledger;
use crate::members::{BeneficiaryRecord, EmployeeRecord};
use crate::source::{MemorySource, PriorBalance};
use crate::validation::{ENDING_BALANCE, RuleOutcome};
use crate::{BadgeNumber, ProfitYear, PsnSuffix, Ssn};
use anyhow::Result;
use chrono::{NaiveDate, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::io::Cursor;

fn fixture_source() -> Result<MemorySource> {
    Ok(MemorySource::from_readers(
        Cursor::new(include_str!("../tests/fixtures/transactions.csv")),
        Cursor::new(include_str!("../tests/fixtures/employees.csv")),
    )?
    .with_beneficiaries(Cursor::new(include_str!("../tests/fixtures/beneficiaries.csv")))?
    .with_balances(Cursor::new(include_str!("../tests/fixtures/balances.csv")))?
    .with_checksums(Cursor::new(include_str!("../tests/fixtures/checksums.csv")))?)
}

/// Compares two CSV documents cell by cell, decimals by value.
fn assert_csv_eq(got: &str, expected: &str) -> Result<()> {
    let rows = |text: &str| -> Result<Vec<csv::StringRecord>> {
        Ok(csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(text.as_bytes())
            .records()
            .collect::<Result<_, _>>()?)
    };
    let got = rows(got)?;
    let expected = rows(expected)?;
    assert_eq!(got.len(), expected.len(), "row count");
    for (line, (got, expected)) in got.iter().zip(&expected).enumerate() {
        assert_eq!(got.len(), expected.len(), "line {line} width");
        for (got, expected) in got.iter().zip(expected) {
            match (got.parse::<Money>(), expected.parse::<Money>()) {
                (Ok(got), Ok(expected)) => assert_eq!(got, expected, "line {line}"),
                _ => assert_eq!(got, expected, "line {line}"),
            }
        }
    }
    Ok(())
}

#[test]
fn test_csv() -> Result<()> {
    let source = fixture_source()?;
    let result = Engine::new(EngineConfig::default()).compute(
        &source,
        &ComputeRequest::year(2024),
        &CancellationToken::new(),
    )?;
    let mut buff = Vec::new();
    engine::write_csv(&result.records, &mut buff)?;
    let output = String::from_utf8(buff)?;
    assert_csv_eq(&output, include_str!("../tests/fixtures/records.csv"))?;

    assert_eq!(result.total_records, 5);
    assert!(!result.blocked());
    let report = &result.validation[0];
    assert!(report.passed(), "{report:?}");
    assert_eq!(report.zero_sum, RuleOutcome::Passed);
    assert_eq!(report.balance_equation, RuleOutcome::Passed);
    assert_eq!(report.cross_reference.passed, report.cross_reference.total);
    assert_eq!(
        result.skipped,
        vec![MissingReference::UnlinkedBeneficiary {
            badge: 999,
            psn_suffix: 2000,
            ssn: 100000010,
        }]
    );
    assert_eq!(result.totals.ending_balance, Money::from(6200));
    assert_eq!(result.totals.vested_balance, Money::from(4620));
    Ok(())
}

#[test]
fn unknown_codes_are_skipped_on_load() -> Result<()> {
    let source = fixture_source()?;
    assert_eq!(source.ledger.len(), 9);
    assert!(source.ledger.get(10).is_none());
    Ok(())
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

fn employee(ssn: Ssn, badge: BadgeNumber, enrollment: Enrollment, years_in_plan: u8) -> EmployeeRecord {
    EmployeeRecord {
        ssn,
        badge,
        year: 2024,
        birth_date: Some(date(1970, 1, 1)),
        termination_date: Some(date(2024, 6, 30)),
        termination_code: None,
        years_in_plan,
        enrollment: enrollment.raw(),
        zero_contribution_reason: None,
        etva: Money::ZERO,
    }
}

fn beneficiary(ssn: Ssn, psn_suffix: PsnSuffix, employee_badge: BadgeNumber) -> BeneficiaryRecord {
    BeneficiaryRecord {
        ssn,
        psn_suffix,
        employee_badge: Some(employee_badge),
        birth_date: None,
    }
}

fn opening<A: Into<Money>>(ssn: Ssn, year: ProfitYear, amount: A) -> PriorBalance {
    PriorBalance {
        ssn,
        year,
        ending_balance: amount.into(),
    }
}

fn source(
    employees: Vec<EmployeeRecord>,
    beneficiaries: Vec<BeneficiaryRecord>,
    transactions: Vec<LedgerTransaction>,
    balances: Vec<PriorBalance>,
) -> Result<MemorySource> {
    let mut ledger = Ledger::new();
    for tx in transactions {
        ledger.save(tx)?;
    }
    Ok(MemorySource {
        ledger,
        employees,
        beneficiaries,
        balances,
        ..Default::default()
    })
}

#[derive(Debug, PartialEq)]
struct Settled {
    ssn: Ssn,
    beginning: Money,
    ending: Money,
    percent: u8,
    vested: Money,
}

impl Settled {
    fn new<A: Into<Money>, B: Into<Money>, C: Into<Money>>(
        ssn: Ssn,
        beginning: A,
        ending: B,
        percent: u8,
        vested: C,
    ) -> Self {
        Self {
            ssn,
            beginning: beginning.into(),
            ending: ending.into(),
            percent,
            vested: vested.into(),
        }
    }
}

fn settled(result: &ComputeResult) -> Vec<Settled> {
    result
        .records
        .iter()
        .map(|record| Settled {
            ssn: record.member().ssn,
            beginning: record.balance.beginning_balance,
            ending: record.balance.ending_balance,
            percent: record.vesting.percent.stored(),
            vested: record.vesting.vested_balance,
        })
        .collect()
}

fn table_test(source: MemorySource, expected: Vec<Settled>) -> Result<()> {
    let result = Engine::new(EngineConfig::default()).compute(
        &source,
        &ComputeRequest::year(2024),
        &CancellationToken::new(),
    )?;
    assert_eq!(settled(&result), expected);
    Ok(())
}

#[test]
fn test_old_plan_partial_vesting() -> Result<()> {
    table_test(
        source(
            vec![employee(1, 10, Enrollment::OldPlanContributions, 3)],
            vec![],
            vec![LedgerTransaction::contribution_entry(1, 1, 2024, 100)],
            vec![opening(1, 2023, 900)],
        )?,
        vec![Settled::new(1, 900, 1000, 20, 200)],
    )
}

#[test]
fn test_allocation_overrides_tenure() -> Result<()> {
    table_test(
        source(
            vec![employee(2, 20, Enrollment::NewPlanContributions, 1)],
            vec![],
            vec![LedgerTransaction::qdro_in(1, 2, 2024, 500)],
            vec![],
        )?,
        vec![Settled::new(2, 0, 500, 0, 0)],
    )
}

#[test]
fn test_beneficiary_only_gets_marker() -> Result<()> {
    table_test(
        source(
            vec![employee(1, 10, Enrollment::OldPlanContributions, 5)],
            vec![beneficiary(3, 1000, 10)],
            vec![
                LedgerTransaction::transfer_out(1, 1, 2024, 750),
                LedgerTransaction::qdro_in(2, 3, 2024, 750),
            ],
            vec![opening(1, 2023, 2000)],
        )?,
        vec![
            Settled::new(1, 2000, 1250, 60, 750),
            Settled::new(3, 0, 750, 1, 750),
        ],
    )
}

#[test]
fn test_full_vesting_reason() -> Result<()> {
    let mut retiree = employee(4, 40, Enrollment::OldPlanContributions, 4);
    retiree.zero_contribution_reason = Some(ZeroContributionReason::SixtyFiveAndOverFullyVested.raw());
    table_test(
        source(
            vec![retiree],
            vec![],
            vec![LedgerTransaction::withdrawal(1, 4, 2024, 500)],
            vec![opening(4, 2023, 2000)],
        )?,
        vec![Settled::new(4, 2000, 1500, 100, 1500)],
    )
}

#[test]
fn test_deceased_is_fully_vested() -> Result<()> {
    let mut deceased = employee(4, 40, Enrollment::NewPlanContributions, 3);
    deceased.termination_code = Some(crate::codes::TerminationCode::Deceased.raw());
    table_test(
        source(vec![deceased], vec![], vec![], vec![opening(4, 2023, 800)])?,
        vec![Settled::new(4, 800, 800, 100, 800)],
    )
}

#[test]
fn test_zero_ending_vests_nothing() -> Result<()> {
    let mut retiree = employee(4, 40, Enrollment::OldPlanContributions, 4);
    retiree.zero_contribution_reason = Some(ZeroContributionReason::SixtyFiveAndOverFullyVested.raw());
    table_test(
        source(
            vec![retiree],
            vec![],
            vec![LedgerTransaction::withdrawal(1, 4, 2024, 300)],
            vec![opening(4, 2023, 300)],
        )?,
        vec![Settled::new(4, 300, 0, 0, 0)],
    )
}

#[test]
fn test_quiet_members_are_dropped() -> Result<()> {
    table_test(
        source(
            vec![
                employee(5, 50, Enrollment::OldPlanContributions, 4),
                employee(6, 60, Enrollment::OldPlanContributions, 2),
            ],
            vec![],
            vec![],
            vec![opening(6, 2023, 250)],
        )?,
        vec![],
    )
}

#[test]
fn test_pensioners_are_excluded() -> Result<()> {
    let mut pensioner = employee(7, 70, Enrollment::OldPlanContributions, 9);
    pensioner.termination_code = Some(crate::codes::TerminationCode::RetiredReceivingPension.raw());
    table_test(
        source(vec![pensioner], vec![], vec![], vec![opening(7, 2023, 300)])?,
        vec![],
    )
}

#[test]
fn test_idempotent() -> Result<()> {
    let source = fixture_source()?;
    let year_end = Engine::new(EngineConfig::default());
    let request = ComputeRequest::year(2024);
    let first = year_end.compute(&source, &request, &CancellationToken::new())?;
    let second = year_end.compute(&source, &request, &CancellationToken::new())?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_sequential_matches_parallel() -> Result<()> {
    let source = fixture_source()?;
    let request = ComputeRequest::year(2024);
    let parallel = Engine::new(EngineConfig::default()).compute(
        &source,
        &request,
        &CancellationToken::new(),
    )?;
    let sequential = Engine::new(EngineConfig {
        parallel: false,
        ..Default::default()
    })
    .compute(&source, &request, &CancellationToken::new())?;
    assert_eq!(parallel, sequential);
    Ok(())
}

#[test]
fn test_cancelled_run_returns_nothing() -> Result<()> {
    let source = fixture_source()?;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result =
        Engine::new(EngineConfig::default()).compute(&source, &ComputeRequest::year(2024), &cancel);
    assert!(matches!(result, Err(ReconcileError::Cancelled)));
    Ok(())
}

#[test]
fn test_pagination_keeps_full_totals() -> Result<()> {
    let source = fixture_source()?;
    let request = ComputeRequest {
        skip: 1,
        take: Some(2),
        ..ComputeRequest::year(2024)
    };
    let result =
        Engine::new(EngineConfig::default()).compute(&source, &request, &CancellationToken::new())?;
    let badges: Vec<BadgeNumber> = result.records.iter().map(|r| r.member().badge).collect();
    assert_eq!(badges, vec![702, 704]);
    assert_eq!(result.total_records, 5);
    assert_eq!(result.totals.members, 5);
    assert_eq!(result.totals.ending_balance, Money::from(6200));
    assert!(result.validation[0].passed());
    Ok(())
}

#[test]
fn test_badge_filter() -> Result<()> {
    let source = fixture_source()?;
    let request = ComputeRequest {
        badges: Some(BTreeSet::from([708])),
        ..ComputeRequest::year(2024)
    };
    let result =
        Engine::new(EngineConfig::default()).compute(&source, &request, &CancellationToken::new())?;
    let keys: Vec<(BadgeNumber, PsnSuffix)> = result
        .records
        .iter()
        .map(|r| (r.member().badge, r.member().psn_suffix))
        .collect();
    assert_eq!(keys, vec![(708, 0), (708, 1000)]);
    assert_eq!(result.total_records, 2);

    // The year is still reconciled over everyone, so the archive agrees.
    assert!(!result.blocked());
    assert!(result.validation[0].passed(), "{:?}", result.validation[0]);
    assert_eq!(result.totals.members, 5);
    assert_eq!(result.year_totals[&2024].ending_balance, Money::from(6200));
    Ok(())
}

#[test]
fn test_ssn_filter_keeps_full_year_validation() -> Result<()> {
    let source = fixture_source()?;
    let request = ComputeRequest {
        ssns: Some(BTreeSet::from([100000009])),
        ..ComputeRequest::year(2024)
    };
    let result =
        Engine::new(EngineConfig::default()).compute(&source, &request, &CancellationToken::new())?;
    assert_eq!(settled(&result), vec![Settled::new(100000009, 0, 500, 1, 500)]);
    assert_eq!(result.validation[0].zero_sum, RuleOutcome::Passed);
    assert!(!result.blocked());
    Ok(())
}

#[test]
fn test_revert_recomputes_affected_members() -> Result<()> {
    let mut source = fixture_source()?;
    let outcome = Engine::new(EngineConfig::default()).revert(
        &mut source,
        41,
        None,
        &CancellationToken::new(),
    )?;
    assert_eq!(outcome.summary.removed, 2);
    assert_eq!(outcome.summary.affected, BTreeSet::from([100000001]));
    assert_eq!(source.ledger.len(), 7);
    assert_eq!(
        settled(&outcome.recomputed),
        vec![Settled::new(100000001, 900, 900, 20, 180)]
    );

    // Validation covers the whole year, so only what the revert really
    // changed drifts from the archive published before it.
    let report = &outcome.recomputed.validation[0];
    assert_eq!(outcome.recomputed.year_totals[&2024].members, 5);
    assert_eq!(report.zero_sum, RuleOutcome::Passed);
    let drifted: Vec<(&str, Money, Money)> = report
        .drift
        .iter()
        .filter(|field| !field.matches())
        .map(|field| (field.field.as_str(), field.archived, field.current))
        .collect();
    assert_eq!(
        drifted,
        vec![
            ("Contributions", Money::from(1500), Money::ZERO),
            ("Earnings", Money::from(75), Money::ZERO),
            ("EndingBalance", Money::from(6200), Money::from(6100)),
            ("Forfeitures", Money::from(100), Money::ZERO),
            ("VestedBalance", Money::from(4620), Money::from(4600)),
        ]
    );
    Ok(())
}

#[test]
fn test_excluded_pensioner_still_reported_as_beneficiary() -> Result<()> {
    let mut pensioner = employee(5, 50, Enrollment::OldPlanContributions, 9);
    pensioner.termination_code = Some(crate::codes::TerminationCode::RetiredReceivingPension.raw());
    let source = source(
        vec![employee(1, 10, Enrollment::OldPlanContributions, 5), pensioner],
        vec![beneficiary(5, 1000, 10)],
        vec![
            LedgerTransaction::transfer_out(1, 1, 2024, 750),
            LedgerTransaction::qdro_in(2, 5, 2024, 750),
        ],
        vec![opening(1, 2023, 2000)],
    )?;
    let result = Engine::new(EngineConfig::default()).compute(
        &source,
        &ComputeRequest::year(2024),
        &CancellationToken::new(),
    )?;
    assert_eq!(
        settled(&result),
        vec![
            Settled::new(1, 2000, 1250, 60, 750),
            Settled::new(5, 0, 750, 1, 750),
        ]
    );
    assert_eq!(result.validation[0].zero_sum, RuleOutcome::Passed);
    Ok(())
}

#[test]
fn test_revert_unknown_run_is_a_no_op() -> Result<()> {
    let mut source = fixture_source()?;
    let outcome = Engine::new(EngineConfig::default()).revert(
        &mut source,
        999,
        None,
        &CancellationToken::new(),
    )?;
    assert_eq!(outcome.summary.removed, 0);
    assert!(outcome.recomputed.records.is_empty());
    assert_eq!(source.ledger.len(), 9);
    Ok(())
}

#[test]
fn test_drift_from_newest_archive_blocks() -> Result<()> {
    let mut source = fixture_source()?;
    let mut fields = crate::validation::Totals::default().fields();
    fields.insert(ENDING_BALANCE.to_string(), Money::from(6200));
    source.checksums.push(ReportChecksum::capture(
        2024,
        "TerminatedEmployees",
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        fields.iter().map(|(name, value)| (name.as_str(), *value)),
    ));
    let result = Engine::new(EngineConfig::default()).compute(
        &source,
        &ComputeRequest::year(2024),
        &CancellationToken::new(),
    )?;
    let report = &result.validation[0];
    assert!(result.blocked());
    assert!(report.checksum_drift.failed());
    assert!(
        report
            .cross_reference
            .critical_issues
            .iter()
            .any(|issue| issue.contains("Balances"))
    );
    Ok(())
}

#[test]
fn test_unpaired_transfer_breaks_zero_sum() -> Result<()> {
    let source = source(
        vec![employee(1, 10, Enrollment::OldPlanContributions, 5)],
        vec![],
        vec![LedgerTransaction::transfer_out(1, 1, 2024, 125)],
        vec![opening(1, 2023, 1000)],
    )?;
    let result = Engine::new(EngineConfig::default()).compute(
        &source,
        &ComputeRequest::year(2024),
        &CancellationToken::new(),
    )?;
    let report = &result.validation[0];
    assert!(report.zero_sum.failed());
    assert_eq!(report.integrity_errors()[0].variance, Money::from(-125));
    // nothing archived to compare against
    assert!(!result.blocked());
    Ok(())
}

#[test]
fn test_multi_year_history() -> Result<()> {
    let mut y2023 = employee(1, 10, Enrollment::OldPlanContributions, 4);
    y2023.year = 2023;
    let y2024 = employee(1, 10, Enrollment::OldPlanContributions, 5);
    let source = source(
        vec![y2023, y2024],
        vec![],
        vec![
            LedgerTransaction::contribution_entry(1, 1, 2023, 200),
            LedgerTransaction::withdrawal(2, 1, 2024, 400),
        ],
        vec![opening(1, 2022, 1000)],
    )?;
    let result = Engine::new(EngineConfig::default()).compute(
        &source,
        &ComputeRequest::years(2023..=2024),
        &CancellationToken::new(),
    )?;
    assert_eq!(
        settled(&result),
        vec![
            Settled::new(1, 1000, 1200, 40, 480),
            Settled::new(1, 1200, 800, 60, 480),
        ]
    );
    assert_eq!(result.validation.len(), 2);
    assert_eq!(result.year_totals[&2024].ending_balance, Money::from(800));

    let histories = engine::group_by_member(&result.records, 2024);
    assert_eq!(histories.len(), 1);
    let years: Vec<ProfitYear> = histories[0].years.iter().map(|r| r.member().year).collect();
    assert_eq!(years, vec![2024, 2023]);
    assert_eq!(histories[0].suggested_forfeit, Money::from(320));
    Ok(())
}

fn transfer_source(amounts: &[i64]) -> MemorySource {
    let mut transactions = Vec::new();
    for (i, cents) in amounts.iter().enumerate() {
        let amount = Money::new(*cents, 2);
        let id = 2 * i as u64;
        transactions.push(LedgerTransaction::transfer_out(id + 1, 1, 2024, amount));
        transactions.push(LedgerTransaction::qdro_in(id + 2, 2, 2024, amount));
    }
    source(
        vec![
            employee(1, 10, Enrollment::OldPlanContributions, 6),
            employee(2, 20, Enrollment::NewPlanContributions, 3),
        ],
        vec![],
        transactions,
        vec![opening(1, 2023, Money::new(amounts.iter().sum::<i64>(), 2))],
    )
    .expect("distinct ids")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn paired_transfers_sum_to_zero(amounts in proptest::collection::vec(1i64..1_000_000, 1..16)) {
        let source = transfer_source(&amounts);
        let result = Engine::new(EngineConfig::default())
            .compute(&source, &ComputeRequest::year(2024), &CancellationToken::new())
            .expect("compute");
        let report = &result.validation[0];
        prop_assert_eq!(&report.zero_sum, &RuleOutcome::Passed);
        prop_assert_eq!(result.totals.ending_balance, result.totals.beginning_balance);
        for record in &result.records {
            prop_assert!(record.balance.reconciles());
            prop_assert!(record.vesting.vested_balance <= record.balance.ending_balance);
        }
    }

    #[test]
    fn recompute_is_idempotent(amounts in proptest::collection::vec(1i64..1_000_000, 1..8)) {
        let source = transfer_source(&amounts);
        let year_end = Engine::new(EngineConfig::default());
        let request = ComputeRequest::year(2024);
        let first = year_end.compute(&source, &request, &CancellationToken::new()).expect("compute");
        let second = year_end.compute(&source, &request, &CancellationToken::new()).expect("compute");
        prop_assert_eq!(first, second);
    }
}

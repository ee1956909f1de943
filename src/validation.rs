//! Year-level reconciliation checks. Runs only once every partition has
//! settled; never mutates and never fails on a mismatch.

use crate::checksum::{FieldDrift, ReportChecksum, compare};
use crate::engine::MemberYearRecord;
use crate::error::DataIntegrityError;
use crate::{Money, ProfitYear};
use log::{info, warn};
use std::collections::BTreeMap;

pub const BEGINNING_BALANCE: &str = "BeginningBalance";
pub const CONTRIBUTIONS: &str = "Contributions";
pub const EARNINGS: &str = "Earnings";
pub const FORFEITURES: &str = "Forfeitures";
pub const DISTRIBUTIONS: &str = "Distributions";
pub const BENEFICIARY_ALLOCATION: &str = "BeneficiaryAllocation";
pub const ENDING_BALANCE: &str = "EndingBalance";
pub const VESTED_BALANCE: &str = "VestedBalance";

/// Sums over a set of member-year records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub members: usize,
    pub beginning_balance: Money,
    pub contributions: Money,
    pub earnings: Money,
    pub forfeitures: Money,
    pub distributions: Money,
    pub allocations_in: Money,
    pub allocations_out: Money,
    pub ending_balance: Money,
    pub vested_balance: Money,
}

impl Totals {
    pub fn of<'a>(records: impl IntoIterator<Item = &'a MemberYearRecord>) -> Self {
        let mut totals = Self::default();
        for record in records {
            totals.add(record);
        }
        totals
    }

    pub fn add(&mut self, record: &MemberYearRecord) {
        let balance = &record.balance;
        self.members += 1;
        self.beginning_balance += balance.beginning_balance;
        self.contributions += balance.amounts.contributions;
        self.earnings += balance.amounts.earnings;
        self.forfeitures += balance.amounts.forfeitures;
        self.distributions += balance.amounts.distributions;
        self.allocations_in += balance.amounts.allocations_in;
        self.allocations_out += balance.amounts.allocations_out;
        self.ending_balance += balance.ending_balance;
        self.vested_balance += record.vesting.vested_balance;
    }

    pub fn beneficiary_allocation(&self) -> Money {
        self.allocations_in + self.allocations_out
    }

    /// Named values as archived in report checksums.
    pub fn fields(&self) -> BTreeMap<String, Money> {
        [
            (BEGINNING_BALANCE, self.beginning_balance),
            (CONTRIBUTIONS, self.contributions),
            (EARNINGS, self.earnings),
            (FORFEITURES, self.forfeitures),
            (DISTRIBUTIONS, self.distributions),
            (BENEFICIARY_ALLOCATION, self.beneficiary_allocation()),
            (ENDING_BALANCE, self.ending_balance),
            (VESTED_BALANCE, self.vested_balance),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

/// A report surface that states its own ending balance (PAY444 layout).
/// Outflows are stated as positive amounts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BalanceStatement {
    pub beginning_balance: Money,
    pub contributions: Money,
    pub allocations_in: Money,
    pub distributions: Money,
    pub allocations_out: Money,
    pub earnings: Money,
    pub forfeitures: Money,
    pub ending_balance: Money,
}

impl BalanceStatement {
    pub const KEYS: [&'static str; 8] = [
        "BeginningBalance",
        "CONTRIB",
        "ALLOC",
        "DISTRIB",
        "PAIDALLOC",
        "EARNINGS",
        "FORFEITS",
        "EndingBalance",
    ];

    /// Absent keys read as zero.
    pub fn from_fields(fields: &BTreeMap<String, Money>) -> Self {
        let get = |key: &str| {
            fields.get(key).copied().unwrap_or_else(|| {
                warn!("balance statement has no {key}; treating as zero");
                Money::ZERO
            })
        };
        Self {
            beginning_balance: get("BeginningBalance"),
            contributions: get("CONTRIB"),
            allocations_in: get("ALLOC"),
            distributions: get("DISTRIB"),
            allocations_out: get("PAIDALLOC"),
            earnings: get("EARNINGS"),
            forfeitures: get("FORFEITS"),
            ending_balance: get("EndingBalance"),
        }
    }

    pub fn computed_ending(&self) -> Money {
        self.beginning_balance + self.contributions + self.allocations_in - self.distributions
            - self.allocations_out
            + self.earnings
            - self.forfeitures
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Passed,
    Failed(Vec<DataIntegrityError>),
    NotApplicable(String),
}

impl RuleOutcome {
    pub fn failed(&self) -> bool {
        matches!(self, RuleOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResult {
    pub name: &'static str,
    pub priority: Priority,
    pub outcome: RuleOutcome,
}

/// Cross-checks of recomputed totals against the archived report, by group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossReferenceSummary {
    pub groups: Vec<GroupResult>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub critical_issues: Vec<String>,
    pub warnings: Vec<String>,
    /// Set when any critical group failed; the year must not be published.
    pub block: bool,
}

const GROUPS: [(&str, Priority, &[&str]); 6] = [
    ("Balances", Priority::Critical, &[BEGINNING_BALANCE, ENDING_BALANCE]),
    ("Distributions", Priority::Critical, &[DISTRIBUTIONS]),
    ("Forfeitures", Priority::Critical, &[FORFEITURES]),
    ("Beneficiary allocations", Priority::Critical, &[BENEFICIARY_ALLOCATION]),
    ("Contributions", Priority::High, &[CONTRIBUTIONS, EARNINGS]),
    ("Vesting", Priority::High, &[VESTED_BALANCE]),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub year: ProfitYear,
    pub zero_sum: RuleOutcome,
    pub balance_equation: RuleOutcome,
    pub checksum_drift: RuleOutcome,
    pub drift: Vec<FieldDrift>,
    pub cross_reference: CrossReferenceSummary,
}

impl ValidationReport {
    pub fn integrity_errors(&self) -> Vec<&DataIntegrityError> {
        [&self.zero_sum, &self.balance_equation, &self.checksum_drift]
            .into_iter()
            .flat_map(|outcome| match outcome {
                RuleOutcome::Failed(errors) => errors.iter().collect(),
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn passed(&self) -> bool {
        !self.zero_sum.failed()
            && !self.balance_equation.failed()
            && !self.checksum_drift.failed()
            && !self.cross_reference.block
    }
}

/// Σ allocations in + Σ allocations out must be exactly zero.
pub fn zero_sum(year: ProfitYear, totals: &Totals) -> RuleOutcome {
    let net = totals.beneficiary_allocation();
    if net.is_zero() {
        RuleOutcome::Passed
    } else {
        RuleOutcome::Failed(vec![DataIntegrityError {
            rule: "beneficiary allocation zero-sum".to_string(),
            year,
            expected: Money::ZERO,
            actual: net,
            variance: net,
        }])
    }
}

pub fn balance_equation(year: ProfitYear, statement: Option<&BalanceStatement>) -> RuleOutcome {
    let Some(statement) = statement else {
        return RuleOutcome::NotApplicable("no report states an ending balance".to_string());
    };
    let computed = statement.computed_ending();
    if computed == statement.ending_balance {
        RuleOutcome::Passed
    } else {
        RuleOutcome::Failed(vec![DataIntegrityError {
            rule: "balance equation".to_string(),
            year,
            expected: statement.ending_balance,
            actual: computed,
            variance: computed - statement.ending_balance,
        }])
    }
}

pub fn checksum_drift(year: ProfitYear, drift: &[FieldDrift]) -> RuleOutcome {
    if drift.is_empty() {
        return RuleOutcome::NotApplicable("no archived checksum".to_string());
    }
    let errors: Vec<DataIntegrityError> = drift
        .iter()
        .filter(|field| !field.matches())
        .map(|field| DataIntegrityError {
            rule: format!("checksum drift: {}", field.field),
            year,
            expected: field.archived,
            actual: field.current,
            variance: field.variance,
        })
        .collect();
    if errors.is_empty() {
        RuleOutcome::Passed
    } else {
        RuleOutcome::Failed(errors)
    }
}

pub fn cross_reference(year: ProfitYear, drift: &[FieldDrift]) -> CrossReferenceSummary {
    let by_field: BTreeMap<&str, &FieldDrift> =
        drift.iter().map(|d| (d.field.as_str(), d)).collect();
    let mut summary = CrossReferenceSummary::default();
    for (name, priority, fields) in GROUPS {
        let checked: Vec<&FieldDrift> = fields
            .iter()
            .filter_map(|field| by_field.get(field).copied())
            .collect();
        let outcome = if checked.is_empty() {
            RuleOutcome::NotApplicable(format!("{name} not archived"))
        } else {
            checksum_drift(year, &checked.into_iter().cloned().collect::<Vec<_>>())
        };
        match &outcome {
            RuleOutcome::Passed => {
                summary.total += 1;
                summary.passed += 1;
            }
            RuleOutcome::Failed(errors) => {
                summary.total += 1;
                summary.failed += 1;
                let issues = errors.iter().map(|e| format!("{name}: {e}"));
                match priority {
                    Priority::Critical => summary.critical_issues.extend(issues),
                    Priority::High => summary.warnings.extend(issues),
                }
            }
            RuleOutcome::NotApplicable(_) => {}
        }
        summary.groups.push(GroupResult {
            name,
            priority,
            outcome,
        });
    }
    summary.block = !summary.critical_issues.is_empty();
    summary
}

/// Runs every rule for one year over its full, unpaginated record set.
pub fn validate(
    year: ProfitYear,
    totals: &Totals,
    archived: Option<&ReportChecksum>,
    statement: Option<&BalanceStatement>,
) -> ValidationReport {
    let drift = archived
        .map(|archive| {
            let tampered = archive.tampered_fields();
            if !tampered.is_empty() {
                warn!(
                    "archived {} {year} has fields whose hash no longer matches: {}",
                    archive.report_type,
                    tampered.join(", ")
                );
            }
            compare(archive, &totals.fields())
        })
        .unwrap_or_default();
    let report = ValidationReport {
        year,
        zero_sum: zero_sum(year, totals),
        balance_equation: balance_equation(year, statement),
        checksum_drift: checksum_drift(year, &drift),
        cross_reference: cross_reference(year, &drift),
        drift,
    };
    for error in report.integrity_errors() {
        warn!("{error}");
    }
    let summary = &report.cross_reference;
    info!(
        "year {year}: {} of {} cross-reference groups passed, {} critical, {} warnings{}",
        summary.passed,
        summary.total,
        summary.critical_issues.len(),
        summary.warnings.len(),
        if summary.block { "; blocked" } else { "" }
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn statement_fields(pairs: &[(&str, i64)]) -> BTreeMap<String, Money> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), Money::from(*value)))
            .collect()
    }

    #[test]
    fn zero_sum_is_exact() {
        let balanced = Totals {
            allocations_in: Money::new(50000, 2),
            allocations_out: Money::new(-50000, 2),
            ..Default::default()
        };
        assert_eq!(zero_sum(2024, &balanced), RuleOutcome::Passed);

        let off_by_a_cent = Totals {
            allocations_in: Money::new(50000, 2),
            allocations_out: Money::new(-49999, 2),
            ..Default::default()
        };
        let RuleOutcome::Failed(errors) = zero_sum(2024, &off_by_a_cent) else {
            panic!("expected a zero-sum failure");
        };
        assert_eq!(errors[0].variance, Money::new(1, 2));
    }

    #[test]
    fn balance_equation_uses_stated_fields() {
        let fields = statement_fields(&[
            ("BeginningBalance", 1000),
            ("CONTRIB", 200),
            ("ALLOC", 50),
            ("DISTRIB", 100),
            ("PAIDALLOC", 50),
            ("EARNINGS", 30),
            ("FORFEITS", 30),
            ("EndingBalance", 1100),
        ]);
        let statement = BalanceStatement::from_fields(&fields);
        assert_eq!(balance_equation(2024, Some(&statement)), RuleOutcome::Passed);

        let mut wrong = statement;
        wrong.ending_balance = Money::from(1099);
        assert!(balance_equation(2024, Some(&wrong)).failed());
        assert!(matches!(
            balance_equation(2024, None),
            RuleOutcome::NotApplicable(_)
        ));
    }

    #[test]
    fn missing_statement_keys_read_as_zero() {
        let statement = BalanceStatement::from_fields(&statement_fields(&[
            ("BeginningBalance", 10),
            ("EndingBalance", 10),
        ]));
        assert_eq!(statement.contributions, Money::ZERO);
        assert_eq!(statement.computed_ending(), Money::from(10));
    }

    #[test]
    fn critical_drift_blocks() {
        let totals = Totals {
            ending_balance: Money::from(1000),
            vested_balance: Money::from(200),
            ..Default::default()
        };
        let archive = ReportChecksum::capture(
            2024,
            "TerminatedEmployees",
            Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap(),
            [
                (BEGINNING_BALANCE, Money::ZERO),
                (ENDING_BALANCE, Money::from(990)),
                (VESTED_BALANCE, Money::from(201)),
            ],
        );
        let report = validate(2024, &totals, Some(&archive), None);
        assert!(report.checksum_drift.failed());
        let summary = &report.cross_reference;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.critical_issues.len(), 1);
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.block);
        assert!(!report.passed());
    }

    #[test]
    fn high_priority_drift_only_warns() {
        let totals = Totals {
            vested_balance: Money::from(200),
            ..Default::default()
        };
        let archive = ReportChecksum::capture(
            2024,
            "TerminatedEmployees",
            Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap(),
            [(ENDING_BALANCE, Money::ZERO), (VESTED_BALANCE, Money::from(199))],
        );
        let summary = validate(2024, &totals, Some(&archive), None).cross_reference;
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.warnings.len(), 1);
        assert!(!summary.block);
    }

    #[test]
    fn nothing_archived_is_not_a_failure() {
        let report = validate(2024, &Totals::default(), None, None);
        assert!(matches!(report.checksum_drift, RuleOutcome::NotApplicable(_)));
        assert_eq!(report.cross_reference.total, 0);
        assert!(report.passed());
    }
}

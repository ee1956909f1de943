use crate::checksum::{self, ReportChecksum};
use crate::error::Result;
use crate::ledger::LedgerTransaction;
use crate::ledger_store::{Ledger, RevertSummary};
use crate::members::{BeneficiaryRecord, EmployeeRecord};
use crate::vesting::ScheduleDetail;
use crate::{Money, ProfitYear, RunID, Ssn};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::ops::RangeInclusive;
use std::path::Path;

/// Ending balance of a member as of the close of `year`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PriorBalance {
    pub ssn: Ssn,
    pub year: ProfitYear,
    pub ending_balance: Money,
}

/// Read-only collaborator the engine fetches from once per run.
pub trait LedgerSource {
    fn transactions(
        &self,
        ssns: &BTreeSet<Ssn>,
        years: RangeInclusive<ProfitYear>,
    ) -> Result<Vec<LedgerTransaction>>;

    fn employees(&self, years: RangeInclusive<ProfitYear>) -> Result<Vec<EmployeeRecord>>;

    fn beneficiaries(&self) -> Result<Vec<BeneficiaryRecord>>;

    /// Reference schedule rows. Empty means the standard schedules apply.
    fn schedule_details(&self, year: ProfitYear) -> Result<Vec<ScheduleDetail>>;

    /// Ending balances at the close of `year`.
    fn prior_balances(&self, year: ProfitYear, ssns: &BTreeSet<Ssn>)
    -> Result<BTreeMap<Ssn, Money>>;

    fn archived_checksums(&self, year: ProfitYear) -> Result<Vec<ReportChecksum>>;
}

/// A source whose ledger can drop the rows of a processing run.
pub trait RevertibleSource: LedgerSource {
    fn revert_run(&mut self, run_id: RunID) -> Result<RevertSummary>;
}

/// Everything held in memory, loaded from a directory of CSV files.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub ledger: Ledger,
    pub employees: Vec<EmployeeRecord>,
    pub beneficiaries: Vec<BeneficiaryRecord>,
    pub schedule: Vec<ScheduleDetail>,
    pub balances: Vec<PriorBalance>,
    pub checksums: Vec<ReportChecksum>,
}

pub const TRANSACTIONS_FILE: &str = "transactions.csv";
pub const EMPLOYEES_FILE: &str = "employees.csv";
pub const BENEFICIARIES_FILE: &str = "beneficiaries.csv";
pub const BALANCES_FILE: &str = "balances.csv";
pub const CHECKSUMS_FILE: &str = "checksums.csv";
pub const VESTING_FILE: &str = "vesting.csv";

fn read_rows<T: DeserializeOwned, R: std::io::Read>(reader: R) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

fn read_optional<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Vec<T>> {
    let path = dir.join(name);
    if !path.exists() {
        debug!("{} not present", path.display());
        return Ok(Vec::new());
    }
    read_rows(File::open(path)?)
}

impl MemorySource {
    /// Transactions and employees are required; every other file is optional.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let ledger = Ledger::from_csv(File::open(dir.join(TRANSACTIONS_FILE))?)?;
        let employees = read_rows(File::open(dir.join(EMPLOYEES_FILE))?)?;
        let checksums = {
            let path = dir.join(CHECKSUMS_FILE);
            if path.exists() {
                checksum::read_csv(File::open(path)?)?
            } else {
                Vec::new()
            }
        };
        let source = Self {
            ledger,
            employees,
            beneficiaries: read_optional(dir, BENEFICIARIES_FILE)?,
            schedule: read_optional(dir, VESTING_FILE)?,
            balances: read_optional(dir, BALANCES_FILE)?,
            checksums,
        };
        info!(
            "loaded {} ledger rows, {} employee rows, {} beneficiaries from {}",
            source.ledger.len(),
            source.employees.len(),
            source.beneficiaries.len(),
            dir.display()
        );
        Ok(source)
    }

    pub fn from_readers<R: std::io::Read>(transactions: R, employees: R) -> Result<Self> {
        Ok(Self {
            ledger: Ledger::from_csv(transactions)?,
            employees: read_rows(employees)?,
            ..Default::default()
        })
    }

    pub fn with_beneficiaries<R: std::io::Read>(mut self, reader: R) -> Result<Self> {
        self.beneficiaries = read_rows(reader)?;
        Ok(self)
    }

    pub fn with_balances<R: std::io::Read>(mut self, reader: R) -> Result<Self> {
        self.balances = read_rows(reader)?;
        Ok(self)
    }

    pub fn with_checksums<R: std::io::Read>(mut self, reader: R) -> Result<Self> {
        self.checksums = checksum::read_csv(reader)?;
        Ok(self)
    }

    /// Writes the ledger back after a revert.
    pub fn save_ledger(&self, dir: &Path) -> Result<()> {
        self.ledger
            .write_csv(File::create(dir.join(TRANSACTIONS_FILE))?)
    }
}

impl LedgerSource for MemorySource {
    fn transactions(
        &self,
        ssns: &BTreeSet<Ssn>,
        years: RangeInclusive<ProfitYear>,
    ) -> Result<Vec<LedgerTransaction>> {
        Ok(self.ledger.select(Some(ssns), years).cloned().collect())
    }

    fn employees(&self, years: RangeInclusive<ProfitYear>) -> Result<Vec<EmployeeRecord>> {
        Ok(self
            .employees
            .iter()
            .filter(|e| years.contains(&e.year))
            .cloned()
            .collect())
    }

    fn beneficiaries(&self) -> Result<Vec<BeneficiaryRecord>> {
        Ok(self.beneficiaries.clone())
    }

    fn schedule_details(&self, _year: ProfitYear) -> Result<Vec<ScheduleDetail>> {
        Ok(self.schedule.clone())
    }

    fn prior_balances(
        &self,
        year: ProfitYear,
        ssns: &BTreeSet<Ssn>,
    ) -> Result<BTreeMap<Ssn, Money>> {
        Ok(self
            .balances
            .iter()
            .filter(|b| b.year == year && ssns.contains(&b.ssn))
            .map(|b| (b.ssn, b.ending_balance))
            .collect())
    }

    fn archived_checksums(&self, year: ProfitYear) -> Result<Vec<ReportChecksum>> {
        Ok(self
            .checksums
            .iter()
            .filter(|c| c.year == year)
            .cloned()
            .collect())
    }
}

impl RevertibleSource for MemorySource {
    fn revert_run(&mut self, run_id: RunID) -> Result<RevertSummary> {
        Ok(self.ledger.revert_run(run_id))
    }
}

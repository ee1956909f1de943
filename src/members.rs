use crate::codes::{
    Enrollment, EnrollmentId, TerminationCode, TerminationCodeId, ZeroContributionReason,
    ZeroContributionReasonId,
};
use crate::error::MissingReference;
use crate::{BadgeNumber, Money, ProfitYear, PsnSuffix, Ssn};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

/// Employee projection for one profit year, in storage codes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmployeeRecord {
    pub ssn: Ssn,
    pub badge: BadgeNumber,
    pub year: ProfitYear,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub termination_date: Option<NaiveDate>,
    #[serde(default)]
    pub termination_code: Option<TerminationCodeId>,
    pub years_in_plan: u8,
    pub enrollment: EnrollmentId,
    #[serde(default)]
    pub zero_contribution_reason: Option<ZeroContributionReasonId>,
    #[serde(default)]
    pub etva: Money,
}

/// Beneficiary contact. `employee_badge` is the member the beneficiary is
/// attached to.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BeneficiaryRecord {
    pub ssn: Ssn,
    pub psn_suffix: PsnSuffix,
    #[serde(default)]
    pub employee_badge: Option<BadgeNumber>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
}

/// How a person was found. Decided once here; nothing downstream re-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberIdentity {
    EmployeeOnly,
    BeneficiaryOnly,
    /// Employee and beneficiary share the SSN; the employee view was kept.
    Both,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMember {
    pub identity: MemberIdentity,
    pub badge: BadgeNumber,
    pub psn_suffix: PsnSuffix,
    pub ssn: Ssn,
    pub year: ProfitYear,
    pub birth_date: Option<NaiveDate>,
    pub termination_date: Option<NaiveDate>,
    pub termination_code: Option<TerminationCode>,
    pub years_in_plan: u8,
    pub enrollment: Enrollment,
    pub zero_contribution_reason: ZeroContributionReason,
    pub etva: Money,
}

impl ResolvedMember {
    pub fn is_beneficiary_only(&self) -> bool {
        self.identity == MemberIdentity::BeneficiaryOnly
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFilter {
    pub years: RangeInclusive<ProfitYear>,
    pub badges: Option<BTreeSet<BadgeNumber>>,
    /// Keep only employees terminated within this inclusive window.
    pub terminated_between: Option<(NaiveDate, NaiveDate)>,
}

impl MemberFilter {
    pub fn year(year: ProfitYear) -> Self {
        Self {
            years: year..=year,
            badges: None,
            terminated_between: None,
        }
    }

    fn wants_badge(&self, badge: BadgeNumber) -> bool {
        self.badges
            .as_ref()
            .is_none_or(|badges| badges.contains(&badge))
    }

    fn wants_termination(&self, date: Option<NaiveDate>) -> bool {
        match (self.terminated_between, date) {
            (None, _) => true,
            (Some((from, to)), Some(date)) => from <= date && date <= to,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionStats {
    pub employees: usize,
    pub beneficiaries: usize,
    pub suppressed: usize,
    pub dropped: usize,
    pub excluded: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Resolution {
    /// Ordered by badge, PSN suffix, then year.
    pub members: Vec<ResolvedMember>,
    pub skipped: Vec<MissingReference>,
    pub stats: ResolutionStats,
}

impl Resolution {
    pub fn ssns(&self) -> BTreeSet<Ssn> {
        self.members.iter().map(|m| m.ssn).collect()
    }
}

pub struct MemberResolver {
    beneficiary_years_in_plan: u8,
}

impl MemberResolver {
    pub fn new(beneficiary_years_in_plan: u8) -> Self {
        Self {
            beneficiary_years_in_plan,
        }
    }

    pub fn resolve(
        &self,
        employees: &[EmployeeRecord],
        beneficiaries: &[BeneficiaryRecord],
        filter: &MemberFilter,
    ) -> Resolution {
        let mut resolution = Resolution::default();
        let known_badges: BTreeSet<BadgeNumber> = employees.iter().map(|e| e.badge).collect();

        for employee in employees
            .iter()
            .filter(|e| filter.years.contains(&e.year) && filter.wants_badge(e.badge))
        {
            match self.employee(employee, filter) {
                Ok(Some(member)) => {
                    resolution.stats.employees += 1;
                    resolution.members.push(member);
                }
                Ok(None) => resolution.stats.excluded += 1,
                Err(missing) => {
                    warn!("{missing}; skipping");
                    resolution.skipped.push(missing);
                }
            }
        }

        // Suppress only against employees actually reported.
        let employee_ssns: BTreeSet<Ssn> = resolution.ssns();
        let mut seen = BTreeSet::new();
        for beneficiary in beneficiaries {
            if !seen.insert(beneficiary.ssn) {
                debug!(
                    "beneficiary {} repeats an ssn already resolved",
                    beneficiary.psn_suffix
                );
                continue;
            }
            if employee_ssns.contains(&beneficiary.ssn) {
                debug!(
                    "beneficiary {} shares ssn with an employee; employee view kept",
                    beneficiary.psn_suffix
                );
                resolution.stats.suppressed += 1;
                continue;
            }
            let Some(badge) = beneficiary
                .employee_badge
                .filter(|badge| known_badges.contains(badge))
            else {
                let missing = MissingReference::UnlinkedBeneficiary {
                    badge: beneficiary.employee_badge.unwrap_or_default(),
                    psn_suffix: beneficiary.psn_suffix,
                    ssn: beneficiary.ssn,
                };
                warn!("{missing}; dropping");
                resolution.stats.dropped += 1;
                resolution.skipped.push(missing);
                continue;
            };
            if !filter.wants_badge(badge) {
                continue;
            }
            resolution.stats.beneficiaries += 1;
            for year in filter.years.clone() {
                resolution.members.push(self.beneficiary(beneficiary, badge, year));
            }
        }

        let beneficiary_ssns: BTreeSet<Ssn> = beneficiaries.iter().map(|b| b.ssn).collect();
        for member in resolution
            .members
            .iter_mut()
            .filter(|m| m.identity == MemberIdentity::EmployeeOnly)
        {
            if beneficiary_ssns.contains(&member.ssn) {
                member.identity = MemberIdentity::Both;
            }
        }

        resolution
            .members
            .sort_by_key(|m| (m.badge, m.psn_suffix, m.year));
        info!(
            "resolved {} employee rows and {} beneficiaries ({} suppressed, {} dropped, {} excluded)",
            resolution.stats.employees,
            resolution.stats.beneficiaries,
            resolution.stats.suppressed,
            resolution.stats.dropped,
            resolution.stats.excluded,
        );
        resolution
    }

    /// `Ok(None)` for members excluded outright (pensioners, outside the
    /// termination window).
    fn employee(
        &self,
        employee: &EmployeeRecord,
        filter: &MemberFilter,
    ) -> Result<Option<ResolvedMember>, MissingReference> {
        let enrollment = Enrollment::from_raw(employee.enrollment).map_err(|_| {
            MissingReference::NoVestingSchedule {
                ssn: employee.ssn,
                year: employee.year,
                raw: employee.enrollment.0,
            }
        })?;
        let mut reason = match employee.zero_contribution_reason {
            None => ZeroContributionReason::Normal,
            Some(raw) => ZeroContributionReason::from_raw(raw).map_err(|_| {
                MissingReference::UnknownZeroContributionReason {
                    ssn: employee.ssn,
                    year: employee.year,
                    raw: raw.0,
                }
            })?,
        };
        let termination_code = match employee.termination_code {
            None => None,
            Some(raw) => Some(TerminationCode::from_raw(raw).map_err(|_| {
                MissingReference::UnknownTerminationCode {
                    ssn: employee.ssn,
                    year: employee.year,
                    raw: raw.0,
                }
            })?),
        };

        if termination_code == Some(TerminationCode::RetiredReceivingPension)
            || !filter.wants_termination(employee.termination_date)
        {
            return Ok(None);
        }
        if termination_code == Some(TerminationCode::Deceased) {
            reason = ZeroContributionReason::SixtyFiveAndOverFullyVested;
        }

        Ok(Some(ResolvedMember {
            identity: MemberIdentity::EmployeeOnly,
            badge: employee.badge,
            psn_suffix: 0,
            ssn: employee.ssn,
            year: employee.year,
            birth_date: employee.birth_date,
            termination_date: employee.termination_date,
            termination_code,
            years_in_plan: employee.years_in_plan,
            enrollment,
            zero_contribution_reason: reason,
            etva: employee.etva,
        }))
    }

    fn beneficiary(
        &self,
        beneficiary: &BeneficiaryRecord,
        badge: BadgeNumber,
        year: ProfitYear,
    ) -> ResolvedMember {
        ResolvedMember {
            identity: MemberIdentity::BeneficiaryOnly,
            badge,
            psn_suffix: beneficiary.psn_suffix,
            ssn: beneficiary.ssn,
            year,
            birth_date: beneficiary.birth_date,
            termination_date: None,
            termination_code: None,
            years_in_plan: self.beneficiary_years_in_plan,
            enrollment: Enrollment::NotEnrolled,
            zero_contribution_reason: ZeroContributionReason::SixtyFiveAndOverFullyVested,
            etva: Money::ZERO,
        }
    }
}

/// Members grouped per SSN, in resolver order, for partitioned processing.
pub fn by_ssn(members: &[ResolvedMember]) -> BTreeMap<Ssn, Vec<&ResolvedMember>> {
    let mut partitions: BTreeMap<Ssn, Vec<&ResolvedMember>> = BTreeMap::new();
    for member in members {
        partitions.entry(member.ssn).or_default().push(member);
    }
    partitions
}

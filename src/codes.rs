//! Closed code tables.
//!
//! Each table is an enum plus a separate raw storage type. The only way between
//! the two is `from_raw` (fallible) and `raw` (total); there is no `From` impl in
//! either direction, so a raw code can't slip into the domain unchecked.

use crate::error::{ReconcileError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! closed_code {
    (
        $(#[$meta:meta])*
        $name:ident($raw:ident: $repr:ty) {
            $($variant:ident = $value:literal => $label:literal,)+
        }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $raw(pub $repr);

        impl fmt::Display for $raw {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const TABLE: &'static [($name, $repr, &'static str)] =
                &[$(($name::$variant, $value, $label),)+];

            pub fn from_raw(raw: $raw) -> Result<Self> {
                Self::TABLE
                    .iter()
                    .find(|(_, value, _)| *value == raw.0)
                    .map(|(code, _, _)| *code)
                    .ok_or_else(|| ReconcileError::UnknownCode {
                        table: stringify!($name),
                        raw: raw.0.to_string(),
                    })
            }

            pub fn raw(self) -> $raw {
                match self {
                    $($name::$variant => $raw($value),)+
                }
            }

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} ({})", self.raw(), self.label())
            }
        }
    };
}

closed_code! {
    /// Ledger transaction discriminant.
    ProfitCode(ProfitCodeId: u8) {
        IncomingContributions = 0 => "Incoming contributions, forfeitures, earnings",
        OutgoingPartialWithdrawal = 1 => "Outgoing payments - partial withdrawal",
        OutgoingForfeitures = 2 => "Outgoing forfeitures",
        OutgoingDirectPayments = 3 => "Outgoing direct payments / rollover payments",
        OutgoingXferBeneficiary = 5 => "Outgoing XFER beneficiary / QDRO allocation",
        IncomingQdroBeneficiary = 6 => "Incoming QDRO beneficiary allocation",
        Incoming100PercentVestedEarnings = 8 => "Incoming 100% vested earnings",
        Outgoing100PercentVestedPayment = 9 => "Outgoing payment from 100% vested amount",
    }
}

closed_code! {
    /// Plan era and whether the member has contribution or forfeiture records.
    Enrollment(EnrollmentId: u8) {
        NotEnrolled = 0 => "Not enrolled",
        OldPlanContributions = 1 => "Old vesting plan has contributions (7 years to full vesting)",
        NewPlanContributions = 2 => "New vesting plan has contributions (6 years to full vesting)",
        OldPlanForfeitures = 3 => "Old vesting plan has forfeiture records",
        NewPlanForfeitures = 4 => "New vesting plan has forfeiture records",
    }
}

closed_code! {
    ZeroContributionReason(ZeroContributionReasonId: u8) {
        Normal = 0 => "Normal",
        Under21Over1000Hours = 1 => "18, 19, or 20 with > 1000 hours",
        TerminatedOver1000Hours = 2 => "Terminated employee > 1000 hours worked gets year vested",
        Over64Under1000HoursOneYear = 3 => "Over 64 and < 1000 hours gets 1 year vesting (obsolete)",
        Over64Under1000HoursTwoYears = 4 => "Over 64 and < 1000 hours gets 2 years vesting (obsolete)",
        Over64Over1000HoursThreeYears = 5 => "Over 64 and > 1000 hours gets 3 years vesting (obsolete)",
        SixtyFiveAndOverFullyVested = 6 => ">= 65 and 1st contribution >= 5 years ago gets 100% vested",
        SixtyFourBirthdayFullyVested = 7 => "= 64 and 1st contribution >= 5 years ago gets 100% vested on birthday",
    }
}

closed_code! {
    CommentType(CommentTypeId: u8) {
        TransferOut = 1 => "Transfer out",
        TransferIn = 2 => "Transfer in",
        QdroOut = 3 => "QDRO out",
        QdroIn = 4 => "QDRO in",
        Forfeit = 5 => "Forfeit",
        UnForfeit = 6 => "Un-forfeit",
        OneHundredPercentEarnings = 7 => "100% earnings",
        Reversal = 8 => "Reversal",
        UndoReversal = 9 => "Undo reversal",
    }
}

closed_code! {
    TerminationCode(TerminationCodeId: char) {
        LeftOnOwn = 'A' => "Left on own",
        PersonalOrFamilyReason = 'B' => "Personal or family reason",
        CouldNotWorkAvailableHours = 'C' => "Could not work available hours",
        Stealing = 'D' => "Stealing",
        NotFollowingCompanyPolicy = 'E' => "Not following company policy",
        FmlaExpired = 'F' => "FMLA expired",
        TerminatedPrivate = 'G' => "Terminated private",
        JobAbandonment = 'H' => "Job abandonment",
        HealthReasonsNonFmla = 'I' => "Health reasons non-FMLA",
        LayoffNoWork = 'J' => "Layoff no work",
        SchoolOrSports = 'K' => "School or sports",
        MoveOutOfArea = 'L' => "Move out of area",
        PoorPerformance = 'M' => "Poor performance",
        OffForSummer = 'N' => "Off for summer",
        WorkmansCompensation = 'O' => "Workmans compensation",
        Injured = 'P' => "Injured",
        Transferred = 'Q' => "Transferred",
        Retired = 'R' => "Retired",
        Competition = 'S' => "Competition",
        AnotherJob = 'T' => "Another job",
        WouldNotRehire = 'U' => "Would not rehire",
        NeverReported = 'V' => "Never reported",
        RetiredReceivingPension = 'W' => "Retired receiving pension",
        Military = 'X' => "Military",
        FmlaApproved = 'Y' => "FMLA approved",
        Deceased = 'Z' => "Deceased",
    }
}

/// Which vesting schedule an enrollment draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VestingPlan {
    Old,
    New,
}

impl Enrollment {
    /// Not-enrolled members are measured against the old plan.
    pub fn plan(self) -> VestingPlan {
        match self {
            Enrollment::NotEnrolled
            | Enrollment::OldPlanContributions
            | Enrollment::OldPlanForfeitures => VestingPlan::Old,
            Enrollment::NewPlanContributions | Enrollment::NewPlanForfeitures => VestingPlan::New,
        }
    }

    pub fn has_forfeited(self) -> bool {
        matches!(
            self,
            Enrollment::OldPlanForfeitures | Enrollment::NewPlanForfeitures
        )
    }
}

impl ZeroContributionReason {
    /// Over-64 acceleration codes retired from the reference data. Still
    /// parseable so historical rows load, but they carry no vesting effect.
    pub fn is_obsolete(self) -> bool {
        matches!(
            self,
            ZeroContributionReason::Over64Under1000HoursOneYear
                | ZeroContributionReason::Over64Under1000HoursTwoYears
                | ZeroContributionReason::Over64Over1000HoursThreeYears
        )
    }

    pub fn forces_full_vesting(self) -> bool {
        self == ZeroContributionReason::SixtyFiveAndOverFullyVested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profit_codes_round_trip_through_raw_ids() -> Result<()> {
        for (code, raw, _) in ProfitCode::TABLE {
            assert_eq!(ProfitCode::from_raw(ProfitCodeId(*raw))?, *code);
            assert_eq!(code.raw(), ProfitCodeId(*raw));
        }
        Ok(())
    }

    #[test]
    fn unknown_profit_code_is_rejected() {
        let err = ProfitCode::from_raw(ProfitCodeId(4)).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::UnknownCode { table: "ProfitCode", .. }
        ));
        assert!(ProfitCode::from_raw(ProfitCodeId(7)).is_err());
    }

    #[test]
    fn enrollment_families() {
        assert_eq!(Enrollment::NotEnrolled.plan(), VestingPlan::Old);
        assert_eq!(Enrollment::OldPlanForfeitures.plan(), VestingPlan::Old);
        assert_eq!(Enrollment::NewPlanContributions.plan(), VestingPlan::New);
        assert_eq!(Enrollment::NewPlanForfeitures.plan(), VestingPlan::New);
        assert!(Enrollment::NewPlanForfeitures.has_forfeited());
        assert!(!Enrollment::OldPlanContributions.has_forfeited());
    }

    #[test]
    fn termination_codes_use_char_storage() -> Result<()> {
        assert_eq!(
            TerminationCode::from_raw(TerminationCodeId('Z'))?,
            TerminationCode::Deceased
        );
        assert_eq!(
            TerminationCode::RetiredReceivingPension.raw(),
            TerminationCodeId('W')
        );
        assert!(TerminationCode::from_raw(TerminationCodeId('1')).is_err());
        Ok(())
    }

    #[test]
    fn obsolete_reasons() {
        assert!(ZeroContributionReason::Over64Under1000HoursTwoYears.is_obsolete());
        assert!(!ZeroContributionReason::SixtyFiveAndOverFullyVested.is_obsolete());
        assert!(ZeroContributionReason::SixtyFiveAndOverFullyVested.forces_full_vesting());
        assert!(!ZeroContributionReason::SixtyFourBirthdayFullyVested.forces_full_vesting());
    }
}

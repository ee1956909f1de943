use crate::error::Result;
use crate::{Money, ProfitYear};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// SHA-256 of the value's canonical decimal text. Scale is normalized so that
/// `100.00` and `100` hash alike.
pub fn field_hash(value: Money) -> String {
    hex::encode(Sha256::digest(value.normalize().to_string().as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChecksum {
    pub value: Money,
    pub hash: String,
}

impl FieldChecksum {
    pub fn of(value: Money) -> Self {
        Self {
            value,
            hash: field_hash(value),
        }
    }
}

/// Archived totals of a published report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportChecksum {
    pub year: ProfitYear,
    pub report_type: String,
    pub created_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldChecksum>,
}

/// Storage shape: one row per archived field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChecksumRow {
    pub year: ProfitYear,
    pub report_type: String,
    pub created_at: DateTime<Utc>,
    pub field: String,
    pub value: Money,
    pub hash: String,
}

impl ReportChecksum {
    pub fn capture<'a>(
        year: ProfitYear,
        report_type: &str,
        created_at: DateTime<Utc>,
        fields: impl IntoIterator<Item = (&'a str, Money)>,
    ) -> Self {
        Self {
            year,
            report_type: report_type.to_string(),
            created_at,
            fields: fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), FieldChecksum::of(value)))
                .collect(),
        }
    }

    /// SHA-256 over the field hashes in field-name order.
    pub fn report_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in self.fields.values() {
            hasher.update(field.hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Fields whose stored hash no longer matches their stored value.
    pub fn tampered_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, field)| field_hash(field.value) != field.hash)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn values(&self) -> BTreeMap<String, Money> {
        self.fields
            .iter()
            .map(|(name, field)| (name.clone(), field.value))
            .collect()
    }

    pub fn rows(&self) -> Vec<ChecksumRow> {
        self.fields
            .iter()
            .map(|(name, field)| ChecksumRow {
                year: self.year,
                report_type: self.report_type.clone(),
                created_at: self.created_at,
                field: name.clone(),
                value: field.value,
                hash: field.hash.clone(),
            })
            .collect()
    }

    /// Regroups field rows into archives keyed by (year, report, capture time).
    pub fn from_rows(rows: impl IntoIterator<Item = ChecksumRow>) -> Vec<Self> {
        let mut archives: BTreeMap<(ProfitYear, String, DateTime<Utc>), Self> = BTreeMap::new();
        for row in rows {
            let archive = archives
                .entry((row.year, row.report_type.clone(), row.created_at))
                .or_insert_with(|| Self {
                    year: row.year,
                    report_type: row.report_type.clone(),
                    created_at: row.created_at,
                    fields: BTreeMap::new(),
                });
            archive.fields.insert(
                row.field,
                FieldChecksum {
                    value: row.value,
                    hash: row.hash,
                },
            );
        }
        archives.into_values().collect()
    }
}

/// The most recent archive for a year and report wins.
pub fn latest<'a>(
    archives: &'a [ReportChecksum],
    year: ProfitYear,
    report_type: &str,
) -> Option<&'a ReportChecksum> {
    archives
        .iter()
        .filter(|archive| archive.year == year && archive.report_type == report_type)
        .max_by_key(|archive| archive.created_at)
}

pub fn read_csv<R: std::io::Read>(reader: R) -> Result<Vec<ReportChecksum>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let rows = reader
        .deserialize::<ChecksumRow>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ReportChecksum::from_rows(rows))
}

pub fn write_csv<W: std::io::Write>(archives: &[ReportChecksum], writer: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in archives.iter().flat_map(ReportChecksum::rows) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDrift {
    pub field: String,
    pub archived: Money,
    pub current: Money,
    pub variance: Money,
}

impl FieldDrift {
    pub fn matches(&self) -> bool {
        self.variance.is_zero()
    }
}

/// Compares every archived field against its recomputed value. A field the
/// recomputation no longer produces counts as zero.
pub fn compare(archived: &ReportChecksum, current: &BTreeMap<String, Money>) -> Vec<FieldDrift> {
    archived
        .fields
        .iter()
        .map(|(name, field)| {
            let current = current.get(name).copied().unwrap_or_else(|| {
                warn!(
                    "{} {}: archived field {name} has no recomputed value",
                    archived.report_type, archived.year
                );
                Money::ZERO
            });
            let variance = if field_hash(current) == field.hash {
                Money::ZERO
            } else {
                current - field.value
            };
            FieldDrift {
                field: name.clone(),
                archived: field.value,
                current,
                variance,
            }
        })
        .collect()
}

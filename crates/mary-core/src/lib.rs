//! Core domain model for the Marilyn → ClickHouse sync: raw records, date windows,
//! fixed-point money, table addressing and column/engine descriptors.

use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive, Zero};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Loosely-typed record exactly as the reporting API returned it.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Date format used on the CLI, in API query bodies and as partition literals.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Placements,
    Stats,
    AdStats,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Placements, EntityKind::Stats, EntityKind::AdStats];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Placements => "placements",
            EntityKind::Stats => "stats",
            EntityKind::AdStats => "ad-stats",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "placements" | "placement" => Ok(EntityKind::Placements),
            "stats" | "stat" => Ok(EntityKind::Stats),
            "ad-stats" | "adstats" | "ad-stat" => Ok(EntityKind::AdStats),
            other => Err(format!("unknown entity kind `{other}` (expected placements, stats or ad-stats)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("end date {end} is before start date {start}")]
    EndBeforeStart { start: NaiveDate, end: NaiveDate },
    #[error("invalid date `{0}`, expected YYYY-MM-DD")]
    InvalidDate(String),
}

/// Inclusive calendar-date window covered by one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, RangeError> {
        if end < start {
            return Err(RangeError::EndBeforeStart { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, RangeError> {
        Self::new(parse_cli_date(start)?, parse_cli_date(end)?)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Every calendar date in the window, `start` first.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    pub fn len_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

pub fn parse_cli_date(input: &str) -> Result<NaiveDate, RangeError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT)
        .map_err(|_| RangeError::InvalidDate(input.to_string()))
}

/// Fixed-point amount with two decimal places, stored as hundredths.
///
/// Serializes as the raw `i64`, which is the RowBinary layout of ClickHouse
/// `Decimal(18, 2)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);
    pub const SCALE: i64 = 2;
    /// Integer digits `Decimal(18, 2)` can hold.
    const MAX_INTEGER_DIGITS: i64 = 16;
    /// Exclusive bound on the absolute value, in hundredths.
    const LIMIT: u64 = 1_000_000_000_000_000_000;

    pub fn from_hundredths(value: i64) -> Self {
        Self(value)
    }

    pub fn hundredths(self) -> i64 {
        self.0
    }

    /// Parses a decimal literal and rounds it to two places, half to even
    /// (`12.345 → 12.34`, `12.355 → 12.36`). Blank input is zero.
    ///
    /// The exponent is checked before rounding, so `1e2000000` fails without
    /// expanding two million digits.
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::ZERO);
        }
        let decimal =
            BigDecimal::from_str(trimmed).map_err(|_| format!("`{trimmed}` is not a decimal number"))?;
        if decimal.is_zero() {
            return Ok(Self::ZERO);
        }
        let too_large = || format!("`{trimmed}` does not fit Decimal(18, 2)");

        // The value lies below 10^magnitude.
        let (_, exponent) = decimal.as_bigint_and_exponent();
        let magnitude = i64::try_from(decimal.digits())
            .unwrap_or(i64::MAX)
            .saturating_sub(exponent);
        if magnitude > Self::MAX_INTEGER_DIGITS {
            return Err(too_large());
        }
        if magnitude < -Self::SCALE {
            return Ok(Self::ZERO);
        }

        let rounded = decimal.with_scale_round(Self::SCALE, RoundingMode::HalfEven);
        let (hundredths, scale) = rounded.as_bigint_and_exponent();
        debug_assert_eq!(scale, Self::SCALE);
        hundredths
            .to_i64()
            .filter(|value| value.unsigned_abs() < Self::LIMIT)
            .map(Self)
            .ok_or_else(too_large)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}

/// A single field failed to coerce; the whole record is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field `{field}`: {reason}")]
pub struct CoercionError {
    pub field: &'static str,
    pub reason: String,
}

impl CoercionError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    pub fn missing(field: &'static str) -> Self {
        Self::new(field, "required value is missing")
    }
}

/// How absent counts are represented in the target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountPolicy {
    /// `Nullable(UInt64)`: missing stays `None`.
    #[default]
    Nullable,
    /// `UInt64`: missing becomes `0`.
    ZeroFilled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier `{0}`: expected [A-Za-z_][A-Za-z0-9_]*")]
pub struct IdentifierError(pub String);

/// Fully-qualified `database.table` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    database: String,
    table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Result<Self, IdentifierError> {
        let database = validate_identifier(database.into())?;
        let table = validate_identifier(table.into())?;
        Ok(Self { database, table })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

pub fn validate_identifier(name: String) -> Result<String, IdentifierError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(IdentifierError(name))
    }
}

/// ClickHouse column types used by the three target tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    UInt8,
    UInt32,
    UInt64,
    NullableUInt64,
    String,
    LowCardinalityString,
    LowCardinalityStringArray,
    Date,
    DateTimeMillisUtc,
    Money,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::UInt8 => "UInt8",
            ColumnType::UInt32 => "UInt32",
            ColumnType::UInt64 => "UInt64",
            ColumnType::NullableUInt64 => "Nullable(UInt64)",
            ColumnType::String => "String",
            ColumnType::LowCardinalityString => "LowCardinality(String)",
            ColumnType::LowCardinalityStringArray => "Array(LowCardinality(String))",
            ColumnType::Date => "Date",
            ColumnType::DateTimeMillisUtc => "DateTime64(3, 'UTC')",
            ColumnType::Money => "Decimal(18, 2)",
        }
    }

    pub fn count(policy: CountPolicy) -> Self {
        match policy {
            CountPolicy::Nullable => ColumnType::NullableUInt64,
            CountPolicy::ZeroFilled => ColumnType::UInt64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty }
    }
}

/// Storage engine and, through it, the consistency strategy of a target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEngine {
    /// Dimension table: duplicates of `order_by` collapse during background
    /// merges, keeping the row with the greatest `version`.
    ReplacingMergeTree {
        version: &'static str,
        order_by: &'static [&'static str],
    },
    /// Fact table partitioned by a date column, reloaded partition by partition.
    PartitionedMergeTree {
        partition_by: &'static str,
        order_by: &'static [&'static str],
    },
}

impl TableEngine {
    pub fn reloads_partitions(&self) -> bool {
        matches!(self, TableEngine::PartitionedMergeTree { .. })
    }

    pub fn order_by(&self) -> &'static [&'static str] {
        match self {
            TableEngine::ReplacingMergeTree { order_by, .. }
            | TableEngine::PartitionedMergeTree { order_by, .. } => order_by,
        }
    }
}

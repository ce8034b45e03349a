//! Entity schemas and record transformers: how each Marilyn entity is fetched,
//! coerced into a typed row and laid out in ClickHouse.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mary_core::{
    ColumnDef, CoercionError, CountPolicy, DateRange, EntityKind, IdentifierError, Money,
    RawRecord, TableEngine, TableRef,
};
use mary_storage::{create_table_sql, ApiQuery, EntityRow, Grouping, StatisticsQuery};
use serde_json::Value as JsonValue;

pub mod entities;
pub mod row_serde;

pub use entities::{
    AdStatRow, PlacementRow, StatRow, AD_STATS, AD_STAT_COLUMNS, PLACEMENTS, PLACEMENT_COLUMNS,
    STATS, STAT_COLUMNS,
};

/// Per-run values a transformer may need besides the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformContext {
    /// Stamped onto dimension rows whose source record carries no sync time.
    pub synced_at: DateTime<Utc>,
}

pub type Transform<R> = fn(&RawRecord, &TransformContext) -> Result<R, CoercionError>;

/// Where the records of an entity come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitySource {
    ProjectPlacements,
    DetailedStatistics { grouping: Grouping },
}

/// Everything the generic pipeline needs to move one entity kind.
pub struct EntitySchema<R> {
    pub kind: EntityKind,
    pub table: &'static str,
    pub columns: &'static [ColumnDef],
    pub engine: TableEngine,
    pub source: EntitySource,
    pub transform: Transform<R>,
}

impl<R> Clone for EntitySchema<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for EntitySchema<R> {}

impl<R> std::fmt::Debug for EntitySchema<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySchema")
            .field("kind", &self.kind)
            .field("table", &self.table)
            .field("engine", &self.engine)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl<R: EntityRow> EntitySchema<R> {
    pub fn table_ref(&self, database: &str) -> Result<TableRef, IdentifierError> {
        TableRef::new(database, self.table)
    }

    pub fn create_table_sql(&self, table: &TableRef) -> String {
        create_table_sql(table, self.columns, &self.engine)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|column| column.name).collect()
    }

    /// The API query that lists this entity for `project_id` over `range`.
    /// Placements are not date-bound, so `range` only shapes statistics queries.
    pub fn query(&self, project_id: u64, range: DateRange, per_page: u32) -> ApiQuery {
        match self.source {
            EntitySource::ProjectPlacements => ApiQuery::ProjectPlacements {
                project_id,
                per_page,
            },
            EntitySource::DetailedStatistics { grouping } => {
                ApiQuery::DetailedStatistics(StatisticsQuery::daily(
                    project_id,
                    range,
                    grouping,
                    &self.column_names(),
                    per_page,
                ))
            }
        }
    }

    pub fn transform(&self, record: &RawRecord, ctx: &TransformContext) -> Result<R, CoercionError> {
        (self.transform)(record, ctx)
    }
}

fn field<'a>(record: &'a RawRecord, name: &str) -> Option<&'a JsonValue> {
    record.get(name).filter(|value| !value.is_null())
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Two-decimal fixed point. `null`, missing and blank strings are zero.
pub fn money(record: &RawRecord, name: &'static str) -> Result<Money, CoercionError> {
    match field(record, name) {
        None => Ok(Money::ZERO),
        Some(JsonValue::String(text)) => Money::parse(text).map_err(|reason| CoercionError::new(name, reason)),
        Some(JsonValue::Number(number)) => {
            Money::parse(&number.to_string()).map_err(|reason| CoercionError::new(name, reason))
        }
        Some(other) => Err(CoercionError::new(
            name,
            format!("expected a decimal, got {}", kind_of(other)),
        )),
    }
}

/// Non-negative integer. Absent values follow `policy`.
pub fn count(
    record: &RawRecord,
    name: &'static str,
    policy: CountPolicy,
) -> Result<Option<u64>, CoercionError> {
    let absent = match policy {
        CountPolicy::Nullable => None,
        CountPolicy::ZeroFilled => Some(0),
    };
    match field(record, name) {
        None => Ok(absent),
        Some(JsonValue::String(text)) if text.trim().is_empty() => Ok(absent),
        Some(JsonValue::String(text)) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| CoercionError::new(name, format!("`{text}` is not a non-negative integer"))),
        Some(JsonValue::Number(number)) => {
            if let Some(value) = number.as_u64() {
                return Ok(Some(value));
            }
            match number.as_f64() {
                Some(value) if value >= 0.0 && value.fract() == 0.0 && value < u64::MAX as f64 => {
                    Ok(Some(value as u64))
                }
                _ => Err(CoercionError::new(
                    name,
                    format!("{number} is not a non-negative integer"),
                )),
            }
        }
        Some(other) => Err(CoercionError::new(
            name,
            format!("expected an integer, got {}", kind_of(other)),
        )),
    }
}

fn narrow<T: TryFrom<u64>>(name: &'static str, value: u64) -> Result<T, CoercionError> {
    T::try_from(value).map_err(|_| CoercionError::new(name, format!("{value} is out of range")))
}

/// Identifier that is part of a table key; it must be present.
pub fn required_id<T: TryFrom<u64>>(record: &RawRecord, name: &'static str) -> Result<T, CoercionError> {
    let value = count(record, name, CountPolicy::Nullable)?.ok_or_else(|| CoercionError::missing(name))?;
    narrow(name, value)
}

/// Descriptive identifier outside the key; absent becomes `0`.
pub fn optional_id<T: TryFrom<u64>>(record: &RawRecord, name: &'static str) -> Result<T, CoercionError> {
    let value = count(record, name, CountPolicy::ZeroFilled)?.unwrap_or(0);
    narrow(name, value)
}

/// Free text. Numbers and booleans are stringified, absent is empty.
pub fn text(record: &RawRecord, name: &'static str) -> Result<String, CoercionError> {
    match field(record, name) {
        None => Ok(String::new()),
        Some(JsonValue::String(text)) => Ok(text.clone()),
        Some(value @ (JsonValue::Number(_) | JsonValue::Bool(_))) => Ok(value.to_string()),
        Some(other) => Err(CoercionError::new(
            name,
            format!("expected text, got {}", kind_of(other)),
        )),
    }
}

/// Labels arrive as strings or as objects with a `name`.
pub fn labels(record: &RawRecord, name: &'static str) -> Result<Vec<String>, CoercionError> {
    let items = match field(record, name) {
        None => return Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items,
        Some(other) => {
            return Err(CoercionError::new(
                name,
                format!("expected an array, got {}", kind_of(other)),
            ))
        }
    };

    items
        .iter()
        .map(|item| match item {
            JsonValue::String(label) => Ok(label.clone()),
            JsonValue::Object(object) => object
                .get("name")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| CoercionError::new(name, "label object without a `name`")),
            other => Err(CoercionError::new(
                name,
                format!("expected a label, got {}", kind_of(other)),
            )),
        })
        .collect()
}

/// Required calendar date that the ClickHouse `Date` column can hold.
pub fn date(record: &RawRecord, name: &'static str) -> Result<NaiveDate, CoercionError> {
    match field(record, name) {
        None => Err(CoercionError::missing(name)),
        Some(JsonValue::String(text)) => match parse_date(text) {
            Some(date) if row_serde::date::in_range(&date) => Ok(date),
            Some(_) => Err(CoercionError::new(
                name,
                format!("`{text}` is outside the ClickHouse Date range"),
            )),
            None => Err(CoercionError::new(name, format!("`{text}` is not a recognised date"))),
        },
        Some(other) => Err(CoercionError::new(
            name,
            format!("expected a date string, got {}", kind_of(other)),
        )),
    }
}

/// Optional instant; present but unparseable is still a failure.
pub fn timestamp(record: &RawRecord, name: &'static str) -> Result<Option<DateTime<Utc>>, CoercionError> {
    match field(record, name) {
        None => Ok(None),
        Some(JsonValue::String(text)) if text.trim().is_empty() => Ok(None),
        Some(JsonValue::String(text)) => parse_timestamp(text)
            .map(Some)
            .ok_or_else(|| CoercionError::new(name, format!("`{text}` is not a recognised timestamp"))),
        Some(other) => Err(CoercionError::new(
            name,
            format!("expected a timestamp string, got {}", kind_of(other)),
        )),
    }
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];

const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Dates as the API writes them; a full timestamp yields its calendar date
/// as written, without shifting time zones.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
        .or_else(|| parse_local_datetime(input).map(|dt| dt.date()))
}

/// Instants; naive values are taken as UTC, a bare date as its midnight.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(dt) = OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(input, format).ok())
    {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(input) = input.strip_suffix('Z') {
        return NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
            .map(|naive| naive.and_utc());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

fn parse_local_datetime(input: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.naive_local());
    }
    if let Some(dt) = OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(input, format).ok())
    {
        return Some(dt.naive_local());
    }
    let input = input.strip_suffix('Z').unwrap_or(input);
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
}

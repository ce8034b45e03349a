//! RowBinary layouts for chrono types, used with `#[serde(with = ...)]`.

/// `Date`: days since 1970-01-01 as `u16`.
pub mod date {
    use chrono::NaiveDate;
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};

    fn epoch() -> NaiveDate {
        NaiveDate::default()
    }

    fn days(date: &NaiveDate) -> Option<u16> {
        u16::try_from((*date - epoch()).num_days()).ok()
    }

    /// Whether `date` fits 1970-01-01..=2149-06-06.
    pub fn in_range(date: &NaiveDate) -> bool {
        days(date).is_some()
    }

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        let days = days(date)
            .ok_or_else(|| S::Error::custom(format!("{date} is outside the ClickHouse Date range")))?;
        serializer.serialize_u16(days)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let days = u16::deserialize(deserializer)?;
        epoch()
            .checked_add_days(chrono::Days::new(u64::from(days)))
            .ok_or_else(|| D::Error::custom("date overflow"))
    }
}

/// `DateTime64(3, 'UTC')`: milliseconds since the Unix epoch as `i64`.
pub mod datetime64_millis {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ts.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        DateTime::from_timestamp_millis(millis).ok_or_else(|| D::Error::custom("timestamp overflow"))
    }
}

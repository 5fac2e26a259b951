use std::fmt;

/// Milliseconds since the Unix epoch, the BSON `dateMs` representation.
/// Conversion to/from `chrono::DateTime<Utc>` is provided for the Coder
/// layer's date strategies (`spec.md` §4.1's Date strategy table).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime(i64);

impl DateTime {
    pub fn from_millis(millis: i64) -> Self {
        DateTime(millis)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        DateTime(chrono::Utc::now().timestamp_millis())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DateTime {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        DateTime(dt.timestamp_millis())
    }
}

impl From<DateTime> for chrono::DateTime<chrono::Utc> {
    fn from(dt: DateTime) -> Self {
        chrono::DateTime::from_timestamp_millis(dt.0).unwrap_or_default()
    }
}

impl fmt::Debug for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chrono_dt: chrono::DateTime<chrono::Utc> = (*self).into();
        write!(f, "DateTime({})", chrono_dt.to_rfc3339())
    }
}

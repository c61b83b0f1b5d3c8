//! Decoding of text-format column values.

use crate::error::{Error, Result};

/// Types that can be decoded from a text-format column value.
///
/// `None` is SQL NULL. Only `Option<T>` accepts it; every other type
/// reports a decode error.
pub trait FromText: Sized {
    /// Decode from the raw text.
    fn from_text(text: Option<&str>) -> Result<Self>;
}

fn required<'a>(text: Option<&'a str>, target: &'static str) -> Result<&'a str> {
    text.ok_or(Error::Decode {
        value: "NULL".to_string(),
        target,
    })
}

fn decode_err(text: &str, target: &'static str) -> Error {
    Error::Decode {
        value: text.to_string(),
        target,
    }
}

impl<T: FromText> FromText for Option<T> {
    fn from_text(text: Option<&str>) -> Result<Self> {
        match text {
            Some(_) => T::from_text(text).map(Some),
            None => Ok(None),
        }
    }
}

impl FromText for String {
    fn from_text(text: Option<&str>) -> Result<Self> {
        required(text, "String").map(str::to_string)
    }
}

impl FromText for bool {
    fn from_text(text: Option<&str>) -> Result<Self> {
        match required(text, "bool")? {
            "t" | "true" => Ok(true),
            "f" | "false" => Ok(false),
            other => Err(decode_err(other, "bool")),
        }
    }
}

macro_rules! impl_from_text_parse {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromText for $ty {
                fn from_text(text: Option<&str>) -> Result<Self> {
                    let text = required(text, stringify!($ty))?;
                    text.parse().map_err(|_| decode_err(text, stringify!($ty)))
                }
            }
        )*
    };
}

impl_from_text_parse!(i16, i32, i64, u32, u64, f32, f64);

#[cfg(feature = "uuid")]
impl FromText for uuid::Uuid {
    fn from_text(text: Option<&str>) -> Result<Self> {
        let text = required(text, "Uuid")?;
        uuid::Uuid::parse_str(text).map_err(|_| decode_err(text, "Uuid"))
    }
}

#[cfg(feature = "chrono")]
impl FromText for chrono::NaiveDate {
    fn from_text(text: Option<&str>) -> Result<Self> {
        let text = required(text, "NaiveDate")?;
        chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| decode_err(text, "NaiveDate"))
    }
}

#[cfg(feature = "chrono")]
impl FromText for chrono::NaiveDateTime {
    fn from_text(text: Option<&str>) -> Result<Self> {
        let text = required(text, "NaiveDateTime")?;
        chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|_| decode_err(text, "NaiveDateTime"))
    }
}

/// `timestamptz` text output, e.g. `2024-03-01 12:30:00.123+00`.
#[cfg(feature = "chrono")]
impl FromText for chrono::DateTime<chrono::Utc> {
    fn from_text(text: Option<&str>) -> Result<Self> {
        let text = required(text, "DateTime<Utc>")?;
        // The server prints offsets as `+HH` or `+HH:MM`; normalize to `+HH:MM`.
        let normalized = match text.rfind(['+', '-']) {
            Some(pos) if text.len() - pos == 3 => format!("{text}:00"),
            _ => text.to_string(),
        };
        chrono::DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f%:z")
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|_| decode_err(text, "DateTime<Utc>"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_integers() {
        assert_eq!(i32::from_text(Some("42")).unwrap(), 42);
        assert_eq!(i64::from_text(Some("-7")).unwrap(), -7);
        assert!(i16::from_text(Some("70000")).is_err());
        assert!(i32::from_text(None).is_err());
    }

    #[test]
    fn test_bool() {
        assert!(bool::from_text(Some("t")).unwrap());
        assert!(!bool::from_text(Some("f")).unwrap());
        assert!(bool::from_text(Some("yes")).is_err());
    }

    #[test]
    fn test_option_accepts_null() {
        assert_eq!(Option::<i32>::from_text(None).unwrap(), None);
        assert_eq!(Option::<i32>::from_text(Some("3")).unwrap(), Some(3));
        assert!(Option::<i32>::from_text(Some("x")).is_err());
    }

    #[test]
    fn test_floats() {
        assert!((f64::from_text(Some("1.5")).unwrap() - 1.5).abs() < f64::EPSILON);
        assert!(f64::from_text(Some("NaN")).unwrap().is_nan());
    }

    #[cfg(feature = "uuid")]
    #[test]
    fn test_uuid() {
        let id = uuid::Uuid::from_text(Some("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11")).unwrap();
        assert_eq!(id.to_string(), "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11");
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_timestamps() {
        use chrono::{Datelike, Timelike};

        let ts = chrono::NaiveDateTime::from_text(Some("2024-03-01 12:30:00.25")).unwrap();
        assert_eq!(ts.minute(), 30);

        let tz = chrono::DateTime::<chrono::Utc>::from_text(Some("2024-03-01 12:30:00+02")).unwrap();
        assert_eq!(tz.hour(), 10);

        let tz = chrono::DateTime::<chrono::Utc>::from_text(Some("2024-03-01 12:30:00.5-05:30"))
            .unwrap();
        assert_eq!(tz.hour(), 18);

        let date = chrono::NaiveDate::from_text(Some("2024-03-01")).unwrap();
        assert_eq!(date.month(), 3);
    }
}

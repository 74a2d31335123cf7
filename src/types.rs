//! Wire type codes and temporal values
//!
//! Type codes follow the MySQL binary protocol numbering so that result
//! documents, capture files and audit rows are comparable across client
//! implementations. [`TimeValue`] is the packed time record exchanged with
//! the server for date/time parameters and columns.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Wire type codes
// =============================================================================

/// Column/parameter type codes as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum TypeCode {
    /// 32-bit integer (INT)
    Long = 3,
    /// Double-precision float
    Double = 5,
    /// TIMESTAMP column
    Timestamp = 7,
    /// 64-bit integer (BIGINT, COUNT(*) results)
    LongLong = 8,
    /// DATE column
    Date = 10,
    /// TIME column
    Time = 11,
    /// DATETIME column
    Datetime = 12,
    /// ENUM column
    Enum = 247,
    /// VARCHAR / VARBINARY
    VarString = 253,
    /// CHAR / BINARY
    String = 254,
}

impl TypeCode {
    /// Decode a numeric type code reported by the server
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            3 => Some(TypeCode::Long),
            5 => Some(TypeCode::Double),
            7 => Some(TypeCode::Timestamp),
            8 => Some(TypeCode::LongLong),
            10 => Some(TypeCode::Date),
            11 => Some(TypeCode::Time),
            12 => Some(TypeCode::Datetime),
            247 => Some(TypeCode::Enum),
            253 => Some(TypeCode::VarString),
            254 => Some(TypeCode::String),
            _ => None,
        }
    }

    /// Numeric value as it appears in result documents
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Date, time, datetime or timestamp
    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            TypeCode::Date | TypeCode::Time | TypeCode::Datetime | TypeCode::Timestamp
        )
    }

    /// Variable-length column types fetched through the overflow buffer
    pub fn is_var_length(self) -> bool {
        matches!(self, TypeCode::String | TypeCode::VarString | TypeCode::Enum)
    }
}

// =============================================================================
// Dictionary-level parameter attributes
// =============================================================================

/// How a parameter reaches the SQL text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Bound through the prepared-statement protocol (`?` placeholder)
    Marker,
    /// Textually spliced into the SQL before prepare (`@name`)
    Substitute,
}

/// Datatype a parameter is declared with in the statement dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Integer parameter
    Int,
    /// Double-precision parameter
    Double,
    /// String parameter, bound at its full length
    String,
    /// Date-only parameter (yyyy-mm-dd)
    Date,
    /// Time-only parameter (hh:mm:ss)
    Time,
    /// Date and time
    Datetime,
    /// Server timestamp
    Timestamp,
}

impl DataType {
    /// Parse the dictionary spelling of a datatype
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int" => Some(DataType::Int),
            "double" => Some(DataType::Double),
            "string" => Some(DataType::String),
            "date" => Some(DataType::Date),
            "time" => Some(DataType::Time),
            "datetime" => Some(DataType::Datetime),
            "timestamp" => Some(DataType::Timestamp),
            _ => None,
        }
    }

    /// The wire type code a parameter of this datatype binds as
    pub fn type_code(self) -> TypeCode {
        match self {
            DataType::Int => TypeCode::Long,
            DataType::Double => TypeCode::Double,
            DataType::String => TypeCode::String,
            DataType::Date => TypeCode::Date,
            DataType::Time => TypeCode::Time,
            DataType::Datetime => TypeCode::Datetime,
            DataType::Timestamp => TypeCode::Timestamp,
        }
    }

    /// Date, time, datetime or timestamp
    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            DataType::Date | DataType::Time | DataType::Datetime | DataType::Timestamp
        )
    }
}

// =============================================================================
// Time record
// =============================================================================

/// The literal that validates as "no time supplied"
pub const NOT_A_DATE_TIME: &str = "not-a-date-time";

static DATE_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)[-_/](\d+)[-_/](\d+)").expect("date regex"));
static TIME_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+):(\d+):(\d+)\.(\d+)?").expect("time regex"));

/// The server's packed time record.
///
/// Date parameters leave the time fields zero; time parameters leave the date
/// fields zero. The packed layout is fixed-size so the binding pass can size
/// parameter and row buffers without looking at values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeValue {
    /// Four-digit year
    pub year: u16,
    /// Month 1-12
    pub month: u8,
    /// Day 1-31
    pub day: u8,
    /// Hour 0-23
    pub hour: u8,
    /// Minute 0-59
    pub minute: u8,
    /// Second 0-59
    pub second: u8,
    /// Fractional seconds, microseconds
    pub second_part: u32,
}

impl TimeValue {
    /// Packed size in the parameter and row buffers
    pub const PACKED_LEN: usize = 11;

    /// Parse the ISO-like string representation of a date, time or datetime.
    ///
    /// Returns `Ok(None)` for the literal [`NOT_A_DATE_TIME`], which callers
    /// treat as "no time supplied" rather than an error. The time part is
    /// consulted only when `data_type` is not pure date; the date part is
    /// skipped for pure time. Time values are `hh:mm:ss.ffffff` — the
    /// fractional separator is required, the digits after it may be omitted.
    /// Years below 100 are treated as 2000-based; years must be in
    /// `[1970, 3000]` or exactly 9999 (the far-future sentinel used for
    /// open-ended ranges).
    pub fn parse(text: &str, data_type: DataType) -> Result<Option<TimeValue>> {
        if text == NOT_A_DATE_TIME {
            return Ok(None);
        }

        let mut value = TimeValue::default();

        if data_type != DataType::Time {
            let caps = DATE_PART.captures(text).ok_or_else(|| Error::DateParseFailed {
                value: text.to_string(),
                expected: "yyyy-mm-dd",
            })?;
            let mut year: u32 = caps[1].parse().unwrap_or(0);
            let month: u32 = caps[2].parse().unwrap_or(0);
            let day: u32 = caps[3].parse().unwrap_or(0);
            if year < 100 {
                year += 2000;
            }
            if (year < 1970 || year > 3000) && year != 9999 {
                return Err(Error::DateFieldOutOfRange {
                    field: "year",
                    actual: year,
                    value: text.to_string(),
                });
            }
            if !(1..=12).contains(&month) {
                return Err(Error::DateFieldOutOfRange {
                    field: "month",
                    actual: month,
                    value: text.to_string(),
                });
            }
            if !(1..=31).contains(&day) {
                return Err(Error::DateFieldOutOfRange {
                    field: "day",
                    actual: day,
                    value: text.to_string(),
                });
            }
            value.year = year as u16;
            value.month = month as u8;
            value.day = day as u8;
        }

        if data_type != DataType::Date {
            let caps = TIME_PART.captures(text).ok_or_else(|| Error::DateParseFailed {
                value: text.to_string(),
                expected: "hh:mm:ss.ffffff",
            })?;
            value.hour = caps[1].parse().unwrap_or(0);
            value.minute = caps[2].parse().unwrap_or(0);
            value.second = caps[3].parse().unwrap_or(0);
            if let Some(frac) = caps.get(4) {
                value.second_part = frac.as_str().parse().unwrap_or(0);
            }
        }

        Ok(Some(value))
    }

    /// Write the packed representation into a buffer slot
    pub fn write_to(&self, slot: &mut [u8]) {
        slot[0..2].copy_from_slice(&self.year.to_le_bytes());
        slot[2] = self.month;
        slot[3] = self.day;
        slot[4] = self.hour;
        slot[5] = self.minute;
        slot[6] = self.second;
        slot[7..11].copy_from_slice(&self.second_part.to_le_bytes());
    }

    /// Read the packed representation from a buffer slot
    pub fn read_from(slot: &[u8]) -> TimeValue {
        TimeValue {
            year: u16::from_le_bytes([slot[0], slot[1]]),
            month: slot[2],
            day: slot[3],
            hour: slot[4],
            minute: slot[5],
            second: slot[6],
            second_part: u32::from_le_bytes([slot[7], slot[8], slot[9], slot[10]]),
        }
    }

    /// Render as a result-document member: date columns carry only the date
    /// fields, time columns only the time fields, and the fractional part is
    /// omitted when zero.
    pub fn to_document(&self, type_code: TypeCode) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        if type_code != TypeCode::Time {
            doc.insert("year".to_string(), self.year.into());
            doc.insert("month".to_string(), self.month.into());
            doc.insert("day".to_string(), self.day.into());
        }
        if type_code != TypeCode::Date {
            doc.insert("hour".to_string(), self.hour.into());
            doc.insert("minute".to_string(), self.minute.into());
            doc.insert("second".to_string(), self.second.into());
            if self.second_part != 0 {
                doc.insert("second_part".to_string(), self.second_part.into());
            }
        }
        serde_json::Value::Object(doc)
    }
}

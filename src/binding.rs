//! Parameter and column binding
//!
//! Buffers for the server are packed byte regions sized in a first pass and
//! filled in a second. Parameters get fixed slots by declared datatype
//! (strings are bound out of the settings document and contribute nothing to
//! the packed buffer). Result columns get fixed slots by reported type;
//! variable-length columns get only an 8-byte length slot, with values
//! fetched on demand into an overflow buffer sized to the longest value the
//! server reports. Every column slot is followed by a 1-byte null flag.
//!
//! All reads and writes go through the typed helpers here, keeping the rest
//! of the crate free of byte-offset arithmetic.

use bytes::BytesMut;
use indexmap::IndexMap;

use crate::client::{BindSource, ColumnBind, FieldMeta, ParamBind};
use crate::error::Result;
use crate::execution::ParamSetting;
use crate::types::{DataType, ParamKind, TimeValue, TypeCode};

/// Slot width for scalar (integer and double) columns and parameters
const SCALAR_LEN: usize = 8;
/// Slot width for the length-of-value slot of a variable-length column
const LENGTH_SLOT_LEN: usize = 8;
/// Null-flag width appended to every column slot
const NULL_FLAG_LEN: usize = 1;

/// The built parameter bind array plus its packed value buffer
#[derive(Debug, Default)]
pub(crate) struct ParamBinding {
    /// One record per MARKER parameter, in declaration order
    pub binds: Vec<ParamBind>,
    /// Packed scalar/temporal values the records point into
    pub buffer: BytesMut,
}

fn param_slot_len(data_type: DataType) -> usize {
    match data_type {
        DataType::Int | DataType::Double => SCALAR_LEN,
        DataType::String => 0,
        DataType::Date | DataType::Time | DataType::Datetime | DataType::Timestamp => {
            TimeValue::PACKED_LEN
        }
    }
}

/// Build the parameter bind array for the MARKER settings, two-pass.
pub(crate) fn build_param_binds(
    settings: &IndexMap<String, ParamSetting>,
) -> Result<ParamBinding> {
    let markers = || settings.values().filter(|s| s.kind == ParamKind::Marker);

    // first pass: size the packed buffer
    let buffer_len: usize = markers().map(|s| param_slot_len(s.data_type)).sum();

    // second pass: fill slots and bind records
    let mut buffer = BytesMut::zeroed(buffer_len);
    let mut binds = Vec::with_capacity(markers().count());
    let mut offset = 0;
    for setting in markers() {
        let type_code = setting.data_type.type_code();
        let bind = match setting.data_type {
            DataType::Int => {
                let value = setting.value.as_ref().and_then(|v| v.as_i64());
                if let Some(v) = value {
                    buffer[offset..offset + SCALAR_LEN].copy_from_slice(&v.to_le_bytes());
                }
                let bind = ParamBind {
                    type_code,
                    source: BindSource::Packed {
                        offset,
                        len: SCALAR_LEN,
                    },
                    is_null: value.is_none(),
                };
                offset += SCALAR_LEN;
                bind
            }
            DataType::Double => {
                let value = setting.value.as_ref().and_then(|v| v.as_f64());
                if let Some(v) = value {
                    buffer[offset..offset + SCALAR_LEN].copy_from_slice(&v.to_le_bytes());
                }
                let bind = ParamBind {
                    type_code,
                    source: BindSource::Packed {
                        offset,
                        len: SCALAR_LEN,
                    },
                    is_null: value.is_none(),
                };
                offset += SCALAR_LEN;
                bind
            }
            DataType::String => match setting.value.as_ref().and_then(|v| v.as_str()) {
                Some(text) => ParamBind {
                    type_code,
                    source: BindSource::Text(text.to_string()),
                    is_null: false,
                },
                None => ParamBind {
                    type_code,
                    source: BindSource::Empty,
                    is_null: true,
                },
            },
            DataType::Date | DataType::Time | DataType::Datetime | DataType::Timestamp => {
                // The value was validated when the settings were created; an
                // absent value or the no-time literal binds as NULL.
                let time = match setting.value.as_ref().and_then(|v| v.as_str()) {
                    Some(text) => TimeValue::parse(text, setting.data_type)?,
                    None => None,
                };
                if let Some(t) = time {
                    t.write_to(&mut buffer[offset..offset + TimeValue::PACKED_LEN]);
                }
                let bind = ParamBind {
                    type_code,
                    source: BindSource::Packed {
                        offset,
                        len: TimeValue::PACKED_LEN,
                    },
                    is_null: time.is_none(),
                };
                offset += TimeValue::PACKED_LEN;
                bind
            }
        };
        binds.push(bind);
    }

    Ok(ParamBinding { binds, buffer })
}

/// The built column bind layout for one result set
#[derive(Debug, Default)]
pub(crate) struct RowLayout {
    /// One record per result column, in result order
    pub binds: Vec<ColumnBind>,
    /// Packed row buffer length
    pub row_len: usize,
    /// Overflow buffer length needed for the longest variable-length value
    pub overflow_len: usize,
}

fn column_slot_len(type_code: i64) -> usize {
    match TypeCode::from_code(type_code) {
        Some(tc) if tc.is_var_length() => LENGTH_SLOT_LEN,
        Some(tc) if tc.is_temporal() => TimeValue::PACKED_LEN,
        _ => SCALAR_LEN,
    }
}

/// Build the column bind layout from the field metadata, two-pass.
pub(crate) fn build_column_binds(fields: &[FieldMeta]) -> RowLayout {
    // first pass: row buffer length and overflow requirement
    let mut row_len = 0;
    let mut overflow_len = 0;
    for field in fields {
        row_len += column_slot_len(field.type_code) + NULL_FLAG_LEN;
        if matches!(TypeCode::from_code(field.type_code), Some(tc) if tc.is_var_length()) {
            overflow_len = overflow_len.max(field.length.max(field.max_length));
        }
    }

    // second pass: assign slot offsets
    let mut binds = Vec::with_capacity(fields.len());
    let mut offset = 0;
    for field in fields {
        let length = column_slot_len(field.type_code);
        let var_length =
            matches!(TypeCode::from_code(field.type_code), Some(tc) if tc.is_var_length());
        binds.push(ColumnBind {
            type_code: field.type_code,
            offset,
            length,
            null_offset: offset + length,
            var_length,
        });
        offset += length + NULL_FLAG_LEN;
    }

    RowLayout {
        binds,
        row_len: offset,
        overflow_len,
    }
}

/// Typed reads over one fetched row
pub(crate) struct RowReader<'a> {
    row: &'a [u8],
}

impl<'a> RowReader<'a> {
    pub fn new(row: &'a [u8]) -> Self {
        Self { row }
    }

    pub fn is_null(&self, bind: &ColumnBind) -> bool {
        self.row[bind.null_offset] != 0
    }

    pub fn i64_at(&self, bind: &ColumnBind) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.row[bind.offset..bind.offset + 8]);
        i64::from_le_bytes(raw)
    }

    pub fn f64_at(&self, bind: &ColumnBind) -> f64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.row[bind.offset..bind.offset + 8]);
        f64::from_le_bytes(raw)
    }

    /// True value length of a variable-length column (from its length slot)
    pub fn var_len_at(&self, bind: &ColumnBind) -> usize {
        self.i64_at(bind) as usize
    }

    pub fn time_at(&self, bind: &ColumnBind) -> TimeValue {
        TimeValue::read_from(&self.row[bind.offset..bind.offset + TimeValue::PACKED_LEN])
    }
}

/// Typed writes over one row being produced (used by scripted sessions in
/// tests; a native client writes through its own machinery).
pub struct RowWriter<'a> {
    row: &'a mut [u8],
}

impl<'a> RowWriter<'a> {
    /// Wrap a packed row buffer
    pub fn new(row: &'a mut [u8]) -> Self {
        Self { row }
    }

    /// Set or clear a column's null flag
    pub fn set_null(&mut self, bind: &ColumnBind, is_null: bool) {
        self.row[bind.null_offset] = is_null as u8;
    }

    /// Write a scalar integer slot
    pub fn put_i64(&mut self, bind: &ColumnBind, value: i64) {
        self.row[bind.offset..bind.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.set_null(bind, false);
    }

    /// Write a scalar double slot
    pub fn put_f64(&mut self, bind: &ColumnBind, value: f64) {
        self.row[bind.offset..bind.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.set_null(bind, false);
    }

    /// Write a variable-length column's length slot
    pub fn put_var_len(&mut self, bind: &ColumnBind, len: usize) {
        self.row[bind.offset..bind.offset + 8].copy_from_slice(&(len as i64).to_le_bytes());
        self.set_null(bind, false);
    }

    /// Write a temporal slot
    pub fn put_time(&mut self, bind: &ColumnBind, value: TimeValue) {
        value.write_to(&mut self.row[bind.offset..bind.offset + TimeValue::PACKED_LEN]);
        self.set_null(bind, false);
    }
}

//! Statement dictionary
//!
//! The dictionary is a JSON file mapping statement names to their text and
//! parameter declarations:
//!
//! ```json
//! { "statements": {
//!     "get_employee_by_emp_no": {
//!         "statement_text": ["SELECT * FROM employees ", "WHERE emp_no = ?"],
//!         "parameters": [
//!             { "name": "emp_no", "param_type": "marker", "data_type": "int" }
//!         ]
//!     }
//! } }
//! ```
//!
//! Unknown fields are ignored. The file is read once per connection and
//! cached; parameter attributes are validated per statement at execution
//! time so one malformed entry does not poison the rest of the dictionary.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{DataType, ParamKind};

/// One parameter declaration. `param_type` and `data_type` stay unparsed
/// here so a bad attribute is reported against the statement that uses it.
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterDef {
    /// Parameter name, used as the argument tag and substitution token
    pub name: String,
    /// "marker" or "substitute"
    #[serde(default)]
    pub param_type: Option<String>,
    /// Declared datatype
    #[serde(default)]
    pub data_type: Option<String>,
}

impl ParameterDef {
    /// Resolve `param_type`, reporting against the owning statement
    pub fn kind(&self, statement: &str) -> Result<ParamKind> {
        let raw = self
            .param_type
            .as_deref()
            .ok_or_else(|| Error::MissingParameterField {
                statement: statement.to_string(),
                parameter: self.name.clone(),
                field: "param_type",
            })?;
        match raw {
            "marker" => Ok(ParamKind::Marker),
            "substitute" => Ok(ParamKind::Substitute),
            other => Err(Error::InvalidParamType {
                statement: statement.to_string(),
                parameter: self.name.clone(),
                value: other.to_string(),
            }),
        }
    }

    /// Resolve `data_type`, reporting against the owning statement
    pub fn datatype(&self, statement: &str) -> Result<DataType> {
        let raw = self
            .data_type
            .as_deref()
            .ok_or_else(|| Error::MissingParameterField {
                statement: statement.to_string(),
                parameter: self.name.clone(),
                field: "data_type",
            })?;
        DataType::from_name(raw).ok_or_else(|| Error::UnsupportedDataType {
            statement: statement.to_string(),
            parameter: self.name.clone(),
            value: raw.to_string(),
        })
    }
}

/// One named statement: text lines concatenated to form the SQL, plus the
/// ordered parameter declarations.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementDef {
    /// SQL text lines, concatenated without separators
    #[serde(default)]
    pub statement_text: Option<Vec<String>>,
    /// Ordered parameter declarations
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
}

impl StatementDef {
    /// Concatenated statement text, before substitution
    pub fn text(&self, statement: &str) -> Result<String> {
        let lines = self
            .statement_text
            .as_ref()
            .ok_or_else(|| Error::MissingStatementText(statement.to_string()))?;
        Ok(lines.concat())
    }
}

/// The loaded statement dictionary
#[derive(Debug, Clone, Deserialize)]
pub struct StatementDict {
    /// Statement name to definition, in file order
    #[serde(default)]
    pub statements: IndexMap<String, StatementDef>,
}

impl StatementDict {
    /// Load and parse a dictionary file. Parse and I/O failures are reported
    /// as [`Error::CorruptDictionary`] with the offending path and cause.
    pub fn load(path: &Path) -> Result<StatementDict> {
        let file = File::open(path).map_err(|e| {
            Error::CorruptDictionary(format!("unable to open {}: {}", path.display(), e))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::CorruptDictionary(format!("error parsing {}: {}", path.display(), e))
        })
    }

    /// Look up a statement definition
    pub fn statement(&self, name: &str) -> Option<&StatementDef> {
        self.statements.get(name)
    }

    /// Whether the dictionary defines the named statement
    pub fn contains(&self, name: &str) -> bool {
        self.statements.contains_key(name)
    }
}

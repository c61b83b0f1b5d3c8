//! Structured query results.
//!
//! Every column arrives in the text format and stays text; the driver only
//! distinguishes NULL from non-NULL. Typed access goes through
//! [`FromText`](crate::from_text::FromText).

use std::ops::Index;

use pgwire_protocol::{DataRow, ProtocolError};

use crate::error::{Error, Result};
use crate::from_text::FromText;

/// One column value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Value {
    /// Text representation; empty when NULL.
    pub data: String,
    /// Whether the value is SQL NULL.
    pub is_null: bool,
}

impl Value {
    /// A non-NULL value.
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            is_null: false,
        }
    }

    /// SQL NULL.
    #[must_use]
    pub fn null() -> Self {
        Self {
            data: String::new(),
            is_null: true,
        }
    }

    /// The text, or `None` for NULL.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        (!self.is_null).then_some(self.data.as_str())
    }

    /// Decode the value. NULL decodes only into `Option<T>`.
    pub fn parse<T: FromText>(&self) -> Result<T> {
        T::from_text(self.as_str())
    }
}

/// One result row; its length equals the number of result columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Build a row from values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Value at `index`, if in range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Decode the value at `index`.
    pub fn try_get<T: FromText>(&self, index: usize) -> Result<T> {
        match self.values.get(index) {
            Some(value) => value.parse(),
            None => Err(Error::Decode {
                value: format!("column {index}"),
                target: "an existing column",
            }),
        }
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the values.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// Take ownership of the values.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl TryFrom<DataRow> for Row {
    type Error = Error;

    fn try_from(row: DataRow) -> Result<Self> {
        let values = row
            .columns
            .into_iter()
            .map(|col| match col {
                Some(bytes) => String::from_utf8(bytes.to_vec())
                    .map(Value::text)
                    .map_err(|_| Error::from(ProtocolError::InvalidUtf8("column value"))),
                None => Ok(Value::null()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { values })
    }
}

/// The outcome of one statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    /// Result column names, in order.
    pub column_names: Vec<String>,
    /// Result rows.
    pub rows: Vec<Row>,
    /// Command tag, e.g. `INSERT 0 1` or `SELECT 3`.
    pub command_tag: String,
}

impl QueryResult {
    /// Position of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    /// Rows affected, parsed from the trailing number of the command tag.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }

    /// Whether no rows were returned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Decode a named column of a row.
    pub fn get<T: FromText>(&self, row: usize, column: &str) -> Result<T> {
        let index = self.column_index(column).ok_or_else(|| Error::Decode {
            value: column.to_string(),
            target: "an existing column",
        })?;
        let row = self.rows.get(row).ok_or_else(|| Error::Decode {
            value: format!("row {row}"),
            target: "an existing row",
        })?;
        row.try_get(index)
    }
}

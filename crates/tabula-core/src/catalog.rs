//! Table discovery model: which tables exist and what columns they carry.

use crate::query::FieldName;
use serde::{Deserialize, Serialize};

/// Field types the backend reports for numeric columns.
const NUMERIC_TYPES: &[&str] = &["number", "integer", "float", "decimal", "currency"];

/// One entry of the table listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: FieldName,
    #[serde(default, rename = "type")]
    pub field_type: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl FieldInfo {
    pub fn is_numeric(&self) -> bool {
        self.field_type
            .as_deref()
            .is_some_and(|t| NUMERIC_TYPES.contains(&t.to_ascii_lowercase().as_str()))
    }
}

/// Columns of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Columns usable as grouping dimensions.
    pub fn dimension_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| !f.is_numeric())
    }

    /// Columns usable as metrics.
    pub fn numeric_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.is_numeric())
    }
}

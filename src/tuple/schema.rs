use std::fmt::Display;

use anyhow::Result;

use super::Tuple;
use crate::error::DbError;

/// Maximum number of bytes a text value may hold.
pub const STRING_LEN: usize = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeId {
    Integer,
    Text,
}

impl TypeId {
    /// The number of bytes every value of this type occupies on a page.
    pub const fn size(&self) -> usize {
        match self {
            TypeId::Integer => std::mem::size_of::<i32>(),
            TypeId::Text => std::mem::size_of::<u32>() + STRING_LEN,
        }
    }
}

impl Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDefinition {
    type_id: TypeId,
    column_name: String,
}

impl ColumnDefinition {
    pub fn new(type_id: TypeId, column_name: impl Into<String>) -> Self {
        Self {
            type_id,
            column_name: column_name.into(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn column_name(&self) -> &str {
        &self.column_name
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    columns: Vec<ColumnDefinition>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDefinition>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Number of bytes a tuple of this schema occupies on a page
    pub fn tuple_width(&self) -> usize {
        self.columns.iter().map(|column| column.type_id().size()).sum()
    }

    pub fn column_index(&self, column_name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.column_name() == column_name)
    }

    /// Checks that a tuple can be stored under this schema.
    pub fn check(&self, tuple: &Tuple) -> Result<()> {
        if tuple.values().len() != self.columns.len() {
            return Err(DbError::SchemaMismatch(format!(
                "expected {} values, got {}",
                self.columns.len(),
                tuple.values().len()
            ))
            .into());
        }
        for (column, value) in self.columns.iter().zip(tuple.values()) {
            if column.type_id() != value.type_id() {
                return Err(DbError::SchemaMismatch(format!(
                    "column {} is of type {}, got {}",
                    column.column_name(),
                    column.type_id(),
                    value.type_id()
                ))
                .into());
            }
            if let Some(text) = value.as_str() {
                if text.len() > STRING_LEN {
                    return Err(DbError::SchemaMismatch(format!(
                        "text of column {} is longer than {} bytes",
                        column.column_name(),
                        STRING_LEN
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

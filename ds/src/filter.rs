//! Index values and list filters

use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;

/// Value of an indexed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl ToSql for IndexValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            IndexValue::String(s) => ToSqlOutput::from(s.as_str()),
            IndexValue::Int(i) => ToSqlOutput::from(*i),
            IndexValue::Bool(b) => ToSqlOutput::from(*b),
        })
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        IndexValue::String(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        IndexValue::String(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        IndexValue::Int(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        IndexValue::Bool(value)
    }
}

/// Comparison applied by a [`Filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    /// Substring match on string values
    Contains,
}

impl FilterOp {
    /// SQL predicate on the index value column, with one placeholder
    pub(crate) fn predicate(&self) -> &'static str {
        match self {
            FilterOp::Eq => "i.value = ?",
            FilterOp::Ne => "i.value != ?",
            FilterOp::Gt => "i.value > ?",
            FilterOp::Lt => "i.value < ?",
            FilterOp::Gte => "i.value >= ?",
            FilterOp::Lte => "i.value <= ?",
            FilterOp::Contains => "i.value LIKE '%' || ? || '%'",
        }
    }
}

/// Filter on an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Equality filter, the common case
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_eq_builder() {
        let filter = Filter::eq("status", "active");
        assert_eq!(filter.field, "status");
        assert_eq!(filter.op, FilterOp::Eq);
        assert_eq!(filter.value, IndexValue::String("active".to_string()));
    }

    #[test]
    fn test_contains_predicate_uses_like() {
        assert!(FilterOp::Contains.predicate().contains("LIKE"));
        assert_eq!(FilterOp::Gte.predicate(), "i.value >= ?");
    }
}

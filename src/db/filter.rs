//! Bound values and row predicates for store queries.
//!
//! Predicates only ever reference columns by their static names and pass
//! every value as a bound parameter.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// Serialized JSON document, stored as text.
    Json(String),
}

impl SqlValue {
    pub fn json<T: Serialize>(value: &T) -> StoreResult<Self> {
        Ok(SqlValue::Json(serde_json::to_string(value)?))
    }

    pub(crate) fn push_to(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            SqlValue::Null => qb.push_bind(None::<String>),
            SqlValue::Integer(v) => qb.push_bind(*v),
            SqlValue::Real(v) => qb.push_bind(*v),
            SqlValue::Text(v) => qb.push_bind(v.clone()),
            SqlValue::Bool(v) => qb.push_bind(*v),
            SqlValue::Timestamp(v) => qb.push_bind(*v),
            SqlValue::Json(v) => qb.push_bind(v.clone()),
        };
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v.into())
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Filter over the columns of one entry type.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq {
        column: &'static str,
        value: SqlValue,
    },
    In {
        column: &'static str,
        values: Vec<SqlValue>,
    },
    /// Compare a value inside a JSON column; rows whose column is not valid
    /// JSON never match.
    JsonPathEq {
        column: &'static str,
        path: String,
        value: SqlValue,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: &'static str, value: impl Into<SqlValue>) -> Self {
        Predicate::Eq {
            column,
            value: value.into(),
        }
    }

    pub fn is_in<I, V>(column: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Predicate::In {
            column,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn json_path_eq(
        column: &'static str,
        path: impl Into<String>,
        value: impl Into<SqlValue>,
    ) -> Self {
        Predicate::JsonPathEq {
            column,
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut any) => {
                any.push(other);
                Predicate::Or(any)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Check that every referenced column belongs to `columns`.
    pub fn validate(&self, columns: &[&str]) -> StoreResult<()> {
        match self {
            Predicate::Eq { column, .. } | Predicate::In { column, .. } => {
                known_column(column, columns)
            }
            Predicate::JsonPathEq { column, path, .. } => {
                known_column(column, columns)?;
                if !path.starts_with('$') {
                    return Err(StoreError::InvalidPredicate(format!(
                        "JSON path `{path}` must start with `$`"
                    )));
                }
                Ok(())
            }
            Predicate::And(items) | Predicate::Or(items) => {
                items.iter().try_for_each(|p| p.validate(columns))
            }
            Predicate::Not(inner) => inner.validate(columns),
        }
    }

    pub(crate) fn render(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            Predicate::Eq {
                column,
                value: SqlValue::Null,
            } => {
                qb.push(*column).push(" IS NULL");
            }
            Predicate::Eq { column, value } => {
                qb.push(*column).push(" = ");
                value.push_to(qb);
            }
            Predicate::In { values, .. } if values.is_empty() => {
                qb.push("1 = 0");
            }
            Predicate::In { column, values } => {
                qb.push(*column).push(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    v.push_to(qb);
                }
                qb.push(")");
            }
            Predicate::JsonPathEq {
                column,
                path,
                value,
            } => {
                // CASE keeps json_extract away from rows that are not JSON.
                qb.push("CASE WHEN json_valid(")
                    .push(*column)
                    .push(") THEN json_extract(")
                    .push(*column)
                    .push(", ")
                    .push_bind(path.clone())
                    .push(") END = ");
                value.push_to(qb);
            }
            Predicate::And(items) => render_joined(qb, items, " AND ", "1 = 1"),
            Predicate::Or(items) => render_joined(qb, items, " OR ", "1 = 0"),
            Predicate::Not(inner) => {
                qb.push("NOT (");
                inner.render(qb);
                qb.push(")");
            }
        }
    }
}

fn render_joined(
    qb: &mut QueryBuilder<'_, Sqlite>,
    items: &[Predicate],
    joiner: &str,
    empty: &str,
) {
    if items.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, p) in items.iter().enumerate() {
        if i > 0 {
            qb.push(joiner);
        }
        p.render(qb);
    }
    qb.push(")");
}

fn known_column(column: &str, columns: &[&str]) -> StoreResult<()> {
    if columns.contains(&column) {
        Ok(())
    } else {
        Err(StoreError::InvalidPredicate(format!(
            "unknown column `{column}`"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(p: &Predicate) -> String {
        let mut qb = QueryBuilder::<Sqlite>::new("");
        p.render(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn renders_with_placeholders_only() {
        let p = Predicate::eq("conversation_id", "c'1; DROP TABLE x")
            .and(Predicate::is_in("id", ["a", "b"]));
        assert_eq!(sql(&p), "(conversation_id = ? AND id IN (?, ?))");
    }

    #[test]
    fn empty_in_matches_nothing() {
        let p = Predicate::is_in("id", Vec::<String>::new());
        assert_eq!(sql(&p), "1 = 0");
    }

    #[test]
    fn null_equality_uses_is_null() {
        assert_eq!(
            sql(&Predicate::eq("prompt_metadata", None::<String>)),
            "prompt_metadata IS NULL"
        );
    }

    #[test]
    fn json_path_guards_invalid_documents() {
        let p = Predicate::json_path_eq("orchestrator_identifier", "$.id", "orc-1");
        assert_eq!(
            sql(&p),
            "CASE WHEN json_valid(orchestrator_identifier) THEN \
             json_extract(orchestrator_identifier, ?) END = ?"
        );
    }

    #[test]
    fn negation_and_disjunction() {
        let p = Predicate::eq("role", "user")
            .or(Predicate::eq("role", "assistant"))
            .negate();
        assert_eq!(sql(&p), "NOT ((role = ? OR role = ?))");
    }

    #[test]
    fn validation_rejects_unknown_columns_and_bad_paths() {
        let cols = ["id", "labels"];
        assert!(Predicate::eq("id", 1).validate(&cols).is_ok());
        assert!(matches!(
            Predicate::eq("id", 1)
                .and(Predicate::eq("nope", 2))
                .validate(&cols),
            Err(StoreError::InvalidPredicate(_))
        ));
        assert!(matches!(
            Predicate::json_path_eq("labels", "id", "x").validate(&cols),
            Err(StoreError::InvalidPredicate(_))
        ));
    }
}

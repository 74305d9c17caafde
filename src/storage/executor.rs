use crate::error::{FunnelError, Result};
use crate::query::result::{TabularResult, Value};
use duckdb::types::{ToSqlOutput, Value as DbValue};
use duckdb::{Connection, ToSql};
use parking_lot::Mutex;
use std::sync::Arc;

/// Runs compiled SQL and returns headers plus rows.
pub trait QueryExecutor {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<TabularResult>;
}

impl ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let value = match self {
            Self::Null => DbValue::Null,
            Self::Int(i) => DbValue::BigInt(*i),
            Self::Float(f) => DbValue::Double(*f),
            Self::Text(s) => DbValue::Text(s.clone()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// Executes queries on a shared DuckDB connection.
#[derive(Clone)]
pub struct DuckDbExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbExecutor {
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl QueryExecutor for DuckDbExecutor {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<TabularResult> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(duckdb::params_from_iter(params.iter()))?;
        let headers = rows
            .as_ref()
            .map(duckdb::Statement::column_names)
            .unwrap_or_default();

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(headers.len());
            for i in 0..headers.len() {
                let value: DbValue = row.get(i)?;
                values.push(from_duckdb(value));
            }
            out.push(values);
        }

        tracing::debug!(rows = out.len(), columns = headers.len(), "Query executed");
        TabularResult::new(headers, out).ok_or_else(|| {
            FunnelError::ExecutionFailure("row width does not match the header width".to_string())
        })
    }
}

fn from_duckdb(value: DbValue) -> Value {
    match value {
        DbValue::Null => Value::Null,
        DbValue::Boolean(b) => Value::Int(i64::from(b)),
        DbValue::TinyInt(i) => Value::Int(i64::from(i)),
        DbValue::SmallInt(i) => Value::Int(i64::from(i)),
        DbValue::Int(i) => Value::Int(i64::from(i)),
        DbValue::BigInt(i) => Value::Int(i),
        DbValue::HugeInt(i) => i64::try_from(i).map_or_else(|_| Value::Text(i.to_string()), Value::Int),
        DbValue::UTinyInt(u) => Value::Int(i64::from(u)),
        DbValue::USmallInt(u) => Value::Int(i64::from(u)),
        DbValue::UInt(u) => Value::Int(i64::from(u)),
        DbValue::UBigInt(u) => i64::try_from(u).map_or_else(|_| Value::Text(u.to_string()), Value::Int),
        DbValue::Float(f) => Value::Float(f64::from(f)),
        DbValue::Double(f) => Value::Float(f),
        DbValue::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>().map_or(Value::Text(text), Value::Float)
        }
        DbValue::Text(s) => Value::Text(s),
        other => Value::Text(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> DuckDbExecutor {
        let conn = Connection::open_in_memory().unwrap();
        DuckDbExecutor::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_execute_headers_and_types() {
        let result = executor()
            .execute(
                "SELECT CAST(? AS BIGINT) AS a, CAST(? AS VARCHAR) AS b, CAST(NULL AS VARCHAR) AS c, CAST(1.5 AS DOUBLE) AS d",
                &[Value::Int(7), Value::from("x")],
            )
            .unwrap();
        assert_eq!(result.headers, vec!["a", "b", "c", "d"]);
        assert_eq!(
            result.rows,
            vec![vec![
                Value::Int(7),
                Value::from("x"),
                Value::Null,
                Value::Float(1.5)
            ]]
        );
    }

    #[test]
    fn test_sum_is_narrowed() {
        let result = executor()
            .execute(
                "SELECT SUM(x) AS s, CAST(SUM(x) AS BIGINT) AS n FROM (VALUES (1), (2)) t(x)",
                &[],
            )
            .unwrap();
        assert_eq!(result.rows[0][0], Value::Int(3));
        assert_eq!(result.rows[0][1], Value::Int(3));
    }

    #[test]
    fn test_empty_result_keeps_headers() {
        let result = executor()
            .execute("SELECT 1 AS one WHERE 1 = 0", &[])
            .unwrap();
        assert_eq!(result.headers, vec!["one"]);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn test_invalid_sql_is_a_database_error() {
        let err = executor().execute("SELEC nonsense", &[]).unwrap_err();
        assert!(matches!(err, FunnelError::Database(_)));
    }
}

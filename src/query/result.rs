use serde::{Deserialize, Serialize};

/// A single cell of a tabular result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value. `None` when it is null or does not parse.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) if f.is_finite() => Some(*f),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Auxiliary table carried next to the main result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaTable {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Headers plus rows, as returned by the query executor.
///
/// Every row holds exactly `headers.len()` values. The mutating methods below
/// are the only way the post-processor reshapes a result, and each of them
/// keeps that invariant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub meta: Vec<MetaTable>,
}

/// A post-processed funnel result.
pub type FunnelReport = TabularResult;

impl TabularResult {
    /// Build a result, rejecting rows whose width differs from the headers.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Value>>) -> Option<Self> {
        let result = Self {
            headers,
            rows,
            meta: Vec::new(),
        };
        result.is_well_formed().then_some(result)
    }

    pub fn is_well_formed(&self) -> bool {
        self.rows.iter().all(|r| r.len() == self.headers.len())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Insert a column at `at`, computing its value from each existing row.
    pub fn insert_column_with<F>(&mut self, at: usize, name: &str, mut value: F)
    where
        F: FnMut(&[Value]) -> Value,
    {
        let at = at.min(self.headers.len());
        for row in &mut self.rows {
            let v = value(row);
            row.insert(at, v);
        }
        self.headers.insert(at, name.to_string());
    }

    pub fn push_column_with<F>(&mut self, name: &str, value: F)
    where
        F: FnMut(&[Value]) -> Value,
    {
        self.insert_column_with(self.headers.len(), name, value);
    }

    /// Keep only the columns whose header satisfies `keep`, in order.
    pub fn retain_columns<F>(&mut self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        let kept: Vec<usize> = (0..self.headers.len())
            .filter(|&i| keep(&self.headers[i]))
            .collect();
        self.headers = kept.iter().map(|&i| self.headers[i].clone()).collect();
        for row in &mut self.rows {
            let mut old = std::mem::take(row);
            *row = kept
                .iter()
                .map(|&i| std::mem::replace(&mut old[i], Value::Null))
                .collect();
        }
    }

    /// Reorder columns to `order`, a permutation of column indices.
    pub fn reorder_columns(&mut self, order: &[usize]) {
        debug_assert_eq!(order.len(), self.headers.len());
        self.headers = order.iter().map(|&i| self.headers[i].clone()).collect();
        for row in &mut self.rows {
            *row = order.iter().map(|&i| row[i].clone()).collect();
        }
    }

    pub fn move_row_to_front(&mut self, index: usize) {
        if index < self.rows.len() && index > 0 {
            let row = self.rows.remove(index);
            self.rows.insert(0, row);
        }
    }

    pub fn meta_table(&self, name: &str) -> Option<&MetaTable> {
        self.meta.iter().find(|m| m.name == name)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Column inserts and removals never leave a row with the wrong width.
        #[test]
        fn prop_reshaping_keeps_rows_aligned(
            width in 1usize..6,
            height in 0usize..8,
            at in 0usize..10,
            drop in 0usize..6,
        ) {
            let headers: Vec<String> = (0..width).map(|i| format!("c{i}")).collect();
            let rows = (0..height)
                .map(|r| (0..width).map(|c| Value::Int(i64::try_from(r * width + c).unwrap())).collect())
                .collect();
            let mut t = TabularResult::new(headers, rows).unwrap();

            t.insert_column_with(at, "new", |_| Value::Null);
            prop_assert!(t.is_well_formed());
            prop_assert_eq!(t.headers.len(), width + 1);

            let dropped = format!("c{drop}");
            t.retain_columns(|h| h != dropped);
            prop_assert!(t.is_well_formed());
            prop_assert_eq!(t.rows.len(), height);
        }
    }
}

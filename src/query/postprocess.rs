use crate::error::{FunnelError, Result};
use crate::query::display::{datetime_label, numeric_range_label};
use crate::query::group_keys::is_group_key_column;
use crate::query::result::{FunnelReport, MetaTable, TabularResult, Value};
use crate::query::spec::{Dimension, FunnelSpec, ValueKind};
use crate::query::{
    is_conversion_column, is_step_column, is_step_time_column, step_column, QueryLimits,
    META_STEP_TIME_INFO, NONE_VALUE, NO_GROUP_VALUE,
};

pub const CONVERSION_SUFFIX: &str = "_conv";
pub const OVERALL_CONVERSION: &str = "overall_conv";

/// Shape a raw result for `spec`.
///
/// Runs in a fixed order: overall row first, nulls to zero, step times into a
/// side table, conversion columns, display labels, then dimension headers.
pub fn post_process(
    mut result: TabularResult,
    spec: &FunnelSpec,
    limits: &QueryLimits,
) -> Result<FunnelReport> {
    if !result.is_well_formed() {
        return Err(FunnelError::ExecutionFailure(
            "result rows do not match the header width".to_string(),
        ));
    }
    if result.rows.is_empty() {
        return Err(FunnelError::ExecutionFailure(
            "funnel query returned no rows".to_string(),
        ));
    }
    if let Some(missing) = (0..spec.steps.len())
        .map(step_column)
        .find(|c| result.column_index(c).is_none())
    {
        return Err(FunnelError::ExecutionFailure(format!(
            "funnel result has no {missing} column"
        )));
    }

    if spec.is_grouped() {
        move_overall_row_to_front(&mut result);
    }
    zero_fill_nulls(&mut result);
    if spec.wants_step_time() {
        extract_step_times(&mut result, limits.time_precision);
    }
    add_conversions(&mut result)?;
    sanitize_group_values(&mut result, &spec.group_by);
    mirror_group_keys(&mut result);
    relabel_group_keys(&mut result, &spec.group_by);
    Ok(result)
}

fn group_key_indices(headers: &[String]) -> Vec<usize> {
    headers
        .iter()
        .enumerate()
        .filter(|(_, h)| is_group_key_column(h))
        .map(|(i, _)| i)
        .collect()
}

/// Move the `$no_group` row to the front.
///
/// The row is found by its tag. Results without a tagged row fall back to
/// moving the last row, which is where older executors placed it.
pub fn move_overall_row_to_front(result: &mut TabularResult) {
    let keys = group_key_indices(&result.headers);
    let tagged = if keys.is_empty() {
        None
    } else {
        result.rows.iter().position(|row| {
            keys.iter()
                .all(|&k| row[k].as_str() == Some(NO_GROUP_VALUE))
        })
    };
    match tagged {
        Some(index) => result.move_row_to_front(index),
        None if !result.rows.is_empty() => {
            tracing::warn!("No tagged overall row in grouped funnel result, moving last row");
            result.move_row_to_front(result.rows.len() - 1);
        }
        None => {}
    }
}

/// Replace nulls in step and conversion columns with 0.
pub fn zero_fill_nulls(result: &mut TabularResult) {
    let columns: Vec<usize> = result
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| is_step_column(h) || is_conversion_column(h))
        .map(|(i, _)| i)
        .collect();
    for row in &mut result.rows {
        for &c in &columns {
            if row[c].is_null() {
                row[c] = Value::Int(0);
            }
        }
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10_f64.powi(i32::try_from(precision).unwrap_or(i32::MAX));
    (value * factor).round() / factor
}

/// Move step time columns, with the group keys, into the `MetaStepTimeInfo` table.
///
/// Values that are not numbers become 0.0; this never fails the report.
pub fn extract_step_times(result: &mut TabularResult, precision: u32) {
    let times: Vec<usize> = result
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| is_step_time_column(h))
        .map(|(i, _)| i)
        .collect();
    if times.is_empty() {
        return;
    }
    let keys = group_key_indices(&result.headers);

    let headers = keys
        .iter()
        .chain(&times)
        .map(|&i| result.headers[i].clone())
        .collect();
    let rows = result
        .rows
        .iter()
        .map(|row| {
            let mut out: Vec<Value> = keys.iter().map(|&k| row[k].clone()).collect();
            out.extend(times.iter().map(|&t| match row[t].as_f64() {
                Some(v) => Value::Float(round_to(v, precision)),
                None => {
                    if !row[t].is_null() {
                        tracing::warn!(value = %row[t], column = %result.headers[t], "Step time is not numeric, using 0");
                    }
                    Value::Float(0.0)
                }
            }));
            out
        })
        .collect();

    result.meta.push(MetaTable {
        name: META_STEP_TIME_INFO.to_string(),
        headers,
        rows,
    });
    result.retain_columns(|h| !is_step_time_column(h));
}

/// Conversion percentage of `cur` relative to `prev`, one decimal.
pub fn conversion(prev: f64, cur: f64) -> String {
    if prev.abs() < f64::EPSILON {
        return "0.0".to_string();
    }
    // Half away from zero; `{:.1}` alone rounds ties to even.
    format!("{:.1}", (cur / prev * 1000.0).round() / 10.0)
}

/// Insert `<prev>_<cur>_conv` after every step beyond the first and append
/// `overall_conv`.
///
/// Non-step columns keep their relative order ahead of the step columns.
/// A step count that is not a number aborts the whole computation.
pub fn add_conversions(result: &mut TabularResult) -> Result<()> {
    let mut steps: Vec<(u64, usize)> = result
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| is_step_column(h))
        .filter_map(|(i, h)| h["step_".len()..].parse().ok().map(|n| (n, i)))
        .collect();
    if steps.is_empty() {
        return Ok(());
    }
    steps.sort_unstable();

    let counts: Vec<Vec<f64>> = result
        .rows
        .iter()
        .enumerate()
        .map(|(r, row)| {
            steps
                .iter()
                .map(|&(_, c)| {
                    row[c].as_f64().ok_or_else(|| {
                        FunnelError::MalformedAggregate(format!(
                            "row {r} has non-numeric {} value {}",
                            result.headers[c], row[c]
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect::<Result<_>>()?;

    let step_indices: Vec<usize> = steps.iter().map(|&(_, c)| c).collect();
    let mut order: Vec<usize> = (0..result.headers.len())
        .filter(|i| !step_indices.contains(i))
        .collect();
    let first_step = order.len();
    order.extend(&step_indices);
    result.reorder_columns(&order);

    // Walk backwards so earlier insert positions stay valid.
    for s in (1..steps.len()).rev() {
        let name = format!(
            "{}_{}{CONVERSION_SUFFIX}",
            result.headers[first_step + s - 1],
            result.headers[first_step + s]
        );
        let mut row_index = 0;
        result.insert_column_with(first_step + s + 1, &name, |_| {
            let row = &counts[row_index];
            row_index += 1;
            Value::Text(conversion(row[s - 1], row[s]))
        });
    }
    let mut row_index = 0;
    result.push_column_with(OVERALL_CONVERSION, |_| {
        let row = &counts[row_index];
        row_index += 1;
        Value::Text(conversion(row[0], row[row.len() - 1]))
    });
    Ok(())
}

/// Render bucketed numeric ranges and truncated datetimes as display labels.
pub fn sanitize_group_values(result: &mut TabularResult, dims: &[Dimension]) {
    let keys = group_key_indices(&result.headers);
    for (&column, dim) in keys.iter().zip(dims) {
        if dim.value_kind == ValueKind::Categorical {
            continue;
        }
        for row in &mut result.rows {
            let Some(raw) = row[column].as_str() else {
                continue;
            };
            if raw == NONE_VALUE || raw == NO_GROUP_VALUE {
                continue;
            }
            let label = match dim.value_kind {
                ValueKind::Numeric => numeric_range_label(raw),
                ValueKind::Datetime => datetime_label(raw, dim.granularity.unwrap_or_default()),
                ValueKind::Categorical => None,
            };
            if let Some(label) = label {
                row[column] = Value::Text(label);
            }
        }
    }
}

/// Copy the main result's group-key values into each side table, by position.
pub fn mirror_group_keys(result: &mut TabularResult) {
    let keys = group_key_indices(&result.headers);
    for meta in &mut result.meta {
        let meta_keys = group_key_indices(&meta.headers);
        for (meta_row, row) in meta.rows.iter_mut().zip(&result.rows) {
            for (&m, &k) in meta_keys.iter().zip(&keys) {
                meta_row[m] = row[k].clone();
            }
        }
    }
}

/// Replace `_group_key_<n>` headers with dimension names, by position.
pub fn relabel_group_keys(result: &mut TabularResult, dims: &[Dimension]) {
    relabel(&mut result.headers, dims);
    for meta in &mut result.meta {
        relabel(&mut meta.headers, dims);
    }
}

fn relabel(headers: &mut [String], dims: &[Dimension]) {
    for (i, dim) in group_key_indices(headers).into_iter().zip(dims) {
        headers[i].clone_from(&dim.name);
    }
}

use crate::query::filters::{property_value, EVENTS_TABLE};
use crate::query::spec::{Dimension, Entity, ValueKind};
use crate::query::sql::{Expr, SelectItem};
use crate::query::{QueryLimits, NONE_VALUE};
use chrono::FixedOffset;

/// Alias of the users table joined in the aggregation stage for user keys.
pub const USER_KEYS_TABLE: &str = "group_users";

/// Datetime keys outside 0001-01-01 ..= 9999-12-31 UTC read `$none`.
pub const MIN_EPOCH_SECONDS: i64 = -62_135_596_800;
pub const MAX_EPOCH_SECONDS: i64 = 253_402_300_799;

pub fn group_key_column(index: usize) -> String {
    format!("_group_key_{index}")
}

pub fn is_group_key_column(name: &str) -> bool {
    name.starts_with("_group_key_")
}

/// Compiled form of one dimension.
#[derive(Debug, Clone)]
pub struct GroupKeySpec {
    pub column: String,
    pub dimension: Dimension,
    /// Normalized value expression over `events` (event keys) or
    /// [`USER_KEYS_TABLE`] (user keys).
    pub expr: Expr,
}

impl GroupKeySpec {
    pub fn is_bucketed(&self) -> bool {
        self.dimension.value_kind == ValueKind::Numeric
    }

    pub fn is_user_level(&self) -> bool {
        self.dimension.entity == Entity::User
    }

    pub fn bucket_column(&self) -> String {
        format!("{}_bucket", self.column)
    }

    pub fn numeric_column(&self) -> String {
        format!("{}_num", self.column)
    }

    pub fn lower_bound_column(&self) -> String {
        format!("{}_lbound", self.column)
    }

    pub fn upper_bound_column(&self) -> String {
        format!("{}_ubound", self.column)
    }
}

/// Compile `dims` in input order.
///
/// Every key is a `VARCHAR` column whose missing or empty values read `$none`.
/// Numeric keys are bucketed later, around the combined funnel relation,
/// because their bounds come from the data.
pub fn compile_group_keys(dims: &[Dimension], offset: FixedOffset) -> Vec<GroupKeySpec> {
    dims.iter()
        .map(|dim| {
            let table = match dim.entity {
                Entity::Event => EVENTS_TABLE,
                Entity::User => USER_KEYS_TABLE,
            };
            GroupKeySpec {
                column: group_key_column(dim.index),
                dimension: dim.clone(),
                expr: value_expr(dim, table, offset),
            }
        })
        .collect()
}

/// Keys computed inside the stage of step `step`.
pub fn keys_for_step(keys: &[GroupKeySpec], step: usize) -> impl Iterator<Item = &GroupKeySpec> {
    keys.iter()
        .filter(move |k| k.dimension.is_scoped_to_step(step))
}

pub fn needs_bucketing(keys: &[GroupKeySpec]) -> bool {
    keys.iter().any(GroupKeySpec::is_bucketed)
}

/// Map `NULL` and `''` to the `$none` sentinel.
pub fn or_none(expr: Expr) -> Expr {
    Expr::func(
        "COALESCE",
        vec![Expr::func("NULLIF", vec![expr, Expr::text("")]), Expr::text(NONE_VALUE)],
    )
}

fn value_expr(dim: &Dimension, table: &str, offset: FixedOffset) -> Expr {
    let raw = property_value(table, &dim.name);
    match dim.value_kind {
        ValueKind::Categorical | ValueKind::Numeric => or_none(raw),
        ValueKind::Datetime => {
            // Shift into the report timezone, truncate, and keep epoch seconds.
            // The post-processor turns these into calendar labels.
            let granularity = dim.granularity.unwrap_or_default();
            let seconds = raw.try_cast("DOUBLE").try_cast("BIGINT");
            let local = seconds.clone().plus(Expr::int(i64::from(offset.local_minus_utc())));
            // Out-of-range epochs would overflow the microsecond conversion.
            let micros = Expr::Case {
                whens: vec![(
                    seconds
                        .clone()
                        .gt_eq(Expr::int(MIN_EPOCH_SECONDS))
                        .and(seconds.lt_eq(Expr::int(MAX_EPOCH_SECONDS))),
                    local.mul(Expr::int(1_000_000)),
                )],
                otherwise: None,
            };
            let truncated = Expr::func(
                "date_trunc",
                vec![
                    Expr::text(granularity.as_str()),
                    Expr::func("make_timestamp", vec![micros]),
                ],
            );
            Expr::func(
                "COALESCE",
                vec![
                    Expr::func("epoch", vec![truncated])
                        .cast("BIGINT")
                        .cast("VARCHAR"),
                    Expr::text(NONE_VALUE),
                ],
            )
        }
    }
}

/// Percentile bounds of a numeric key over the values that parse as numbers.
pub fn bound_items(key: &GroupKeySpec, limits: &QueryLimits) -> Vec<SelectItem> {
    let number = || Expr::col(&key.column).try_cast("DOUBLE");
    vec![
        Expr::Aggregate {
            name: "quantile_cont",
            args: vec![number(), Expr::float(limits.percentile_lower)],
            order_by: Vec::new(),
        }
        .alias(&key.lower_bound_column()),
        Expr::Aggregate {
            name: "quantile_cont",
            args: vec![number(), Expr::float(limits.percentile_upper)],
            order_by: Vec::new(),
        }
        .alias(&key.upper_bound_column()),
    ]
}

/// Numeric value and bucket index of a key, given its bounds stage.
///
/// Values below the lower bound land in bucket 0, values at or above the
/// upper bound in `bucket_count + 1`, sentinel values in -1.
pub fn bucket_items(key: &GroupKeySpec, bounds: &str, limits: &QueryLimits) -> Vec<SelectItem> {
    let number = || Expr::col(&key.column).try_cast("DOUBLE");
    let lower = || Expr::qualified(bounds, &key.lower_bound_column());
    let upper = || {
        let ub = Expr::qualified(bounds, &key.upper_bound_column());
        Expr::Case {
            whens: vec![(ub.clone().eq(lower()), ub.clone().plus(Expr::float(1.0)))],
            otherwise: Some(Box::new(ub)),
        }
    };
    let count = i64::from(limits.bucket_count);

    let bucket = Expr::Case {
        whens: vec![
            (number().is_null(), Expr::int(-1)),
            (number().lt(lower()), Expr::int(0)),
            (number().gt_eq(upper()), Expr::int(count + 1)),
        ],
        otherwise: Some(Box::new(
            Expr::func(
                "FLOOR",
                vec![number()
                    .minus(lower())
                    .mul(Expr::int(count))
                    .div(upper().minus(lower()))],
            )
            .cast("INTEGER")
            .plus(Expr::int(1)),
        )),
    };

    vec![
        number().alias(&key.numeric_column()),
        bucket.alias(&key.bucket_column()),
    ]
}

/// Raw `"<min> - <max>"` range of a bucket inside a `GROUP BY bucket` query.
pub fn bucket_range_expr(key: &GroupKeySpec) -> Expr {
    let bound = |agg| Expr::agg(agg, Expr::col(&key.numeric_column())).cast("VARCHAR");
    Expr::Case {
        whens: vec![(
            Expr::col(&key.bucket_column()).eq(Expr::int(-1)),
            Expr::text(NONE_VALUE),
        )],
        otherwise: Some(Box::new(
            bound("MIN").concat(Expr::text(" - ")).concat(bound("MAX")),
        )),
    }
}

use crate::query::group_keys::{
    bound_items, bucket_items, bucket_range_expr, needs_bucketing, or_none, GroupKeySpec,
    USER_KEYS_TABLE,
};
use crate::query::spec::FunnelSpec;
use crate::query::sql::{
    Cte, Expr, JoinKind, OrderItem, Query, Relation, Select, SelectItem, StageRef, TableRef,
};
use crate::query::steps::{StepPipeline, COAL_USER_ID, EVENT_USER_ID, TIMESTAMP};
use crate::query::{
    step_column, step_time_column, step_timestamp_column, QueryLimits, NO_GROUP_VALUE,
};

pub const FUNNEL_STAGE: &str = "funnel";
pub const BOUNDS_STAGE: &str = "funnel_bounds";
pub const BUCKETED_STAGE: &str = "funnel_bucketed";

/// Combine the step stages into the `funnel` relation and emit the final query.
pub fn compile_aggregation(
    spec: &FunnelSpec,
    pipeline: StepPipeline,
    keys: &[GroupKeySpec],
    limits: &QueryLimits,
) -> Query {
    let StepPipeline { mut ctes, reached } = pipeline;
    let funnel = StageRef::new(FUNNEL_STAGE);
    ctes.push(Cte {
        stage: funnel.clone(),
        relation: funnel_select(spec, &reached, keys).into(),
    });

    let mut source = funnel.clone();
    if needs_bucketing(keys) {
        let bounds = StageRef::new(BOUNDS_STAGE);
        let bucketed = StageRef::new(BUCKETED_STAGE);
        ctes.push(Cte {
            stage: bounds.clone(),
            relation: Select::new(TableRef::stage(&funnel))
                .items(
                    keys.iter()
                        .filter(|k| k.is_bucketed())
                        .flat_map(|k| bound_items(k, limits)),
                )
                .into(),
        });
        ctes.push(Cte {
            stage: bucketed.clone(),
            relation: Select::new(TableRef::stage(&funnel))
                .item(Expr::Star(Some(funnel.name().to_string())))
                .items(
                    keys.iter()
                        .filter(|k| k.is_bucketed())
                        .flat_map(|k| bucket_items(k, bounds.name(), limits)),
                )
                .join(JoinKind::Cross, TableRef::stage(&bounds), None)
                .into(),
        });
        source = bucketed;
    }

    let body = if keys.is_empty() {
        Select::new(TableRef::stage(&source))
            .items(metric_items(spec))
            .into()
    } else {
        grouped_body(spec, &source, keys, limits)
    };

    Query { ctes, body }
}

/// One row per identity that reached step 0, with a flag per reached step.
fn funnel_select(spec: &FunnelSpec, reached: &[StageRef], keys: &[GroupKeySpec]) -> Select {
    let first = &reached[0];
    let mut select = Select::new(TableRef::stage(first))
        .item(first.col(COAL_USER_ID).alias(COAL_USER_ID));

    for (i, stage) in reached.iter().enumerate() {
        if i > 0 {
            select = select.join(
                JoinKind::Left,
                TableRef::stage(stage),
                Some(stage.col(COAL_USER_ID).eq(first.col(COAL_USER_ID))),
            );
        }
        select = select.item(stage.col(&step_column(i)).alias(&step_column(i)));
    }
    if spec.wants_step_time() {
        for (i, stage) in reached.iter().enumerate() {
            select = select.item(stage.col(TIMESTAMP).alias(&step_timestamp_column(i)));
        }
    }

    for key in keys {
        let item = match key.dimension.event_step_index {
            Some(step) if !key.is_user_level() => {
                // Identities that never reached the step have no value for it.
                or_none(reached[step].col(&key.column)).alias(&key.column)
            }
            _ => key.expr.clone().alias(&key.column),
        };
        select = select.item(item);
    }

    if keys.iter().any(GroupKeySpec::is_user_level) {
        select = select.join(
            JoinKind::Left,
            TableRef::aliased("users", USER_KEYS_TABLE),
            Expr::conjunction([
                Expr::qualified(USER_KEYS_TABLE, "project_id").eq(Expr::param(spec.project_id)),
                Expr::qualified(USER_KEYS_TABLE, "id").eq(first.col(EVENT_USER_ID)),
            ]),
        );
    }
    select
}

fn step_count(i: usize) -> Expr {
    Expr::agg("SUM", Expr::col(&step_column(i))).cast("BIGINT")
}

/// Summed step flags followed by average step times.
fn metric_items(spec: &FunnelSpec) -> Vec<SelectItem> {
    let steps = spec.steps.len();
    let mut items: Vec<SelectItem> = (0..steps)
        .map(|i| step_count(i).alias(&step_column(i)))
        .collect();
    if spec.wants_step_time() {
        items.extend((1..steps).map(|i| {
            Expr::agg(
                "AVG",
                Expr::col(&step_timestamp_column(i)).minus(Expr::col(&step_timestamp_column(i - 1))),
            )
            .alias(&step_time_column(i))
        }));
    }
    items
}

/// Overall `$no_group` row unioned with the top grouped rows.
fn grouped_body(
    spec: &FunnelSpec,
    source: &StageRef,
    keys: &[GroupKeySpec],
    limits: &QueryLimits,
) -> Relation {
    let overall = Select::new(TableRef::stage(source))
        .items(keys.iter().map(|k| Expr::text(NO_GROUP_VALUE).alias(&k.column)))
        .items(metric_items(spec));

    let group_exprs: Vec<Expr> = keys
        .iter()
        .map(|k| {
            if k.is_bucketed() {
                Expr::col(&k.bucket_column())
            } else {
                Expr::col(&k.column)
            }
        })
        .collect();
    let mut order = vec![OrderItem::desc(step_count(0))];
    order.extend(group_exprs.iter().cloned().map(OrderItem::asc));

    let grouped = Select::new(TableRef::stage(source))
        .items(keys.iter().map(|k| {
            if k.is_bucketed() {
                bucket_range_expr(k).alias(&k.column)
            } else {
                Expr::col(&k.column).alias(&k.column)
            }
        }))
        .items(metric_items(spec))
        .group_by(group_exprs)
        .order_by(order)
        .limit(limits.result_limit);

    let union = Relation::UnionAll(vec![
        overall.into(),
        Select::new(TableRef::subquery(grouped.into(), "grouped"))
            .item(Expr::Star(None))
            .into(),
    ]);

    let mut outer_order = vec![OrderItem::desc(Expr::col(&step_column(0)))];
    outer_order.extend(keys.iter().map(|k| OrderItem::asc(Expr::col(&k.column))));
    Select::new(TableRef::subquery(union, "results"))
        .item(Expr::Star(None))
        .order_by(outer_order)
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::group_keys::compile_group_keys;
    use crate::query::spec::{Dimension, Step, TimeRange, ValueKind};
    use crate::query::steps::{compile_steps, ResolvedStep};
    use chrono::FixedOffset;

    fn spec(steps: usize, group_by: Vec<Dimension>, step_time: bool) -> FunnelSpec {
        FunnelSpec {
            project_id: 1,
            steps: (0..steps).map(|i| Step::new(&format!("e{i}"))).collect(),
            global_user_filters: Vec::new(),
            group_by,
            session_window: None,
            time_range: TimeRange { from: 0, to: 100 },
            timezone: "UTC".to_string(),
            step_time,
        }
    }

    fn compile(spec: &FunnelSpec) -> Query {
        let resolved: Vec<ResolvedStep<'_>> = spec
            .steps
            .iter()
            .map(|step| ResolvedStep {
                step,
                event_id: 1,
                group: None,
            })
            .collect();
        let keys = compile_group_keys(&spec.group_by, FixedOffset::east_opt(0).unwrap());
        let pipeline = compile_steps(spec, &resolved, &keys).unwrap();
        compile_aggregation(spec, pipeline, &keys, &QueryLimits::default())
    }

    #[test]
    fn test_ungrouped_body() {
        let query = compile(&spec(2, Vec::new(), false));
        let (sql, _) = query.render();
        assert!(sql.ends_with(
            "SELECT CAST(SUM(step_0) AS BIGINT) AS step_0, CAST(SUM(step_1) AS BIGINT) AS step_1 FROM funnel"
        ));
        assert!(sql.contains(
            "funnel AS (SELECT step_0.coal_user_id AS coal_user_id, step_0.step_0 AS step_0, step_1_step_0.step_1 AS step_1 FROM step_0 LEFT JOIN step_1_step_0 ON step_1_step_0.coal_user_id = step_0.coal_user_id)"
        ));
    }

    #[test]
    fn test_step_time_columns() {
        let (sql, _) = compile(&spec(3, Vec::new(), true)).render();
        assert!(sql.contains("step_2_step_1_step_0.timestamp AS step_2_timestamp"));
        assert!(sql.contains("AVG((step_1_timestamp - step_0_timestamp)) AS step_0_1_time"));
        assert!(sql.contains("AVG((step_2_timestamp - step_1_timestamp)) AS step_1_2_time"));

        let (sql, _) = compile(&spec(1, Vec::new(), true)).render();
        assert!(!sql.contains("_time"));
    }

    #[test]
    fn test_grouped_body_unions_overall_row() {
        let dims = vec![
            Dimension::user(0, "plan", ValueKind::Categorical),
            Dimension::event(1, 1, "browser", ValueKind::Categorical),
        ];
        let query = compile(&spec(2, dims, false));
        let (sql, params) = query.render();
        assert!(sql.contains("SELECT '$no_group' AS _group_key_0, '$no_group' AS _group_key_1, CAST(SUM(step_0) AS BIGINT) AS step_0"));
        assert!(sql.contains(" UNION ALL SELECT * FROM (SELECT _group_key_0 AS _group_key_0"));
        assert!(sql.contains("GROUP BY _group_key_0, _group_key_1 ORDER BY CAST(SUM(step_0) AS BIGINT) DESC, _group_key_0 ASC, _group_key_1 ASC LIMIT 100) AS grouped"));
        assert!(sql.ends_with(") AS results ORDER BY step_0 DESC, _group_key_0 ASC, _group_key_1 ASC"));
        assert!(sql.contains("LEFT JOIN users AS group_users ON (group_users.project_id = ? AND group_users.id = step_0.event_user_id)"));
        assert!(sql.contains("COALESCE(NULLIF(step_1_step_0._group_key_1, ''), '$none') AS _group_key_1"));
        // Two steps bind four values each, plus the project for the user join.
        assert_eq!(params.len(), 9);
    }

    #[test]
    fn test_numeric_keys_are_bucketed() {
        let dims = vec![Dimension::user(0, "age", ValueKind::Numeric)];
        let query = compile(&spec(2, dims, true));
        assert_eq!(
            query.stage_names(),
            vec![
                "step_0",
                "step_1",
                "step_1_step_0",
                "funnel",
                "funnel_bounds",
                "funnel_bucketed"
            ]
        );
        let (sql, _) = query.render();
        assert!(sql.contains("funnel_bucketed AS (SELECT funnel.*, TRY_CAST(_group_key_0 AS DOUBLE) AS _group_key_0_num"));
        assert!(sql.contains("FROM funnel CROSS JOIN funnel_bounds)"));
        assert!(sql.contains("GROUP BY _group_key_0_bucket"));
        assert!(sql.contains("FROM funnel_bucketed"));
        assert!(sql.contains("step_1_timestamp"));
    }
}

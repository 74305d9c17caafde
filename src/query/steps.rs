use crate::error::{FunnelError, Result};
use crate::query::filters::{compile_filters, EVENTS_TABLE, USERS_TABLE};
use crate::query::group_keys::{keys_for_step, GroupKeySpec};
use crate::query::spec::{FunnelSpec, Step, SESSION_EVENT_NAME};
use crate::query::sql::{Cte, Expr, JoinKind, OrderItem, Select, SelectItem, StageRef, TableRef};
use crate::query::step_column;
use crate::storage::metadata::GroupDescriptor;

pub const COAL_USER_ID: &str = "coal_user_id";
pub const EVENT_USER_ID: &str = "event_user_id";
pub const TIMESTAMP: &str = "timestamp";
pub const EVENT_ID: &str = "event_id";
pub const SESSION_ID: &str = "session_id";

/// A step whose event name and group have been resolved against metadata.
#[derive(Debug, Clone)]
pub struct ResolvedStep<'a> {
    pub step: &'a Step,
    pub event_id: i64,
    pub group: Option<GroupDescriptor>,
}

/// Stages produced for all steps.
#[derive(Debug, Clone)]
pub struct StepPipeline {
    pub ctes: Vec<Cte>,
    /// For each step, the stage holding one row per identity that reached it.
    pub reached: Vec<StageRef>,
}

/// Stage holding step `i`'s occurrences.
pub fn step_stage(i: usize) -> StageRef {
    StageRef::new(step_column(i))
}

/// Stage joining step `i` with the cumulative history of steps `0..i`.
pub fn join_stage(i: usize) -> StageRef {
    let names: Vec<String> = (0..=i).rev().map(step_column).collect();
    StageRef::new(names.join("_"))
}

/// Deterministic first value of `expr` ordered by time, then by event id.
fn first_by_time(expr: Expr, timestamp: Expr, event_id: Expr) -> Expr {
    Expr::Aggregate {
        name: "first",
        args: vec![expr],
        order_by: vec![OrderItem::asc(timestamp), OrderItem::asc(event_id)],
    }
}

fn coalesced_identity() -> Expr {
    Expr::func(
        "COALESCE",
        vec![
            Expr::qualified(USERS_TABLE, "customer_user_id"),
            Expr::qualified(EVENTS_TABLE, "user_id"),
        ],
    )
}

/// Compile the stage chain for every step of `spec`.
///
/// Step 0 keeps the first occurrence per identity. Every later step keeps all
/// candidate occurrences, and a join stage against the cumulative stage of the
/// previous step picks the first occurrence that happened after it:
/// `step_0 -> step_1_step_0 -> step_2_step_1_step_0 -> ...`
pub fn compile_steps(
    spec: &FunnelSpec,
    steps: &[ResolvedStep<'_>],
    keys: &[GroupKeySpec],
) -> Result<StepPipeline> {
    if steps.is_empty() {
        return Err(FunnelError::CompileFailure(
            "cannot build a stage chain without steps".to_string(),
        ));
    }
    if steps.len() != spec.steps.len() {
        return Err(FunnelError::CompileFailure(format!(
            "resolved {} of {} steps",
            steps.len(),
            spec.steps.len()
        )));
    }

    let mut ctes = Vec::with_capacity(steps.len() * 2);
    let mut reached = Vec::with_capacity(steps.len());

    for (i, resolved) in steps.iter().enumerate() {
        let stage = step_stage(i);
        let select = if i == 0 {
            first_occurrence_select(spec, resolved, keys)?
        } else {
            candidates_select(spec, i, resolved, keys)?
        };
        ctes.push(Cte {
            stage: stage.clone(),
            relation: select.into(),
        });

        if i == 0 {
            reached.push(stage);
            continue;
        }

        let previous = &reached[i - 1];
        let joined = join_stage(i);
        let same_event = spec.steps[i - 1].event_name == resolved.step.event_name;
        ctes.push(Cte {
            stage: joined.clone(),
            relation: join_select(spec, i, previous, &stage, same_event, keys).into(),
        });
        reached.push(joined);
    }

    tracing::debug!(
        stages = ctes.len(),
        terminal = %reached[reached.len() - 1],
        "Compiled step pipeline"
    );
    Ok(StepPipeline { ctes, reached })
}

/// Base selection of step `i` over the event/user join.
fn base_select(spec: &FunnelSpec, resolved: &ResolvedStep<'_>) -> Result<Select> {
    let events = |c: &str| Expr::qualified(EVENTS_TABLE, c);

    let mut predicates = vec![
        events("project_id").eq(Expr::param(spec.project_id)),
        events("timestamp").gt_eq(Expr::param(spec.time_range.from)),
        events("timestamp").lt_eq(Expr::param(spec.time_range.to)),
        events("event_name_id").eq(Expr::param(resolved.event_id)),
    ];
    predicates.extend(compile_filters(&resolved.step.filters)?);
    predicates.extend(compile_filters(&spec.global_user_filters)?);
    if let Some(group) = &resolved.group {
        predicates.push(Expr::qualified(USERS_TABLE, &group.column()).is_not_null());
    }

    Ok(Select::new(TableRef::named(EVENTS_TABLE))
        .join(
            JoinKind::Inner,
            TableRef::named(USERS_TABLE),
            Expr::conjunction([
                Expr::qualified(USERS_TABLE, "project_id").eq(events("project_id")),
                Expr::qualified(USERS_TABLE, "id").eq(events("user_id")),
            ]),
        )
        .filter(Expr::conjunction(predicates)))
}

fn session_expr(step: &Step) -> Expr {
    if step.event_name == SESSION_EVENT_NAME {
        Expr::qualified(EVENTS_TABLE, "id")
    } else {
        Expr::qualified(EVENTS_TABLE, "session_id")
    }
}

/// Columns every step stage carries, as `(expression, alias)` over the raw join.
fn event_columns(spec: &FunnelSpec, i: usize, step: &Step, keys: &[GroupKeySpec]) -> Vec<(Expr, String)> {
    let events = |c: &str| Expr::qualified(EVENTS_TABLE, c);
    let mut columns = vec![
        (events("user_id"), EVENT_USER_ID.to_string()),
        (events("timestamp"), TIMESTAMP.to_string()),
        (events("id"), EVENT_ID.to_string()),
    ];
    if spec.tracks_session(i) {
        columns.push((session_expr(step), SESSION_ID.to_string()));
    }
    columns.extend(keys_for_step(keys, i).map(|k| (k.expr.clone(), k.column.clone())));
    columns
}

/// Step 0: the first matching occurrence per identity.
fn first_occurrence_select(
    spec: &FunnelSpec,
    resolved: &ResolvedStep<'_>,
    keys: &[GroupKeySpec],
) -> Result<Select> {
    let items: Vec<SelectItem> = event_columns(spec, 0, resolved.step, keys)
        .into_iter()
        .map(|(expr, alias)| {
            first_by_time(
                expr,
                Expr::qualified(EVENTS_TABLE, "timestamp"),
                Expr::qualified(EVENTS_TABLE, "id"),
            )
            .alias(&alias)
        })
        .collect();

    Ok(base_select(spec, resolved)?
        .item(coalesced_identity().alias(COAL_USER_ID))
        .items(items)
        .item(Expr::int(1).alias(&step_column(0)))
        .group_by(vec![coalesced_identity()]))
}

/// Step `i > 0`: every matching occurrence.
fn candidates_select(
    spec: &FunnelSpec,
    i: usize,
    resolved: &ResolvedStep<'_>,
    keys: &[GroupKeySpec],
) -> Result<Select> {
    let items: Vec<SelectItem> = event_columns(spec, i, resolved.step, keys)
        .into_iter()
        .map(|(expr, alias)| expr.alias(&alias))
        .collect();
    Ok(base_select(spec, resolved)?
        .item(coalesced_identity().alias(COAL_USER_ID))
        .items(items))
}

/// Join step `i`'s candidates with the cumulative stage of step `i - 1`,
/// keeping the first occurrence per identity that comes after it.
fn join_select(
    spec: &FunnelSpec,
    i: usize,
    previous: &StageRef,
    current: &StageRef,
    same_event: bool,
    keys: &[GroupKeySpec],
) -> Select {
    let after = if same_event {
        current.col(TIMESTAMP).gt(previous.col(TIMESTAMP))
    } else {
        current.col(TIMESTAMP).gt_eq(previous.col(TIMESTAMP))
    };
    let mut on = vec![
        current.col(COAL_USER_ID).eq(previous.col(COAL_USER_ID)),
        after,
    ];
    if spec.session_window.is_some_and(|w| w.covers_pair(i)) {
        on.push(current.col(SESSION_ID).eq(previous.col(SESSION_ID)));
    }

    let first = |column: &str| {
        first_by_time(
            current.col(column),
            current.col(TIMESTAMP),
            current.col(EVENT_ID),
        )
        .alias(column)
    };
    let mut items = vec![
        current.col(COAL_USER_ID).alias(COAL_USER_ID),
        first(EVENT_USER_ID),
        first(TIMESTAMP),
        first(EVENT_ID),
    ];
    if spec.tracks_session(i) {
        items.push(first(SESSION_ID));
    }
    items.extend(keys_for_step(keys, i).map(|k| first(&k.column)));
    items.push(Expr::int(1).alias(&step_column(i)));

    Select::new(TableRef::stage(previous))
        .join(JoinKind::Inner, TableRef::stage(current), Expr::conjunction(on))
        .items(items)
        .group_by(vec![current.col(COAL_USER_ID)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::group_keys::compile_group_keys;
    use crate::query::spec::{Dimension, SessionWindow, TimeRange, ValueKind};
    use crate::query::sql::{Query, Relation};
    use chrono::FixedOffset;

    fn spec(events: &[&str]) -> FunnelSpec {
        FunnelSpec {
            project_id: 1,
            steps: events.iter().map(|e| Step::new(e)).collect(),
            global_user_filters: Vec::new(),
            group_by: Vec::new(),
            session_window: None,
            time_range: TimeRange { from: 10, to: 20 },
            timezone: "UTC".to_string(),
            step_time: false,
        }
    }

    fn resolve(spec: &FunnelSpec) -> Vec<ResolvedStep<'_>> {
        spec.steps
            .iter()
            .enumerate()
            .map(|(i, step)| ResolvedStep {
                step,
                event_id: i64::try_from(i).unwrap() + 100,
                group: None,
            })
            .collect()
    }

    fn render_stage(pipeline: &StepPipeline, name: &str) -> String {
        let cte = pipeline
            .ctes
            .iter()
            .find(|c| c.stage.name() == name)
            .unwrap();
        let (sql, _) = Query {
            ctes: Vec::new(),
            body: cte.relation.clone(),
        }
        .render();
        sql
    }

    #[test]
    fn test_stage_chain_is_linear() {
        let spec = spec(&["a", "b", "c"]);
        let pipeline = compile_steps(&spec, &resolve(&spec), &[]).unwrap();
        let names: Vec<&str> = pipeline.ctes.iter().map(|c| c.stage.name()).collect();
        assert_eq!(
            names,
            vec!["step_0", "step_1", "step_1_step_0", "step_2", "step_2_step_1_step_0"]
        );
        let reached: Vec<&str> = pipeline.reached.iter().map(StageRef::name).collect();
        assert_eq!(reached, vec!["step_0", "step_1_step_0", "step_2_step_1_step_0"]);
    }

    #[test]
    fn test_first_step_picks_earliest_occurrence() {
        let spec = spec(&["a", "b"]);
        let pipeline = compile_steps(&spec, &resolve(&spec), &[]).unwrap();
        let sql = render_stage(&pipeline, "step_0");
        assert!(sql.contains(
            "first(events.timestamp ORDER BY events.timestamp ASC, events.id ASC) AS timestamp"
        ));
        assert!(sql.ends_with("GROUP BY COALESCE(users.customer_user_id, events.user_id)"));
        assert!(sql.contains("1 AS step_0"));
    }

    #[test]
    fn test_later_steps_keep_all_candidates() {
        let spec = spec(&["a", "b"]);
        let pipeline = compile_steps(&spec, &resolve(&spec), &[]).unwrap();
        let sql = render_stage(&pipeline, "step_1");
        assert!(!sql.contains("GROUP BY"));
        assert!(sql.contains("events.timestamp AS timestamp"));
    }

    #[test]
    fn test_join_uses_strict_order_for_repeated_event() {
        let spec = spec(&["view", "view", "buy"]);
        let pipeline = compile_steps(&spec, &resolve(&spec), &[]).unwrap();
        let repeated = render_stage(&pipeline, "step_1_step_0");
        assert!(repeated.contains("step_1.timestamp > step_0.timestamp"));

        let distinct = render_stage(&pipeline, "step_2_step_1_step_0");
        assert!(distinct.contains("step_2.timestamp >= step_1_step_0.timestamp"));
        assert!(distinct.contains("FROM step_1_step_0 JOIN step_2 ON"));
        assert!(distinct.contains(
            "first(step_2.event_user_id ORDER BY step_2.timestamp ASC, step_2.event_id ASC) AS event_user_id"
        ));
    }

    #[test]
    fn test_step_parameters() {
        let spec = spec(&["a", "b"]);
        let pipeline = compile_steps(&spec, &resolve(&spec), &[]).unwrap();
        let (_, params) = Query {
            ctes: pipeline.ctes,
            body: Relation::from(Select::new(TableRef::named("step_0")).item(Expr::Star(None))),
        }
        .render();
        let expected: Vec<crate::query::result::Value> = vec![
            1_i64.into(),
            10_i64.into(),
            20_i64.into(),
            100_i64.into(),
            1_i64.into(),
            10_i64.into(),
            20_i64.into(),
            101_i64.into(),
        ];
        assert_eq!(params, expected);
    }

    #[test]
    fn test_session_window_carries_session_ids() {
        let mut spec = spec(&["$session", "view", "buy"]);
        spec.session_window = Some(SessionWindow {
            start_step_index: 0,
            end_step_index: 1,
        });
        let pipeline = compile_steps(&spec, &resolve(&spec), &[]).unwrap();

        let first = render_stage(&pipeline, "step_0");
        assert!(first.contains("first(events.id ORDER BY events.timestamp ASC, events.id ASC) AS session_id"));

        let second = render_stage(&pipeline, "step_1");
        assert!(second.contains("events.session_id AS session_id"));

        let joined = render_stage(&pipeline, "step_1_step_0");
        assert!(joined.contains("step_1.session_id = step_0.session_id"));

        let outside = render_stage(&pipeline, "step_2_step_1_step_0");
        assert!(!outside.contains("session_id"));
    }

    #[test]
    fn test_step_scoped_group_keys() {
        let mut spec = spec(&["a", "b"]);
        spec.group_by = vec![Dimension::event(0, 1, "browser", ValueKind::Categorical)];
        let keys = compile_group_keys(&spec.group_by, FixedOffset::east_opt(0).unwrap());
        let pipeline = compile_steps(&spec, &resolve(&spec), &keys).unwrap();

        assert!(!render_stage(&pipeline, "step_0").contains("_group_key_0"));
        assert!(render_stage(&pipeline, "step_1").contains("AS _group_key_0"));
        assert!(render_stage(&pipeline, "step_1_step_0").contains(
            "first(step_1._group_key_0 ORDER BY step_1.timestamp ASC, step_1.event_id ASC) AS _group_key_0"
        ));
    }

    #[test]
    fn test_group_association_filter() {
        let spec = spec(&["a"]);
        let mut steps = resolve(&spec);
        steps[0].group = Some(GroupDescriptor {
            id: 2,
            name: "companies".to_string(),
        });
        let pipeline = compile_steps(&spec, &steps, &[]).unwrap();
        assert!(render_stage(&pipeline, "step_0").contains("users.group_2_id IS NOT NULL"));
    }

    #[test]
    fn test_empty_steps_fail() {
        let spec = spec(&[]);
        let err = compile_steps(&spec, &[], &[]).unwrap_err();
        assert!(matches!(err, FunnelError::CompileFailure(_)));
    }
}

use crate::error::{FunnelError, Result};
use crate::query::spec::{Entity, FilterOperator, LogicalOp, PropertyFilter};
use crate::query::sql::Expr;
use crate::query::NONE_VALUE;

/// Table alias holding event properties inside a step stage.
pub const EVENTS_TABLE: &str = "events";
/// Table alias holding user properties inside a step stage.
pub const USERS_TABLE: &str = "users";

/// Raw string value of a JSON property, `NULL` when absent.
pub fn property_value(table: &str, property: &str) -> Expr {
    Expr::func(
        "json_extract_string",
        vec![
            Expr::qualified(table, "properties"),
            Expr::text(&format!("$.\"{property}\"")),
        ],
    )
}

const fn table_for(entity: Entity) -> &'static str {
    match entity {
        Entity::Event => EVENTS_TABLE,
        Entity::User => USERS_TABLE,
    }
}

/// Compile a filter list into one predicate.
///
/// Filters joined with `or` collapse into a single disjunction; the
/// disjunctions are then joined with `AND`.
pub fn compile_filters(filters: &[PropertyFilter]) -> Result<Option<Expr>> {
    let mut groups: Vec<Vec<Expr>> = Vec::new();
    for (i, filter) in filters.iter().enumerate() {
        let predicate = compile_filter(filter)?;
        match groups.last_mut() {
            Some(group) if i > 0 && filter.logical_op == LogicalOp::Or => group.push(predicate),
            _ => groups.push(vec![predicate]),
        }
    }
    Ok(Expr::conjunction(groups.into_iter().filter_map(Expr::disjunction)))
}

fn compile_filter(filter: &PropertyFilter) -> Result<Expr> {
    let value = property_value(table_for(filter.entity), &filter.property);
    let missing = value
        .clone()
        .is_null()
        .or(value.clone().eq(Expr::text("")));

    let expr = match filter.operator {
        FilterOperator::Equals if filter.value == NONE_VALUE => missing,
        FilterOperator::NotEqual if filter.value == NONE_VALUE => missing.negate(),
        FilterOperator::Equals => value.eq(Expr::param(filter.value.as_str())),
        FilterOperator::NotEqual => value
            .clone()
            .is_null()
            .or(value.not_eq(Expr::param(filter.value.as_str()))),
        FilterOperator::Contains => {
            Expr::func("contains", vec![value, Expr::param(filter.value.as_str())])
        }
        FilterOperator::NotContains => value.clone().is_null().or(Expr::func(
            "contains",
            vec![value, Expr::param(filter.value.as_str())],
        )
        .negate()),
        FilterOperator::GreaterThan
        | FilterOperator::LesserThan
        | FilterOperator::GreaterThanOrEqual
        | FilterOperator::LesserThanOrEqual => {
            let bound: f64 = filter.value.trim().parse().map_err(|_| {
                FunnelError::InvalidSpec(format!(
                    "filter on {} needs a numeric value, got {:?}",
                    filter.property, filter.value
                ))
            })?;
            let number = value.try_cast("DOUBLE");
            let bound = Expr::param(bound);
            match filter.operator {
                FilterOperator::GreaterThan => number.gt(bound),
                FilterOperator::LesserThan => number.lt(bound),
                FilterOperator::GreaterThanOrEqual => number.gt_eq(bound),
                _ => number.lt_eq(bound),
            }
        }
    };
    Ok(expr)
}

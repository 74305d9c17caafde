use crate::error::{FunnelError, Result};
use crate::query::aggregate::compile_aggregation;
use crate::query::group_keys::compile_group_keys;
use crate::query::result::Value;
use crate::query::spec::FunnelSpec;
use crate::query::steps::{compile_steps, ResolvedStep};
use crate::query::QueryLimits;
use crate::storage::metadata::MetadataResolver;

/// Rendered SQL and its positional parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    /// Names of the CTE stages, in definition order.
    pub stages: Vec<String>,
}

/// Validate `spec`, resolve its metadata and compile it to a single query.
pub fn compile<M>(spec: &FunnelSpec, metadata: &M, limits: &QueryLimits) -> Result<CompiledQuery>
where
    M: MetadataResolver + ?Sized,
{
    spec.validate(limits)?;
    let offset = spec.offset()?;
    let steps = resolve_steps(spec, metadata)?;
    check_dimensions(spec, metadata)?;

    let keys = compile_group_keys(&spec.group_by, offset);
    let pipeline = compile_steps(spec, &steps, &keys)?;
    let query = compile_aggregation(spec, pipeline, &keys, limits);
    let stages = query.stage_names().into_iter().map(str::to_string).collect();
    let (sql, params) = query.render();

    tracing::debug!(
        project_id = spec.project_id,
        steps = spec.steps.len(),
        dimensions = spec.group_by.len(),
        params = params.len(),
        sql = %sql,
        "Compiled funnel query"
    );
    Ok(CompiledQuery { sql, params, stages })
}

fn resolve_steps<'a, M>(spec: &'a FunnelSpec, metadata: &M) -> Result<Vec<ResolvedStep<'a>>>
where
    M: MetadataResolver + ?Sized,
{
    spec.steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let event_id = metadata
                .resolve_event_name(spec.project_id, &step.event_name)?
                .ok_or_else(|| {
                    FunnelError::InvalidSpec(format!(
                        "step {i}: unknown event {:?}",
                        step.event_name
                    ))
                })?;
            let group = match &step.group {
                Some(name) => Some(metadata.resolve_group(spec.project_id, name)?.ok_or_else(
                    || FunnelError::InvalidSpec(format!("step {i}: unknown group {name:?}")),
                )?),
                None => None,
            };
            Ok(ResolvedStep {
                step,
                event_id,
                group,
            })
        })
        .collect()
}

fn check_dimensions<M>(spec: &FunnelSpec, metadata: &M) -> Result<()>
where
    M: MetadataResolver + ?Sized,
{
    for dim in &spec.group_by {
        if !metadata.property_exists(spec.project_id, dim.entity, &dim.name)? {
            return Err(FunnelError::InvalidDimension(format!(
                "property {:?} is not recorded on any {:?} of project {}",
                dim.name, dim.entity, spec.project_id
            )));
        }
    }
    Ok(())
}

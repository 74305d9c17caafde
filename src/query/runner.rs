use crate::error::Result;
use crate::query::compile::compile;
use crate::query::postprocess::post_process;
use crate::query::result::FunnelReport;
use crate::query::spec::FunnelSpec;
use crate::query::QueryLimits;
use crate::storage::executor::QueryExecutor;
use crate::storage::metadata::MetadataResolver;

/// Compile `spec`, execute it and shape the result into a report.
///
/// Failures are logged together with the funnel that caused them.
pub fn compile_and_run<M, E>(
    spec: &FunnelSpec,
    metadata: &M,
    executor: &E,
    limits: &QueryLimits,
) -> Result<FunnelReport>
where
    M: MetadataResolver + ?Sized,
    E: QueryExecutor + ?Sized,
{
    let run = || {
        let compiled = compile(spec, metadata, limits)?;
        let raw = executor.execute(&compiled.sql, &compiled.params)?;
        tracing::debug!(
            rows = raw.rows.len(),
            columns = raw.headers.len(),
            "Funnel query returned"
        );
        post_process(raw, spec, limits)
    };

    run().inspect_err(|e| {
        if e.is_client_error() {
            tracing::warn!(error = %e, project_id = spec.project_id, "Funnel rejected");
        } else {
            tracing::error!(error = %e, spec = ?spec, "Funnel query failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FunnelError;
    use crate::query::result::{TabularResult, Value};
    use crate::query::spec::{Dimension, Entity, Step, TimeRange, ValueKind};
    use crate::storage::metadata::StaticMetadata;
    use std::cell::RefCell;

    /// Returns a canned result and records what it was asked to run.
    struct FakeExecutor {
        result: TabularResult,
        calls: RefCell<Vec<(String, usize)>>,
    }

    impl FakeExecutor {
        fn new(headers: &[&str], rows: Vec<Vec<Value>>) -> Self {
            Self {
                result: TabularResult::new(
                    headers.iter().map(|h| (*h).to_string()).collect(),
                    rows,
                )
                .unwrap(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl QueryExecutor for FakeExecutor {
        fn execute(&self, sql: &str, params: &[Value]) -> Result<TabularResult> {
            self.calls.borrow_mut().push((sql.to_string(), params.len()));
            Ok(self.result.clone())
        }
    }

    fn spec() -> FunnelSpec {
        FunnelSpec {
            project_id: 1,
            steps: vec![Step::new("signup"), Step::new("purchase")],
            global_user_filters: Vec::new(),
            group_by: Vec::new(),
            session_window: None,
            time_range: TimeRange { from: 0, to: 1000 },
            timezone: "UTC".to_string(),
            step_time: false,
        }
    }

    fn metadata() -> StaticMetadata {
        StaticMetadata::new()
            .with_event(1, "signup", 10)
            .with_event(1, "purchase", 11)
            .with_property(1, Entity::User, "plan")
    }

    #[test]
    fn test_two_step_report() {
        let executor = FakeExecutor::new(&["step_0", "step_1"], vec![vec![Value::Int(2), Value::Int(1)]]);
        let report = compile_and_run(&spec(), &metadata(), &executor, &QueryLimits::default()).unwrap();

        assert_eq!(report.headers, vec!["step_0", "step_1", "step_0_step_1_conv", "overall_conv"]);
        assert_eq!(
            report.rows,
            vec![vec![
                Value::Int(2),
                Value::Int(1),
                Value::from("50.0"),
                Value::from("50.0")
            ]]
        );

        let calls = executor.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.starts_with("WITH step_0 AS ("));
    }

    #[test]
    fn test_grouped_report_is_relabeled() {
        let mut spec = spec();
        spec.group_by = vec![Dimension::user(0, "plan", ValueKind::Categorical)];
        let executor = FakeExecutor::new(
            &["_group_key_0", "step_0", "step_1"],
            vec![
                vec![Value::from("pro"), Value::Int(3), Value::Int(2)],
                vec![Value::from("$no_group"), Value::Int(5), Value::Int(2)],
                vec![Value::from("free"), Value::Int(2), Value::Null],
            ],
        );
        let report = compile_and_run(&spec, &metadata(), &executor, &QueryLimits::default()).unwrap();

        assert_eq!(report.headers[0], "plan");
        assert_eq!(report.rows[0][0], Value::from("$no_group"));
        assert_eq!(report.rows[2][2], Value::Int(0));
    }

    #[test]
    fn test_compile_errors_skip_execution() {
        let mut spec = spec();
        spec.steps.push(Step::new("refund"));
        let executor = FakeExecutor::new(&["step_0"], vec![vec![Value::Int(1)]]);
        let err = compile_and_run(&spec, &metadata(), &executor, &QueryLimits::default()).unwrap_err();

        assert!(matches!(err, FunnelError::InvalidSpec(_)));
        assert!(executor.calls.borrow().is_empty());
    }

    #[test]
    fn test_malformed_counts_surface() {
        let executor = FakeExecutor::new(
            &["step_0", "step_1"],
            vec![vec![Value::from("lots"), Value::Int(1)]],
        );
        let err = compile_and_run(&spec(), &metadata(), &executor, &QueryLimits::default()).unwrap_err();
        assert!(matches!(err, FunnelError::MalformedAggregate(_)));
        assert_eq!(err.status(), "internal_error");
    }
}

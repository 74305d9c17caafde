use duckdb::Connection;
use mallard_funnels::config::Config;
use mallard_funnels::error::{FunnelError, Result};
use mallard_funnels::query::result::FunnelReport;
use mallard_funnels::query::runner::compile_and_run;
use mallard_funnels::query::spec::FunnelSpec;
use mallard_funnels::storage::executor::DuckDbExecutor;
use mallard_funnels::storage::metadata::CatalogMetadata;
use mallard_funnels::storage::migrations;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "usage: mallard-funnels [config.toml] <spec.json>";

fn main() -> ExitCode {
    // Initialize tracing. Logs go to stderr so stdout carries only the report.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mallard_funnels=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, spec_path) = match args.as_slice() {
        [spec] => (None, PathBuf::from(spec)),
        [config, spec] => (Some(PathBuf::from(config)), PathBuf::from(spec)),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(64);
        }
    };
    let config = Config::load(config_path.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return ExitCode::from(2);
        }
    };
    let outcome = runtime.block_on(run(&config, &spec_path));
    // A timed-out query may still hold a blocking thread; do not wait for it.
    runtime.shutdown_background();

    match outcome {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize report");
                ExitCode::from(2)
            }
        },
        Err(e) => {
            let body = serde_json::json!({
                "status": e.status(),
                "error": e.public_message(),
            });
            println!("{body}");
            if e.is_client_error() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn open_database(config: &Config) -> Result<Connection> {
    let conn = match &config.db_path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

async fn run(config: &Config, spec_path: &Path) -> Result<FunnelReport> {
    let json = std::fs::read_to_string(spec_path).map_err(|e| {
        FunnelError::InvalidSpec(format!("cannot read {}: {e}", spec_path.display()))
    })?;
    let spec = FunnelSpec::from_json(&json)?;

    tracing::info!(
        project_id = spec.project_id,
        steps = spec.steps.len(),
        dimensions = spec.group_by.len(),
        db = %config.db_path.as_deref().map_or_else(|| "memory".into(), Path::to_string_lossy),
        "Running funnel"
    );

    let conn = Arc::new(Mutex::new(open_database(config)?));
    let metadata = CatalogMetadata::new(Arc::clone(&conn));
    let executor = DuckDbExecutor::new(conn);
    let limits = config.limits();

    let task = tokio::task::spawn_blocking(move || {
        compile_and_run(&spec, &metadata, &executor, &limits)
    });
    let joined = if config.query_timeout_secs == 0 {
        task.await
    } else {
        let timeout = Duration::from_secs(config.query_timeout_secs);
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(FunnelError::ExecutionFailure(format!(
                    "funnel query timed out after {}s",
                    config.query_timeout_secs
                )))
            }
        }
    };
    joined.map_err(|e| FunnelError::ExecutionFailure(format!("funnel task failed: {e}")))?
}

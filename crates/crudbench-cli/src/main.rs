//! crudbench - cross-database CRUD benchmark runner.

mod args;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crudbench_core::{
    Backend, JsonResultSink, LogSink, MongoBackend, SqlBackend, TestRunner,
};

use args::{Args, CliConfig};

const DEFAULT_FILTER: &str = "crudbench=info,crudbench_core=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting crudbench");

    let config = args.into_config();
    config.bench.validate()?;
    tracing::info!(
        records_per_client = config.bench.records_per_client,
        clients = config.bench.clients,
        batch_size = config.bench.batch_size,
        iterations = config.bench.iterations,
        index = %config.bench.index,
        record_type = %config.bench.record_shape,
        "configuration loaded"
    );

    let backends = connect_backends(&config).await;
    if backends.is_empty() {
        return Err("no backend could be connected".into());
    }

    let runner = TestRunner::new(config.bench.clone(), backends)?;
    let mut runner = match &config.results_dir {
        Some(dir) => {
            let sink = JsonResultSink::new(dir);
            tracing::info!(path = %sink.root().display(), "writing results");
            runner.with_sink(sink)
        }
        None => runner.with_sink(LogSink),
    };

    let report = runner.run().await;
    runner.close().await;

    tracing::info!(results = report.len(), "benchmark complete");
    Ok(())
}

/// Connect every configured backend, skipping the ones that fail.
async fn connect_backends(config: &CliConfig) -> Vec<Arc<dyn Backend>> {
    let shape = config.bench.record_shape;
    let retry = config.bench.retry;
    let mut backends: Vec<Arc<dyn Backend>> = Vec::new();

    if let Some(mysql) = &config.mysql {
        match SqlBackend::connect(mysql, shape, retry).await {
            Ok(backend) => backends.push(Arc::new(backend)),
            Err(e) => tracing::error!(error = %e, "could not connect to MySQL"),
        }
    }

    if let Some(mongo) = &config.mongo {
        match MongoBackend::connect(mongo, shape, retry).await {
            Ok(backend) => backends.push(Arc::new(backend)),
            Err(e) => tracing::error!(error = %e, "could not connect to MongoDB"),
        }
    }

    if let Some(sqlite) = &config.sqlite {
        match SqlBackend::connect(sqlite, shape, retry).await {
            Ok(backend) => backends.push(Arc::new(backend)),
            Err(e) => tracing::error!(error = %e, "could not open SQLite"),
        }
    }

    backends
}

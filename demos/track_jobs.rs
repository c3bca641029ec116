//! Minimal job tracker running against the in-memory store.
//!
//! This demo records a handful of jobs the way a worker would, then
//! answers a few questions about them. Run with `RUST_LOG=jobstatus=debug`
//! to see every transition.

use jobstatus::{Config, Status, StatusResult, Tracker};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Pretend to run a job: report progress, then finish one way or another.
async fn run_job(status: &mut Status, steps: u32, fail_at: Option<u32>) -> StatusResult<()> {
    status.queued().await?.started().await?;
    for step in 1..=steps {
        if fail_at == Some(step) {
            status.add_error(json!({"step": step, "message": "upstream timed out"})).await?;
            status.failed().await?;
            return Ok(());
        }
        status.set_progress(f64::from(step), Some(f64::from(steps))).await?;
    }
    status.save(json!({"rows": steps * 100})).await?;
    status.succeeded().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let tracker = Tracker::in_memory(Config::default());
    println!("Namespace: {}", tracker.config().namespace);
    println!();

    // Record some jobs
    for (n, fail_at) in [(1, None), (2, Some(2)), (3, None)] {
        let mut status = tracker.create_with_id(&format!("import-{n}")).await?;
        status.set_job_name("import").await?;
        status.set_job_args([("file", format!("batch-{n}.csv"))]).await?;
        run_job(&mut status, 4, fail_at).await?;
    }
    let mut pending = tracker.create_with_id("export-1").await?;
    pending.set_job_name("export").await?;
    pending.queued().await?;

    // Retry the failed one
    let mut retry = tracker.find("import-2").await?.ok_or("import-2 vanished")?;
    run_job(&mut retry, 4, None).await?;
    println!("import-2 attempt: {} ({} archived)", retry.attempt(), retry.prior_attempts().await?.len());

    // Queries
    let completed = tracker.where_("state", json!("completed"))?;
    println!("Completed: {:?}", completed.ids().await?);

    let imports = tracker
        .where_("job_name", json!("import"))?
        .where_("succeeded_at", json!({"after": null, "before": null}))?;
    println!("Imports succeeded: {}", imports.count().await?);

    let by_arg = tracker.where_("job_arg", json!("batch-3.csv"))?;
    println!("Job for batch-3.csv: {:?}", by_arg.ids().await?);

    println!("Incomplete: {:?}", tracker.where_("state", json!("incomplete"))?.ids().await?);
    println!();

    // Kill whatever is still pending, clean up everything that finished
    tracker.where_("state", json!("incomplete"))?.request_kill().await?;
    let pending = tracker.find("export-1").await?.ok_or("export-1 vanished")?;
    println!("export-1 kill requested: {}", pending.kill_requested());

    completed.delete().await?;
    println!("Remaining: {}", tracker.all().count().await?);

    tracker.close();
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use jobrun::context::{BasicSession, Locale, Subject, ambient};
use jobrun::{
    BlockingCondition, JobDescriptor, JobError, JobScheduler, RunContext, SchedulerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SchedulerConfig::from_env()?;
    eprintln!("jobrun v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Scheduler: {}", config.name);
    eprintln!("   Max concurrent jobs: {}", config.max_concurrent_jobs);
    eprintln!("   Shutdown grace: {:?}\n", config.shutdown_grace);

    let scheduler = JobScheduler::new(config);

    let session = BasicSession::new("demo-session")
        .with_subject(Subject::new("operator"))
        .with_locale(Locale::new("en-GB"))
        .shared();
    let context = RunContext::empty()
        .with_session(Some(Arc::clone(&session)))
        .with_property("tenant", "acme");

    // Inline job with a nested inline job.
    let nested = scheduler.clone();
    let greeting = scheduler
        .run_now(
            JobDescriptor::new("greet").with_id(1).with_context(context.clone()),
            async move {
                let who = ambient::subject().map(|s| s.name().to_string());
                let locale = nested
                    .run_now(
                        JobDescriptor::new("lookup-locale").with_context(RunContext::copy_current()),
                        async { Ok(ambient::locale().map(|l| l.tag().to_string())) },
                    )
                    .await?;
                Ok(format!("hello {who:?} in {locale:?}"))
            },
        )
        .await?;
    tracing::info!(%greeting, "Inline job finished");

    // Two queued jobs on the same session; the first parks on a condition
    // and lets the second through.
    let approval = BlockingCondition::new("approval", true);
    let gate = approval.clone();
    let first = scheduler.schedule(
        JobDescriptor::new("await-approval").with_id(2).with_context(context.clone()),
        async move {
            gate.wait(Some(Duration::from_secs(5))).await?;
            Ok("approved")
        },
    )?;
    let second = scheduler.schedule(
        JobDescriptor::new("housekeeping").with_id(3).with_context(context.clone()),
        async { Ok("cleaned") },
    )?;
    tracing::info!(result = second.join().await?, "Second job ran while the first waited");
    approval.set_blocking(false);
    tracing::info!(result = first.join().await?, "First job resumed");

    // A long job cancelled by id.
    let long = scheduler.schedule(
        JobDescriptor::new("long-export").with_id(4).with_context(context),
        async {
            if let Some(monitor) = ambient::monitor() {
                monitor.cancelled().await;
            }
            Err::<(), _>(JobError::Cancelled)
        },
    )?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled = scheduler.cancel(4, Some(session.id()));
    tracing::info!(cancelled, outcome = ?long.join().await.err(), "Cancel by id");

    scheduler.shutdown().await;
    Ok(())
}

//! Core decorators of the propagation chain.
//!
//! Outermost first: job identity, run monitor, job span, request values,
//! request handles, session, locale, texts, transaction, subject,
//! transaction boundary, completion, exception translation. Inner
//! decorators read what outer ones installed (locale, texts and subject
//! fall back to the installed session), so the order must not change.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::Instrument;

use super::{Decorator, JobFuture};
use crate::context::{ambient, Locale, RequestHandles, RunContext, Session, Subject};
use crate::error::{panic_message, JobError};
use crate::job::{JobInfo, JobOutcome};
use crate::monitor::RunMonitor;
use crate::transaction::{Transaction, TransactionBoundary};

/// Names of the core decorators, outermost first.
pub const CORE_ORDER: [&str; 13] = [
    "job_identity",
    "run_monitor",
    "job_span",
    "request_values",
    "request_handles",
    "session",
    "locale",
    "texts",
    "transaction",
    "subject",
    "transaction_boundary",
    "completion",
    "exception_translation",
];

/// Everything the core decorators install.
pub(crate) struct ChainSetup {
    pub job: Arc<JobInfo>,
    pub monitor: RunMonitor,
    pub context: RunContext,
    pub boundary: TransactionBoundary,
}

/// Build the core sequence for one job.
pub(crate) fn core<T: Send + 'static>(setup: ChainSetup) -> Vec<Decorator<T>> {
    let ChainSetup {
        job,
        monitor,
        context,
        boundary,
    } = setup;

    vec![
        job_identity(Arc::clone(&job)),
        run_monitor(monitor),
        job_span(&job),
        request_values(&context),
        request_handles(context.request().cloned()),
        session(context.session().cloned()),
        locale(context.locale().cloned()),
        texts(),
        transaction(context.transaction().cloned()),
        subject(context.subject().cloned()),
        transaction_boundary(boundary),
        completion(job),
        exception_translation(),
    ]
}

fn job_identity<T: Send + 'static>(job: Arc<JobInfo>) -> Decorator<T> {
    Decorator::new("job_identity", move |inner: JobFuture<T>| {
        ambient::scope_job(job, inner).boxed()
    })
}

fn run_monitor<T: Send + 'static>(monitor: RunMonitor) -> Decorator<T> {
    Decorator::new("run_monitor", move |inner: JobFuture<T>| {
        ambient::scope_monitor(monitor, inner).boxed()
    })
}

fn job_span<T: Send + 'static>(job: &JobInfo) -> Decorator<T> {
    let span = tracing::info_span!(
        "job",
        job_id = job.id(),
        job_name = %job.name(),
        session_id = job.session_id(),
        correlation_id = job.correlation_id(),
    );
    Decorator::new("job_span", move |inner: JobFuture<T>| inner.instrument(span).boxed())
}

fn request_values<T: Send + 'static>(context: &RunContext) -> Decorator<T> {
    let properties = context.properties().clone();
    let correlation_id = context.correlation_id().map(str::to_string);
    let user_agent = context.user_agent().map(str::to_string);
    let node_id = context.notification_node_id().map(str::to_string);
    Decorator::new("request_values", move |inner: JobFuture<T>| {
        ambient::scope_request_values(properties, correlation_id, user_agent, node_id, inner).boxed()
    })
}

fn request_handles<T: Send + 'static>(request: Option<RequestHandles>) -> Decorator<T> {
    Decorator::new("request_handles", move |inner: JobFuture<T>| {
        ambient::scope_request(request, inner).boxed()
    })
}

fn session<T: Send + 'static>(session: Option<Arc<dyn Session>>) -> Decorator<T> {
    Decorator::new("session", move |inner: JobFuture<T>| {
        ambient::scope_session(session, inner).boxed()
    })
}

fn locale<T: Send + 'static>(locale: Option<Locale>) -> Decorator<T> {
    Decorator::new("locale", move |inner: JobFuture<T>| {
        async move {
            let locale = locale.or_else(|| ambient::session().and_then(|s| s.locale()));
            ambient::scope_locale(locale, inner).await
        }
        .boxed()
    })
}

fn texts<T: Send + 'static>() -> Decorator<T> {
    Decorator::new("texts", |inner: JobFuture<T>| {
        async move {
            let texts = ambient::session().and_then(|s| s.texts());
            ambient::scope_texts(texts, inner).await
        }
        .boxed()
    })
}

fn transaction<T: Send + 'static>(transaction: Option<Arc<dyn Transaction>>) -> Decorator<T> {
    Decorator::new("transaction", move |inner: JobFuture<T>| {
        ambient::scope_transaction(transaction, inner).boxed()
    })
}

fn subject<T: Send + 'static>(subject: Option<Subject>) -> Decorator<T> {
    Decorator::new("subject", move |inner: JobFuture<T>| {
        async move {
            let subject = subject.or_else(|| ambient::session().and_then(|s| s.subject()));
            ambient::scope_subject(subject, inner).await
        }
        .boxed()
    })
}

fn transaction_boundary<T: Send + 'static>(boundary: TransactionBoundary) -> Decorator<T> {
    Decorator::new("transaction_boundary", move |inner: JobFuture<T>| {
        async move { boundary.run(inner).await }.boxed()
    })
}

fn completion<T: Send + 'static>(job: Arc<JobInfo>) -> Decorator<T> {
    Decorator::new("completion", move |inner: JobFuture<T>| {
        async move {
            let result = inner.await;
            job.record_outcome(JobOutcome::from_result(&result));
            result
        }
        .boxed()
    })
}

fn exception_translation<T: Send + 'static>() -> Decorator<T> {
    Decorator::new("exception_translation", |inner: JobFuture<T>| {
        async move {
            match AssertUnwindSafe(inner).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(panic = %message, "Job panicked");
                    Err(JobError::Panicked(message))
                }
            }
        }
        .boxed()
    })
}

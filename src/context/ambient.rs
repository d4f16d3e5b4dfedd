//! Ambient execution state of the running job.
//!
//! Each propagated field lives in its own task-local slot. Values are only
//! installed by the propagation chain, through `LocalKey::scope`, so the prior
//! value comes back on every exit path. Application code reads them through
//! the accessors below; to change one it submits a nested job with a modified
//! `RunContext`.

use std::future::Future;
use std::sync::Arc;

use crate::context::{Locale, PropertyMap, RequestHandles, Session, Subject, TextBundle};
use crate::job::JobInfo;
use crate::monitor::RunMonitor;
use crate::transaction::Transaction;

tokio::task_local! {
    static JOB: Arc<JobInfo>;
    static MONITOR: RunMonitor;
    static PROPERTIES: PropertyMap;
    static CORRELATION_ID: Option<String>;
    static USER_AGENT: Option<String>;
    static NOTIFICATION_NODE: Option<String>;
    static REQUEST: Option<RequestHandles>;
    static SESSION: Option<Arc<dyn Session>>;
    static LOCALE: Option<Locale>;
    static TEXTS: Option<Arc<dyn TextBundle>>;
    static TRANSACTION: Option<Arc<dyn Transaction>>;
    static SUBJECT: Option<Subject>;
}

/// The job currently executing, if any.
pub fn job() -> Option<Arc<JobInfo>> {
    JOB.try_with(Arc::clone).ok()
}

/// The run monitor of the job currently executing, if any.
pub fn monitor() -> Option<RunMonitor> {
    MONITOR.try_with(RunMonitor::clone).ok()
}

pub fn properties() -> PropertyMap {
    PROPERTIES.try_with(PropertyMap::clone).unwrap_or_default()
}

pub fn correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok().flatten()
}

pub fn user_agent() -> Option<String> {
    USER_AGENT.try_with(Clone::clone).ok().flatten()
}

pub fn notification_node_id() -> Option<String> {
    NOTIFICATION_NODE.try_with(Clone::clone).ok().flatten()
}

pub fn request() -> Option<RequestHandles> {
    REQUEST.try_with(Clone::clone).ok().flatten()
}

pub fn session() -> Option<Arc<dyn Session>> {
    SESSION.try_with(Clone::clone).ok().flatten()
}

pub fn locale() -> Option<Locale> {
    LOCALE.try_with(Clone::clone).ok().flatten()
}

pub fn texts() -> Option<Arc<dyn TextBundle>> {
    TEXTS.try_with(Clone::clone).ok().flatten()
}

/// The ambient transaction, if the current call runs inside one.
pub fn transaction() -> Option<Arc<dyn Transaction>> {
    TRANSACTION.try_with(Clone::clone).ok().flatten()
}

pub fn subject() -> Option<Subject> {
    SUBJECT.try_with(Clone::clone).ok().flatten()
}

pub(crate) fn scope_job<F: Future>(
    job: Arc<JobInfo>,
    f: F,
) -> impl Future<Output = F::Output> {
    JOB.scope(job, f)
}

pub(crate) fn scope_monitor<F: Future>(
    monitor: RunMonitor,
    f: F,
) -> impl Future<Output = F::Output> {
    MONITOR.scope(monitor, f)
}

/// Installs the request-scoped values (properties, correlation id, user agent,
/// notification node) as one unit.
pub(crate) async fn scope_request_values<F: Future>(
    properties: PropertyMap,
    correlation_id: Option<String>,
    user_agent: Option<String>,
    notification_node_id: Option<String>,
    f: F,
) -> F::Output {
    PROPERTIES
        .scope(
            properties,
            CORRELATION_ID.scope(
                correlation_id,
                USER_AGENT.scope(user_agent, NOTIFICATION_NODE.scope(notification_node_id, f)),
            ),
        )
        .await
}

pub(crate) fn scope_request<F: Future>(
    request: Option<RequestHandles>,
    f: F,
) -> impl Future<Output = F::Output> {
    REQUEST.scope(request, f)
}

pub(crate) fn scope_session<F: Future>(
    session: Option<Arc<dyn Session>>,
    f: F,
) -> impl Future<Output = F::Output> {
    SESSION.scope(session, f)
}

pub(crate) fn scope_locale<F: Future>(
    locale: Option<Locale>,
    f: F,
) -> impl Future<Output = F::Output> {
    LOCALE.scope(locale, f)
}

pub(crate) fn scope_texts<F: Future>(
    texts: Option<Arc<dyn TextBundle>>,
    f: F,
) -> impl Future<Output = F::Output> {
    TEXTS.scope(texts, f)
}

pub(crate) fn scope_transaction<F: Future>(
    transaction: Option<Arc<dyn Transaction>>,
    f: F,
) -> impl Future<Output = F::Output> {
    TRANSACTION.scope(transaction, f)
}

pub(crate) fn scope_subject<F: Future>(
    subject: Option<Subject>,
    f: F,
) -> impl Future<Output = F::Output> {
    SUBJECT.scope(subject, f)
}

//! Run context: immutable snapshot of the ambient state a job runs with.
//!
//! Core components:
//! - `session`: Session, identity, locale and request-handle types
//! - `properties`: Request-scoped property map
//! - `ambient`: Task-local slots the propagation chain installs values into

pub mod ambient;
pub mod properties;
pub mod session;

use std::fmt;
use std::sync::Arc;

use crate::transaction::{Transaction, TransactionFactory, TransactionMember, TransactionScope};

pub use properties::PropertyMap;
pub use session::{
    BasicSession, Locale, MapTextBundle, RequestHandles, Session, Subject, TextBundle,
};

/// Snapshot of the state a unit of work runs with.
///
/// Built once and never mutated while shared: every `with_*` method consumes
/// the context and returns the modified copy, so `ctx.clone().with_locale(..)`
/// derives a new context without touching `ctx`.
#[derive(Clone, Default)]
pub struct RunContext {
    session: Option<Arc<dyn Session>>,
    subject: Option<Subject>,
    locale: Option<Locale>,
    user_agent: Option<String>,
    notification_node_id: Option<String>,
    correlation_id: Option<String>,
    properties: PropertyMap,
    request: Option<RequestHandles>,
    transaction_scope: TransactionScope,
    transaction: Option<Arc<dyn Transaction>>,
    transaction_factory: Option<Arc<dyn TransactionFactory>>,
    transaction_members: Vec<Arc<dyn TransactionMember>>,
}

impl RunContext {
    /// A context with every field unset and `REQUIRED` transaction scope.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture the live ambient values of the calling job.
    ///
    /// Use this when handing work to another task. Transaction scope, factory
    /// and members are not ambient and start out at their defaults.
    pub fn copy_current() -> Self {
        Self {
            session: ambient::session(),
            subject: ambient::subject(),
            locale: ambient::locale(),
            user_agent: ambient::user_agent(),
            notification_node_id: ambient::notification_node_id(),
            correlation_id: ambient::correlation_id(),
            properties: ambient::properties(),
            request: ambient::request(),
            transaction_scope: TransactionScope::default(),
            transaction: ambient::transaction(),
            transaction_factory: None,
            transaction_members: Vec::new(),
        }
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref().map(|session| session.id())
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    pub fn locale(&self) -> Option<&Locale> {
        self.locale.as_ref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn notification_node_id(&self) -> Option<&str> {
        self.notification_node_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn request(&self) -> Option<&RequestHandles> {
        self.request.as_ref()
    }

    pub fn transaction_scope(&self) -> TransactionScope {
        self.transaction_scope
    }

    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }

    pub fn transaction_factory(&self) -> Option<&Arc<dyn TransactionFactory>> {
        self.transaction_factory.as_ref()
    }

    pub fn transaction_members(&self) -> &[Arc<dyn TransactionMember>] {
        &self.transaction_members
    }

    pub fn with_session(mut self, session: Option<Arc<dyn Session>>) -> Self {
        self.session = session;
        self
    }

    pub fn with_subject(mut self, subject: Option<Subject>) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_locale(mut self, locale: Option<Locale>) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_notification_node_id(mut self, node_id: Option<String>) -> Self {
        self.notification_node_id = node_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.properties = self.properties.with(key, value);
        self
    }

    pub fn with_properties(mut self, properties: PropertyMap) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_request(mut self, request: Option<RequestHandles>) -> Self {
        self.request = request;
        self
    }

    pub fn with_transaction_scope(mut self, scope: TransactionScope) -> Self {
        self.transaction_scope = scope;
        self
    }

    /// Transaction to join under `REQUIRED`/`MANDATORY`. A boundary never
    /// completes a transaction it did not create.
    pub fn with_transaction(mut self, transaction: Option<Arc<dyn Transaction>>) -> Self {
        self.transaction = transaction;
        self
    }

    /// Factory used instead of the scheduler default when a boundary starts a
    /// new transaction.
    pub fn with_transaction_factory(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.transaction_factory = Some(factory);
        self
    }

    /// Member registered into the transaction this context's boundary starts.
    /// Only legal when the boundary starts a new transaction.
    pub fn with_transaction_member(mut self, member: Arc<dyn TransactionMember>) -> Self {
        self.transaction_members.push(member);
        self
    }

    pub fn without_transaction_members(mut self) -> Self {
        self.transaction_members.clear();
        self
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("session", &self.session_id())
            .field("subject", &self.subject)
            .field("locale", &self.locale)
            .field("correlation_id", &self.correlation_id)
            .field("properties", &self.properties.len())
            .field("transaction_scope", &self.transaction_scope)
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .field("transaction_members", &self.transaction_members.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::BasicTransaction;

    #[test]
    fn empty_has_no_values() {
        let ctx = RunContext::empty();
        assert!(ctx.session().is_none());
        assert!(ctx.subject().is_none());
        assert!(ctx.locale().is_none());
        assert!(ctx.correlation_id().is_none());
        assert!(ctx.transaction().is_none());
        assert!(ctx.properties().is_empty());
        assert_eq!(ctx.transaction_scope(), TransactionScope::Required);
    }

    #[test]
    fn derive_does_not_touch_original() {
        let base = RunContext::empty().with_locale(Some(Locale::new("en-GB")));
        let derived = base
            .clone()
            .with_locale(Some(Locale::new("de-CH")))
            .with_property("k", "v");

        assert_eq!(base.locale().unwrap().tag(), "en-GB");
        assert!(base.properties().is_empty());
        assert_eq!(derived.locale().unwrap().tag(), "de-CH");
        assert!(derived.properties().contains("k"));
    }

    #[tokio::test]
    async fn copy_current_captures_ambient_values() {
        let session = BasicSession::new("s-7").shared();
        let tx: Arc<dyn Transaction> = Arc::new(BasicTransaction::new());
        let tx_id = tx.id();

        let copied = ambient::scope_session(
            Some(session),
            ambient::scope_transaction(Some(tx), async {
                ambient::scope_locale(Some(Locale::new("it-CH")), async {
                    RunContext::copy_current()
                })
                .await
            }),
        )
        .await;

        assert_eq!(copied.session_id(), Some("s-7"));
        assert_eq!(copied.locale().unwrap().tag(), "it-CH");
        assert_eq!(copied.transaction().unwrap().id(), tx_id);
        assert_eq!(copied.transaction_scope(), TransactionScope::Required);
    }

    #[test]
    fn copy_current_outside_a_job_is_empty() {
        let ctx = RunContext::copy_current();
        assert!(ctx.session().is_none());
        assert!(ctx.transaction().is_none());
    }
}

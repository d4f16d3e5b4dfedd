//! Job descriptor: identity, serialization key and context of a submission.

use std::fmt;
use std::sync::Arc;

use crate::chain::ChainExtension;
use crate::context::RunContext;
use crate::monitor::RunMonitor;
use crate::transaction::TransactionScope;

/// Identity used to serialize scheduled jobs. Jobs with equal keys run their
/// bodies one at a time, or up to the key's permit count if it was raised
/// with `JobScheduler::set_permits`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutexKey {
    /// All jobs of one session.
    Session(String),
    /// An application-chosen key.
    Named(String),
}

impl MutexKey {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::Session(session_id.into())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl fmt::Display for MutexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Named(name) => write!(f, "named:{name}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum MutexPolicy {
    /// Serialize on the session of the job's context, if it has one.
    #[default]
    Session,
    Key(MutexKey),
    Unserialized,
}

/// Everything the scheduler needs to know about one submission besides the
/// unit of work itself.
#[derive(Clone)]
pub struct JobDescriptor {
    id: u64,
    name: String,
    mutex: MutexPolicy,
    session_required: bool,
    context: RunContext,
    parent_monitor: Option<RunMonitor>,
    extensions: Vec<Arc<dyn ChainExtension>>,
}

impl JobDescriptor {
    /// Descriptor with id 0 (not cancellable by id), an empty context, the
    /// session as mutex key, and a required session.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            mutex: MutexPolicy::Session,
            session_required: true,
            context: RunContext::empty(),
            parent_monitor: None,
            extensions: Vec::new(),
        }
    }

    /// Positive ids make the job reachable through cancel-by-id. Ids need not
    /// be unique.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_transaction_scope(mut self, scope: TransactionScope) -> Self {
        self.context = self.context.with_transaction_scope(scope);
        self
    }

    pub fn with_mutex(mut self, key: MutexKey) -> Self {
        self.mutex = MutexPolicy::Key(key);
        self
    }

    /// Run without serialization, even if the context carries a session.
    pub fn without_mutex(mut self) -> Self {
        self.mutex = MutexPolicy::Unserialized;
        self
    }

    /// Opt out of the session check.
    pub fn with_session_required(mut self, required: bool) -> Self {
        self.session_required = required;
        self
    }

    /// Link a scheduled job to a monitor so cancelling that monitor cascades
    /// into the job. Inline jobs always link to the caller's monitor.
    pub fn with_parent_monitor(mut self, monitor: RunMonitor) -> Self {
        self.parent_monitor = Some(monitor);
        self
    }

    pub fn with_extension(mut self, extension: Arc<dyn ChainExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn session_required(&self) -> bool {
        self.session_required
    }

    pub fn parent_monitor(&self) -> Option<&RunMonitor> {
        self.parent_monitor.as_ref()
    }

    pub fn extensions(&self) -> &[Arc<dyn ChainExtension>] {
        &self.extensions
    }

    /// The key this job serializes on, if any.
    pub fn mutex_key(&self) -> Option<MutexKey> {
        match &self.mutex {
            MutexPolicy::Session => self.context.session_id().map(MutexKey::session),
            MutexPolicy::Key(key) => Some(key.clone()),
            MutexPolicy::Unserialized => None,
        }
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mutex", &self.mutex_key())
            .field("session_required", &self.session_required)
            .field("context", &self.context)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

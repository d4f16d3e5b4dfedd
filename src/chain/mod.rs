//! Propagation chain: ordered wrappers that install ambient state around a job.
//!
//! Core components:
//! - `Decorator`: One named wrapper around the inner future
//! - `PropagationChain`: Fixed core sequence plus spliced extensions
//! - `ChainExtension`: Type-erased wrapper callers can splice in
//! - `decorators`: The core wrappers, outermost first

pub mod decorators;

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{JobError, Result};

/// The future a decorator wraps and returns.
pub type JobFuture<T> = BoxFuture<'static, Result<T>>;

type Wrap<T> = Box<dyn FnOnce(JobFuture<T>) -> JobFuture<T> + Send>;

/// A named wrapper around the rest of the chain.
pub struct Decorator<T> {
    name: Cow<'static, str>,
    wrap: Wrap<T>,
}

impl<T> Decorator<T> {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        wrap: impl FnOnce(JobFuture<T>) -> JobFuture<T> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            wrap: Box::new(wrap),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> fmt::Debug for Decorator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Decorator").field(&self.name).finish()
    }
}

/// Ordered composition of decorators around a unit of work.
///
/// The call order is `before` extensions, then the core sequence, then
/// `after` extensions, then the unit. Extensions never change the relative
/// order of the core decorators.
pub struct PropagationChain<T> {
    before: Vec<Decorator<T>>,
    core: Vec<Decorator<T>>,
    after: Vec<Decorator<T>>,
}

impl<T: Send + 'static> PropagationChain<T> {
    pub(crate) fn new(core: Vec<Decorator<T>>) -> Self {
        Self {
            before: Vec::new(),
            core,
            after: Vec::new(),
        }
    }

    /// Splice a decorator immediately before (outside) the core sequence.
    /// Later calls land closer to the core.
    pub fn before(mut self, decorator: Decorator<T>) -> Self {
        self.before.push(decorator);
        self
    }

    /// Splice a decorator immediately after (inside) the core sequence.
    pub fn after(mut self, decorator: Decorator<T>) -> Self {
        self.after.push(decorator);
        self
    }

    pub(crate) fn extend(self, extension: &Arc<dyn ChainExtension>) -> Self {
        let decorator = erase(Arc::clone(extension));
        match extension.position() {
            ExtensionPosition::Before => self.before(decorator),
            ExtensionPosition::After => self.after(decorator),
        }
    }

    /// Decorator names, outermost first.
    pub fn names(&self) -> Vec<&str> {
        self.decorators().map(Decorator::name).collect()
    }

    fn decorators(&self) -> impl Iterator<Item = &Decorator<T>> {
        self.before.iter().chain(&self.core).chain(&self.after)
    }

    /// Compose the chain around `unit` into one future.
    pub fn call<F>(self, unit: F) -> JobFuture<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.before
            .into_iter()
            .chain(self.core)
            .chain(self.after)
            .rev()
            .fold(unit.boxed(), |inner, decorator| (decorator.wrap)(inner))
    }
}

/// Where an extension is spliced relative to the core sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtensionPosition {
    #[default]
    Before,
    After,
}

/// Wrapper registered on a scheduler or descriptor, independent of the
/// job's result type.
///
/// `around` receives the rest of the chain as a future and must drive it to
/// completion for the job to produce a result.
pub trait ChainExtension: Send + Sync {
    fn name(&self) -> &str;

    fn position(&self) -> ExtensionPosition {
        ExtensionPosition::Before
    }

    fn around(&self, inner: BoxFuture<'static, ()>) -> BoxFuture<'static, ()>;
}

/// Turn a type-erased extension into a typed decorator. The inner result
/// travels through a side slot.
fn erase<T: Send + 'static>(extension: Arc<dyn ChainExtension>) -> Decorator<T> {
    let name = extension.name().to_string();
    Decorator::new(name.clone(), move |inner: JobFuture<T>| {
        async move {
            let slot = Arc::new(Mutex::new(None));
            let writer = Arc::clone(&slot);
            extension
                .around(
                    async move {
                        let result = inner.await;
                        *writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                    }
                    .boxed(),
                )
                .await;
            let result = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            result.unwrap_or_else(|| {
                Err(JobError::contract(format!(
                    "chain extension {name} did not run the job"
                )))
            })
        }
        .boxed()
    })
}

//! ProcessorBuilder - wiring and start-up validation.
//!
//! Fail-fast: an invalid config or an empty handler set is rejected by
//! `build()`, before any task can be submitted.

use std::future::Future;
use std::sync::Arc;

use super::Processor;
use crate::config::ProcessorConfig;
use crate::domain::{Decider, DefaultDecider, Payload, TaskType};
use crate::engine::Engine;
use crate::error::{ProcessorError, Result, TaskError};
use crate::observability::Counters;
use crate::ports::{Clock, SystemClock};
use crate::queue::{RetryScheduler, WorkQueue};
use crate::registry::TaskRegistry;
use crate::results::ResultStore;
use crate::runtime::{FnHandler, HandlerRegistry, Runtime, TaskContext, TaskHandler};

/// Builds a [`Processor`].
///
/// # Example
/// ```ignore
/// let processor = Processor::builder()
///     .config(config)
///     .handler("resize", ResizeHandler)?
///     .handler_fn("echo", |ctx| async move { Ok(ctx.payload) })?
///     .build()?;
/// processor.start()?;
/// ```
pub struct ProcessorBuilder {
    config: ProcessorConfig,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn Decider>>,
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self {
            config: ProcessorConfig::default(),
            handlers: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
            decider: None,
        }
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the handler for `task_type`. A type can only be registered once.
    pub fn handler(
        mut self,
        task_type: impl Into<TaskType>,
        handler: impl TaskHandler,
    ) -> Result<Self> {
        self.handlers.register(task_type.into(), Arc::new(handler))?;
        Ok(self)
    }

    /// Closure shorthand for [`handler`](Self::handler).
    pub fn handler_fn<F, Fut>(self, task_type: impl Into<TaskType>, f: F) -> Result<Self>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Payload, TaskError>> + Send + 'static,
    {
        self.handler(task_type, FnHandler::new(f))
    }

    /// Handler for task types without a dedicated one.
    pub fn fallback(mut self, handler: impl TaskHandler) -> Self {
        self.handlers.set_fallback(Arc::new(handler));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default retry decision.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> Result<Processor> {
        self.config.validate()?;
        if self.handlers.is_empty() {
            return Err(ProcessorError::NoHandlers);
        }

        let config = self.config;
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(config.retry_policy())));
        let queue = Arc::new(WorkQueue::new(config.queue_capacity));

        let engine = Engine {
            registry: TaskRegistry::new(self.clock),
            scheduler: Arc::new(RetryScheduler::new(Arc::clone(&queue))),
            queue,
            results: ResultStore::new(),
            runtime: Runtime::new(Arc::new(self.handlers), config.task_timeout()),
            decider,
            counters: Counters::default(),
            poll_interval: config.poll_interval(),
        };
        Ok(Processor::from_engine(engine, config))
    }
}

impl Default for ProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

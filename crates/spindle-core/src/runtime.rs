use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};

use crate::domain::{ErrorKind, Payload, Task, TaskFailure, TaskId, TaskType};
use crate::error::{ProcessorError, TaskError, TaskErrorKind};

/// What a handler sees of the task it executes.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: Payload,
    /// 1 for the first run, 2 for the first retry, ...
    pub attempt: u32,
}

impl TaskContext {
    fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            attempt: task.attempts,
        }
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, TaskError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// The task body.
///
/// Takes an owned context so it can run on its own tokio task.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: TaskContext) -> Result<Payload, TaskError>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, TaskError>> + Send + 'static,
    {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, TaskError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> Result<Payload, TaskError> {
        (self.f)(ctx).await
    }
}

/// Registry of handlers (task_type -> handler), plus an optional fallback.
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. Registering a type twice is an error.
    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), ProcessorError> {
        if self.handlers.contains_key(&task_type) {
            return Err(ProcessorError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Handler for every task type without a dedicated one.
    pub fn set_fallback(&mut self, handler: Arc<dyn TaskHandler>) {
        self.fallback = Some(handler);
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).or(self.fallback.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len() + usize::from(self.fallback.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one handler invocation.
#[derive(Debug)]
pub struct Execution {
    pub outcome: Result<Payload, TaskFailure>,
    pub duration: Duration,
}

/// Runtime executes a task by dispatching to a registered handler.
///
/// This is the single point where task-body errors, panics and timeouts are
/// turned into data; nothing escapes into the calling worker.
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
    timeout: Option<Duration>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>, timeout: Option<Duration>) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one attempt of `task`.
    pub async fn execute(&self, task: &Task) -> Execution {
        let started = Instant::now();
        let outcome = self.run(task).await;
        Execution {
            outcome,
            duration: started.elapsed(),
        }
    }

    async fn run(&self, task: &Task) -> Result<Payload, TaskFailure> {
        let failure = |kind, message: String| TaskFailure::new(kind, message, task.retry_count);

        let Some(handler) = self.registry.get(&task.task_type).cloned() else {
            return Err(failure(
                ErrorKind::HandlerNotFound,
                format!("handler not found for task_type={}", task.task_type),
            ));
        };

        // 別タスクで実行: panic は JoinError になり worker までは巻き戻らない
        let ctx = TaskContext::from_task(task);
        let body = AbortOnDrop::new(tokio::spawn(async move { handler.handle(ctx).await }));

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(joined) => joined,
                // dropping `body` aborts the handler task
                Err(_) => {
                    return Err(failure(
                        ErrorKind::Timeout,
                        format!("timed out after {limit:?}"),
                    ));
                }
            },
            None => body.await,
        };

        match joined {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => {
                let kind = match e.kind {
                    TaskErrorKind::Transient => ErrorKind::Execution,
                    TaskErrorKind::Permanent => ErrorKind::Permanent,
                };
                Err(failure(kind, e.message))
            }
            Err(join_err) => Err(failure(ErrorKind::Panic, panic_message(join_err))),
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("task body aborted: {err}");
    }
    let panic = err.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task body panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task body panicked: {s}")
    } else {
        "task body panicked".to_string()
    }
}

/// JoinHandle that aborts its task when dropped.
///
/// Used so that a worker being force-stopped also stops whatever it spawned.
pub(crate) struct AbortOnDrop<T> {
    handle: JoinHandle<T>,
}

impl<T> AbortOnDrop<T> {
    pub(crate) fn new(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, ctx: TaskContext) -> Result<Payload, TaskError> {
            Ok(json!({ "task_id": ctx.task_id, "attempt": ctx.attempt }))
        }
    }

    fn runtime_with(
        task_type: &str,
        handler: Arc<dyn TaskHandler>,
        timeout: Option<Duration>,
    ) -> Runtime {
        let mut reg = HandlerRegistry::new();
        reg.register(TaskType::new(task_type), handler).unwrap();
        Runtime::new(Arc::new(reg), timeout)
    }

    fn claimed(task_type: &str) -> Task {
        let mut task = Task::new(json!({"n": 1})).with_id("t").with_type(task_type);
        task.attempts = 1;
        task
    }

    #[tokio::test]
    async fn runtime_executes_registered_handler() {
        let rt = runtime_with("ok", Arc::new(OkHandler), None);
        let exec = rt.execute(&claimed("ok")).await;
        let payload = exec.outcome.unwrap();
        assert_eq!(payload["task_id"], "t");
        assert_eq!(payload["attempt"], 1);
    }

    #[tokio::test]
    async fn missing_handler_is_permanent_failure() {
        let rt = Runtime::new(Arc::new(HandlerRegistry::new()), None);
        let failure = rt.execute(&claimed("missing")).await.outcome.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::HandlerNotFound);
        assert!(failure.message.contains("handler"));
    }

    #[tokio::test]
    async fn fallback_handles_unknown_types() {
        let mut reg = HandlerRegistry::new();
        reg.set_fallback(Arc::new(OkHandler));
        let rt = Runtime::new(Arc::new(reg), None);

        assert!(rt.execute(&claimed("anything")).await.outcome.is_ok());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = HandlerRegistry::new();
        reg.register(TaskType::new("a"), Arc::new(OkHandler)).unwrap();
        let err = reg
            .register(TaskType::new("a"), Arc::new(OkHandler))
            .unwrap_err();
        assert!(matches!(err, ProcessorError::DuplicateHandler(_)));
    }

    #[tokio::test]
    async fn handler_errors_keep_their_kind() {
        let transient = FnHandler::new(|_ctx| async { Err::<Payload, _>(TaskError::transient("flaky")) });
        let rt = runtime_with("t", Arc::new(transient), None);
        let failure = rt.execute(&claimed("t")).await.outcome.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Execution);
        assert_eq!(failure.message, "flaky");

        let permanent = FnHandler::new(|_ctx| async { Err::<Payload, _>(TaskError::permanent("bad input")) });
        let rt = runtime_with("p", Arc::new(permanent), None);
        let failure = rt.execute(&claimed("p")).await.outcome.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn panic_is_captured() {
        let panicky = FnHandler::new(|_ctx| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, TaskError>(json!(null))
        });
        let rt = runtime_with("boom", Arc::new(panicky), None);
        let failure = rt.execute(&claimed("boom")).await.outcome.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Panic);
        assert!(failure.message.contains("kaboom"));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let slow = FnHandler::new(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TaskError>(json!(null))
        });
        let rt = runtime_with("slow", Arc::new(slow), Some(Duration::from_millis(30)));
        let exec = rt.execute(&claimed("slow")).await;
        assert_eq!(exec.outcome.unwrap_err().kind, ErrorKind::Timeout);
        assert!(exec.duration < Duration::from_secs(5));
    }
}

//! spindle-core
//!
//! In-process concurrent task processing: submit work, run it on a pool of
//! tokio workers with bounded retries, and collect exactly one result per task.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, outcome, decision）
//! - **ports**: 抽象化レイヤー（Clock）
//! - **registry**: タスク状態の唯一の正（check-and-set はすべてここ）
//! - **queue**: 優先度付き work queue, retry policy, retry scheduler
//! - **results**: 結果ストア（待機は watch channel, ポーリングなし）
//! - **runtime**: handler registry と 1 attempt の実行
//! - **processor**: 公開 API（builder, submit, wait, cancel, shutdown）
//! - **client**: token bucket + circuit breaker 付きクライアント
//!
//! ```ignore
//! let processor = Processor::builder()
//!     .handler_fn("echo", |ctx| async move { Ok(ctx.payload) })?
//!     .build()?;
//! processor.start()?;
//! let id = processor.submit(Task::new(json!({"x": 1})).with_type("echo"))?;
//! let result = processor.wait_for_result(&id, Duration::from_secs(5)).await?;
//! processor.shutdown(Duration::from_secs(10)).await;
//! ```

pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod ports;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod results;
pub mod runtime;

mod engine;
mod worker;

pub use config::{ClientConfig, ProcessorConfig, RetryConfig};
pub use domain::{ErrorKind, Outcome, Payload, Task, TaskFailure, TaskId, TaskResult, TaskStatus, TaskType};
pub use error::{ProcessorError, TaskError};
pub use observability::Metrics;
pub use processor::{Processor, ProcessorBuilder, ShutdownReport, SubmitOptions};
pub use runtime::{TaskContext, TaskHandler};

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use spindle_core::{
    Payload, Processor, ProcessorConfig, Task, TaskContext, TaskError, TaskHandler, TaskId,
    TaskResult,
};

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Greets, after failing the first `n` calls on purpose.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for HelloHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<Payload, TaskError> {
        let p: HelloPayload = ctx.decode()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskError::transient(format!(
                "intentional failure (left={left})"
            )));
        }

        Ok(json!({ "greeting": format!("Hello, {}!", p.name), "attempt": ctx.attempt }))
    }
}

struct Args {
    config: Option<String>,
    workers: Option<usize>,
    tasks: usize,
    failures: u32,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        workers: None,
        tasks: 8,
        failures: 2,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config", Some(v)) => parsed.config = Some(v.clone()),
            ("--workers", Some(v)) => parsed.workers = Some(v.parse().context("--workers")?),
            ("--tasks", Some(v)) => parsed.tasks = v.parse().context("--tasks")?,
            ("--failures", Some(v)) => parsed.failures = v.parse().context("--failures")?,
            (flag, _) => {
                eprintln!(
                    "Usage: {} [--config <file.json>] [--workers N] [--tasks N] [--failures N]",
                    args[0]
                );
                anyhow::bail!("unexpected argument: {flag}");
            }
        }
        i += 2;
    }
    Ok(parsed)
}

fn load_config(args: &Args) -> anyhow::Result<ProcessorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            ProcessorConfig::from_json_str(&raw)?
        }
        None => ProcessorConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

async fn wait_all(processor: &Processor, ids: &[TaskId]) -> anyhow::Result<Vec<TaskResult>> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        match processor.wait_for_result(id, Duration::from_secs(30)).await? {
            Some(result) => results.push(result),
            None => tracing::warn!(task_id = %id, "no result within 30s"),
        }
    }
    Ok(results)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let config = load_config(&args)?;

    let processor = Processor::builder()
        .config(config)
        .handler("hello", HelloHandler::new(args.failures))?
        .handler_fn("sleep", |ctx| async move {
            let ms = ctx.payload["ms"].as_u64().unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        })?
        .build()?;
    processor.start()?;

    let completed = Arc::new(AtomicU32::new(0));
    let mut ids = Vec::new();
    for i in 0..args.tasks {
        let seen = Arc::clone(&completed);
        let task = Task::new(json!({ "name": format!("spindle-{i}") }))
            .with_type("hello")
            .with_callback(move |result| {
                if result.is_success() {
                    seen.fetch_add(1, Ordering::Relaxed);
                }
            });
        ids.push(processor.submit(task)?);
    }
    for ms in [50, 20, 5] {
        let task = Task::new(json!({ "ms": ms }))
            .with_type("sleep")
            .with_priority(10);
        ids.push(processor.submit(task)?);
    }
    tracing::info!(submitted = ids.len(), "tasks submitted");

    tokio::select! {
        results = wait_all(&processor, &ids) => {
            for result in results? {
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, shutting down");
        }
    }

    println!("metrics: {}", serde_json::to_string_pretty(&processor.get_metrics())?);
    println!(
        "hello callbacks seen: {}",
        completed.load(Ordering::Relaxed)
    );

    let report = processor.shutdown(Duration::from_secs(10)).await;
    println!("shutdown: {}", serde_json::to_string(&report)?);
    Ok(())
}

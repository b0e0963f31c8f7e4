//! Single entry point for every way the engine is driven: routed HTTP-style
//! requests, direct operation invocations and scheduler timer ticks.

use crate::engine::Engine;
use crate::error::{AppError, Result};
use crate::models::{AccountContext, ExecutionStatus, ResourceBatch};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub enum RequestKind {
    Http {
        method: String,
        path: String,
        body: Option<Value>,
    },
    Operation {
        name: String,
        payload: Value,
    },
    TimerTick,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequestLine {
    Http {
        method: String,
        path: String,
        #[serde(default)]
        body: Option<Value>,
    },
    Operation {
        operation: String,
        #[serde(default)]
        payload: Value,
    },
    Tick {
        tick: bool,
    },
}

impl RequestKind {
    /// Parses one JSON request line, e.g. `{"operation": "cancel", "payload": {...}}`,
    /// `{"method": "GET", "path": "/executions"}` or `{"tick": true}`.
    pub fn from_line(line: &str) -> Result<Self> {
        let parsed: RequestLine = serde_json::from_str(line)
            .map_err(|err| AppError::Validation(format!("Unrecognized request: {}", err)))?;
        match parsed {
            RequestLine::Http { method, path, body } => Ok(Self::Http { method, path, body }),
            RequestLine::Operation { operation, payload } => Ok(Self::Operation {
                name: operation,
                payload,
            }),
            RequestLine::Tick { tick: true } => Ok(Self::TimerTick),
            RequestLine::Tick { tick: false } => {
                Err(AppError::Validation("Unrecognized request: tick must be true".to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub waves: Vec<ResourceBatch>,
    #[serde(default)]
    pub is_drill: bool,
    #[serde(default)]
    pub account_context: AccountContext,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    Start(StartRequest),
    Get { execution_id: String },
    List {
        #[serde(default)]
        status: Vec<ExecutionStatus>,
    },
    Poll { execution_id: String },
    Advance { execution_id: String },
    Pause { execution_id: String },
    Resume { execution_id: String },
    Cancel { execution_id: String },
    Finalize { execution_id: String },
}

impl Operation {
    fn from_named(name: &str, payload: Value) -> Result<Self> {
        let payload = if payload.is_null() { json!({}) } else { payload };
        serde_json::from_value(json!({ "operation": name, "payload": payload })).map_err(|err| {
            AppError::Validation(format!("Invalid '{}' request: {}", name, err))
        })
    }

    fn from_route(method: &str, path: &str, body: Option<Value>) -> Result<Self> {
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        let by_id = |name: &str, id: &str| Self::from_named(name, json!({ "execution_id": id }));
        match (method.to_ascii_uppercase().as_str(), segments.as_slice()) {
            ("POST", ["executions"]) => Self::from_named("start", body.unwrap_or(Value::Null)),
            ("GET", ["executions"]) => Self::from_named("list", body.unwrap_or(Value::Null)),
            ("GET", ["executions", id]) => by_id("get", id),
            (
                "POST",
                ["executions", id, action @ ("poll" | "advance" | "pause" | "resume" | "cancel" | "finalize")],
            ) => by_id(action, id),
            (method, _) => Err(AppError::Validation(format!(
                "No route for {} {}",
                method, path
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    engine: Engine,
}

impl Dispatcher {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn handle(&self, request: RequestKind) -> Result<Value> {
        let operation = match request {
            RequestKind::Http { method, path, body } => {
                tracing::debug!(%method, %path, "Routing request");
                Operation::from_route(&method, &path, body)?
            }
            RequestKind::Operation { name, payload } => Operation::from_named(&name, payload)?,
            RequestKind::TimerTick => {
                let report = self.engine.poller.tick().await?;
                return Ok(serde_json::to_value(report)?);
            }
        };
        self.execute(operation).await
    }

    pub async fn execute(&self, operation: Operation) -> Result<Value> {
        let engine = &self.engine;
        let value = match operation {
            Operation::Start(request) => serde_json::to_value(
                engine
                    .scheduler
                    .start(request.waves, request.is_drill, request.account_context)
                    .await?,
            )?,
            Operation::Get { execution_id } => {
                serde_json::to_value(engine.scheduler.get_execution(&execution_id).await?)?
            }
            Operation::List { status } => {
                serde_json::to_value(engine.scheduler.list_executions(&status).await?)?
            }
            Operation::Poll { execution_id } => serde_json::to_value(engine.poll.poll(&execution_id).await?)?,
            Operation::Advance { execution_id } => {
                serde_json::to_value(engine.scheduler.advance_or_pause(&execution_id).await?)?
            }
            Operation::Pause { execution_id } => serde_json::to_value(engine.scheduler.pause(&execution_id).await?)?,
            Operation::Resume { execution_id } => serde_json::to_value(engine.scheduler.resume(&execution_id).await?)?,
            Operation::Cancel { execution_id } => serde_json::to_value(engine.scheduler.cancel(&execution_id).await?)?,
            Operation::Finalize { execution_id } => {
                serde_json::to_value(engine.finalizer.finalize(&execution_id).await?)?
            }
        };
        Ok(value)
    }
}

/// Maps an outcome to the envelope returned to callers.
pub fn envelope(result: Result<Value>) -> Value {
    match result {
        Ok(data) => json!({ "ok": true, "data": data }),
        Err(err) => {
            let mut body = json!({ "ok": false, "code": err.code(), "message": err.to_string() });
            if let AppError::Conflict { resource_ids } = &err {
                body["conflicts"] = json!(resource_ids);
            }
            body
        }
    }
}

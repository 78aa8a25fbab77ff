//! Host-provided interfaces the engine calls through rather than
//! implementing itself: tool invocation, user-code execution, and wall
//! clock access.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

/// Invokes a registered external tool. The sandbox/registry backing this is
/// out of scope for the engine — it only calls through this narrow
/// interface.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        connection_id: &str,
        tool_name: &str,
        args: Value,
        deadline_ms: u64,
    ) -> anyhow::Result<Value>;
}

/// Runs user code hermetically against resolved step input. The engine
/// assumes `run` is deterministic for a given `(source, args)` pair so that
/// retried attempts can be treated as fresh executions rather than resumed
/// ones.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(
        &self,
        source: &str,
        args: Value,
        step_name: &str,
        deadline_ms: u64,
    ) -> anyhow::Result<Value>;

    async fn validate(&self, source: &str, step_name: &str) -> anyhow::Result<()>;
}

/// Wall-clock access, abstracted so tests can drive signal/timer scenarios
/// without real sleeps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Routes `Tool` steps to an HTTP endpoint: POST `{connectionId, toolName,
/// args}`, deserialize the JSON response as the step's output.
pub struct HttpToolInvoker {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpToolInvoker {
    pub fn new(endpoint: String, client: reqwest::Client) -> Self {
        Self { endpoint, client }
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn invoke(
        &self,
        connection_id: &str,
        tool_name: &str,
        args: Value,
        deadline_ms: u64,
    ) -> anyhow::Result<Value> {
        info!(connection_id, tool_name, "invoking tool via {}", self.endpoint);

        let response = self
            .client
            .post(format!("{}/invoke", self.endpoint))
            .timeout(std::time::Duration::from_millis(deadline_ms))
            .json(&serde_json::json!({
                "connectionId": connection_id,
                "toolName": tool_name,
                "args": args,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(connection_id, tool_name, %status, "tool invocation failed: {}", body);
            anyhow::bail!("tool {tool_name} returned {status}: {body}");
        }

        let result: Value = response.json().await?;
        Ok(result)
    }
}

/// Used when no `TOOL_INVOKER_ENDPOINT` is configured. `Tool` steps fail
/// closed rather than silently no-op — a tool's output is load-bearing for
/// downstream refs, unlike an optional enrichment step.
pub struct NullToolInvoker;

#[async_trait]
impl ToolInvoker for NullToolInvoker {
    async fn invoke(
        &self,
        _connection_id: &str,
        tool_name: &str,
        _args: Value,
        _deadline_ms: u64,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("no tool invoker configured; cannot invoke `{tool_name}`")
    }
}

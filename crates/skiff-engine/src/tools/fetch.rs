use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use skiff_core::tools::{Policy, Tool, ToolContext, ToolError, ToolOutcome};

const DEFAULT_MAX_BYTES: usize = 100 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent("skiff-agent/0.1")
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return the response body as text."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Maximum number of body bytes to return"
                }
            }
        })
    }

    fn default_policy(&self) -> Policy {
        Policy::Allow
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let url = args["url"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("url is required".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "only http(s) URLs are supported".into(),
            ));
        }
        let max_bytes = args["max_bytes"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_BYTES);

        let response = tokio::select! {
            r = self.client.get(url).send() => {
                r.map_err(|e| ToolError::Failed(format!("fetch failed: {e}")))?
            }
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };

        let status = response.status();
        let body = tokio::select! {
            b = response.text() => b.map_err(|e| ToolError::Failed(format!("read body: {e}")))?,
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };

        let total = body.len();
        let mut text: String = body.chars().take(max_bytes).collect();
        if total > text.len() {
            text.push_str(&format!("\n\n...(truncated, {total} bytes total)..."));
        }

        Ok(ToolOutcome::text(format!(
            "URL: {url}\nStatus: {status}\n\n{text}"
        )))
    }
}

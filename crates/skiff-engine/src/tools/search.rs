use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use skiff_core::tools::{Policy, Tool, ToolContext, ToolError, ToolOutcome};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_COUNT: u64 = 5;

/// Web search backed by the Brave Search API. Without an API key the tool
/// stays registered but every call fails with a configuration error.
pub struct SearchTool {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl SearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent("skiff-agent/0.1")
                .build()
                .unwrap_or_default(),
            api_key,
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the web and return titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results (max 10)"
                }
            }
        })
    }

    fn default_policy(&self) -> Policy {
        Policy::Allow
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("query is required".into()))?;
        let count = args["count"].as_u64().unwrap_or(DEFAULT_COUNT).min(10);

        let Some(api_key) = &self.api_key else {
            return Err(ToolError::Failed(
                "search is not configured (missing API key)".into(),
            ));
        };

        let count_param = count.to_string();
        let request = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", count_param.as_str())])
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json");

        let response = tokio::select! {
            r = request.send() => r.map_err(|e| ToolError::Failed(format!("search failed: {e}")))?,
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(ToolError::Failed(format!(
                "search returned HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("decode search response: {e}")))?;

        Ok(ToolOutcome::text(format_results(query, &body)))
    }
}

fn format_results(query: &str, body: &Value) -> String {
    let results = body
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(|r| r.as_array());

    let Some(results) = results else {
        return format!("No results for: {query}");
    };

    let mut out = format!("Results for: {query}\n");
    for (i, item) in results.iter().enumerate() {
        let title = item.get("title").and_then(|t| t.as_str()).unwrap_or("");
        let url = item.get("url").and_then(|u| u.as_str()).unwrap_or("");
        let snippet = item
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("");
        out.push_str(&format!("\n{}. {title}\n   {url}\n   {snippet}\n", i + 1));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::ids::{SessionId, StepId, ToolCallId, TurnId};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::new(),
            turn_id: TurnId::new(),
            step_id: StepId::new(),
            tool_call_id: ToolCallId::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn without_key_fails_clearly() {
        let tool = SearchTool::new(None);
        let err = tool
            .execute(serde_json::json!({"query": "rust"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn missing_query_rejected() {
        let tool = SearchTool::new(Some("key".into()));
        let err = tool.execute(serde_json::json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn formats_results() {
        let body = serde_json::json!({
            "web": {"results": [
                {"title": "Rust", "url": "https://rust-lang.org", "description": "A language"},
            ]}
        });
        let text = format_results("rust", &body);
        assert!(text.contains("1. Rust"));
        assert!(text.contains("https://rust-lang.org"));
    }

    #[test]
    fn formats_empty_results() {
        let text = format_results("nothing", &serde_json::json!({}));
        assert!(text.contains("No results"));
    }
}

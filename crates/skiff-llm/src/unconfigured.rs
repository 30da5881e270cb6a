use async_trait::async_trait;

use skiff_core::messages::ChatMessage;
use skiff_core::provider::{ModelEventStream, ModelStream, ProviderError};
use skiff_core::tools::ToolDefinition;

/// Fallback provider installed when no model credentials are configured.
/// Every turn fails fast with a clear error event instead of hanging.
pub struct UnconfiguredStream;

#[async_trait]
impl ModelStream for UnconfiguredStream {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn open(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _model: &str,
    ) -> Result<ModelEventStream, ProviderError> {
        Err(ProviderError::NotConfigured(
            "no model provider configured; agent turns will fail until one is wired in".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_always_fails() {
        let provider = UnconfiguredStream;
        let err = match provider.open(&[], &[], "any").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}

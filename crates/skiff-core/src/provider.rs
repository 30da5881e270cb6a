use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::messages::ChatMessage;
use crate::stream::ModelEvent;
use crate::tools::ToolDefinition;

pub type ModelEventStream = Pin<Box<dyn Stream<Item = ModelEvent> + Send>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("provider request failed: {0}")]
    Request(String),
}

/// Abstract model stream capability. The runner only ever talks to this
/// trait; concrete adapters (and the test mock) live in skiff-llm.
///
/// Dropping the returned stream must terminate the underlying request
/// promptly; that is the cancellation contract the runner relies on.
#[async_trait]
pub trait ModelStream: Send + Sync {
    fn name(&self) -> &str;

    async fn open(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<ModelEventStream, ProviderError>;
}

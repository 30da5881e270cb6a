use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use skiff_core::ids::MessageId;
use skiff_core::messages::{ChatMessage, ToolCallRequest};
use skiff_core::provider::{ModelEventStream, ModelStream, ProviderError};
use skiff_core::stream::{FinishReason, ModelEvent, TokenUsage};
use skiff_core::tools::ToolDefinition;

/// Pre-programmed behavior for one `open()` call.
pub enum MockScript {
    /// Yield these events in order.
    Events(Vec<ModelEvent>),
    /// Fail the `open()` call itself.
    OpenError(String),
    /// Sleep before every yielded event (for cancellation tests).
    Slow(Duration, Vec<ModelEvent>),
}

impl MockScript {
    /// A plain text response: one delta then a `stop` finish.
    pub fn text(text: &str) -> Self {
        let message_id = MessageId::new();
        Self::Events(vec![
            ModelEvent::TextDelta {
                message_id,
                text: text.to_string(),
            },
            ModelEvent::Stop {
                finish_reason: FinishReason::Stop,
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: text.len() as u64,
                }),
            },
        ])
    }

    /// A response that requests the given tool calls then stops with
    /// `tool_use`.
    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        let mut events: Vec<ModelEvent> = calls.into_iter().map(ModelEvent::ToolCall).collect();
        events.push(ModelEvent::Stop {
            finish_reason: FinishReason::ToolUse,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        });
        Self::Events(events)
    }

    /// A stream that reports a provider error mid-flight.
    pub fn stream_error(message: &str) -> Self {
        Self::Events(vec![ModelEvent::Error {
            message: message.to_string(),
        }])
    }
}

/// Scripted provider: each `open()` call consumes the next script in order.
/// Also records the message history of every call so tests can assert on
/// what the runner actually sent.
pub struct MockStream {
    scripts: Vec<MockScript>,
    call_count: AtomicUsize,
    observed: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockStream {
    pub fn new(scripts: Vec<MockScript>) -> Self {
        Self {
            scripts,
            call_count: AtomicUsize::new(0),
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Message histories observed across calls, in call order.
    pub fn observed_messages(&self) -> Vec<Vec<ChatMessage>> {
        self.observed.lock().expect("observed lock").clone()
    }
}

#[async_trait]
impl ModelStream for MockStream {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _model: &str,
    ) -> Result<ModelEventStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.observed
            .lock()
            .expect("observed lock")
            .push(messages.to_vec());

        let script = self
            .scripts
            .get(idx)
            .ok_or_else(|| ProviderError::Request(format!("no script for call {idx}")))?;

        match script {
            MockScript::Events(events) => Ok(Box::pin(stream::iter(events.clone()))),
            MockScript::OpenError(message) => Err(ProviderError::Request(message.clone())),
            MockScript::Slow(delay, events) => {
                let delay = *delay;
                let events = events.clone();
                Ok(Box::pin(stream::unfold(
                    (events.into_iter(), delay),
                    |(mut iter, delay)| async move {
                        tokio::time::sleep(delay).await;
                        iter.next().map(|ev| (ev, (iter, delay)))
                    },
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn text_script_yields_delta_then_stop() {
        let mock = MockStream::new(vec![MockScript::text("hello")]);
        let mut stream = mock.open(&[], &[], "mock-model").await.unwrap();

        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ModelEvent::TextDelta { text, .. } if text == "hello"));
        assert!(matches!(
            &events[1],
            ModelEvent::Stop {
                finish_reason: FinishReason::Stop,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn scripts_consumed_in_order() {
        let mock = MockStream::new(vec![MockScript::text("first"), MockScript::text("second")]);
        let _ = mock.open(&[], &[], "m").await.unwrap();
        let _ = mock.open(&[], &[], "m").await.unwrap();
        assert_eq!(mock.call_count(), 2);

        // Third call has no script.
        assert!(mock.open(&[], &[], "m").await.is_err());
    }

    #[tokio::test]
    async fn open_error_script() {
        let mock = MockStream::new(vec![MockScript::OpenError("boom".into())]);
        let err = match mock.open(&[], &[], "m").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn records_observed_messages() {
        let mock = MockStream::new(vec![MockScript::text("ok")]);
        let messages = vec![ChatMessage::user("hi there")];
        let _ = mock.open(&messages, &[], "m").await.unwrap();

        let observed = mock.observed_messages();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0][0].text(), "hi there");
    }

    #[tokio::test]
    async fn slow_script_delays_events() {
        let mock = MockStream::new(vec![MockScript::Slow(
            Duration::from_millis(20),
            vec![ModelEvent::Stop {
                finish_reason: FinishReason::Stop,
                usage: None,
            }],
        )]);
        let start = std::time::Instant::now();
        let mut stream = mock.open(&[], &[], "m").await.unwrap();
        let _ = stream.next().await;
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}

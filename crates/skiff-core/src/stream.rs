use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::messages::ToolCallRequest;

/// Why the model stopped producing output.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    #[serde(other)]
    Unknown,
}

/// Token accounting reported by the provider at stream end.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Events yielded by a model stream. Ordering contract: any number of delta
/// and tool_call events, then exactly one terminal `Stop` or `Error`.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    TextDelta {
        message_id: MessageId,
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ThinkingEnd {
        duration_ms: u64,
    },
    ToolCall(ToolCallRequest),
    Stop {
        finish_reason: FinishReason,
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
    },
}

impl ModelEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let stop = ModelEvent::Stop {
            finish_reason: FinishReason::Stop,
            usage: None,
        };
        assert!(stop.is_terminal());

        let delta = ModelEvent::TextDelta {
            message_id: MessageId::new(),
            text: "x".into(),
        };
        assert!(!delta.is_terminal());
    }

    #[test]
    fn finish_reason_serde() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolUse).unwrap(),
            r#""tool_use""#
        );
        let parsed: FinishReason = serde_json::from_str(r#""stop""#).unwrap();
        assert_eq!(parsed, FinishReason::Stop);

        // Forward compatibility: unrecognized reasons decode to Unknown.
        let parsed: FinishReason = serde_json::from_str(r#""content_filter""#).unwrap();
        assert_eq!(parsed, FinishReason::Unknown);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        assert!(total.is_empty());
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.accumulate(&TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
    }
}

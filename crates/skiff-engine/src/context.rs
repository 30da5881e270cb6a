use std::sync::Arc;

use tracing::warn;

use skiff_core::ids::SessionId;
use skiff_core::messages::ChatMessage;
use skiff_store::context::{ContextItemRow, ContextRepo};
use skiff_store::files::sha256_hex;
use skiff_store::{Database, StoreError};

use crate::sandbox::SandboxFs;

const MAX_PINNED_ITEMS: usize = 12;
const TOTAL_CHAR_BUDGET: usize = 60_000;
const SUMMARY_TRIGGER_CHARS: usize = 12_000;
const RAW_ITEM_CHAR_CAP: usize = 18_000;

/// How many most-recent turns are replayed verbatim into the prompt.
pub const HISTORY_TURN_WINDOW: usize = 20;

const BASE_SYSTEM_PROMPT: &str = "\
You are an autonomous coding agent running inside a sandboxed workspace.

Rules:
- Use the provided tools to inspect and modify files; never fabricate file contents.
- Tool arguments must match the declared JSON schema exactly.
- File writes and patches may require user approval; a denied tool call is not an error in your reasoning, continue without that action.
- Keep answers concise and grounded in what the tools returned.";

/// Produces a cached digest for oversized pinned content.
///
/// The default implementation is deterministic (head + tail excerpt) so the
/// core has no hidden model calls; a provider-backed summarizer can be
/// swapped in without touching the builder.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, title: &str, content: &str) -> String;
}

pub struct DigestSummarizer;

impl Summarizer for DigestSummarizer {
    fn summarize(&self, title: &str, content: &str) -> String {
        let head: String = content.chars().take(6_000).collect();
        let tail: String = {
            let chars: Vec<char> = content.chars().collect();
            let start = chars.len().saturating_sub(2_000);
            chars[start..].iter().collect()
        };
        format!(
            "# {title} (digest)\n\n{head}\n\n...(middle elided, {} chars total)...\n\n{tail}",
            content.len()
        )
    }
}

/// Composes the message array for a model call: base system prompt, pinned
/// context items (summarized when large, cached by content hash), the last
/// [`HISTORY_TURN_WINDOW`] turns, then the current user text.
pub struct ContextBuilder {
    items: ContextRepo,
    sandbox: Arc<SandboxFs>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextBuilder {
    pub fn new(db: Database, sandbox: Arc<SandboxFs>) -> Self {
        Self {
            items: ContextRepo::new(db),
            sandbox,
            summarizer: Arc::new(DigestSummarizer),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// The system prompt for a session, including the pinned-context block.
    pub async fn system_prompt(&self, session_id: &SessionId) -> Result<String, StoreError> {
        let mut prompt = BASE_SYSTEM_PROMPT.to_string();
        let pinned = self.pinned_section(session_id).await?;
        if !pinned.is_empty() {
            prompt.push_str("\n\n---\n\n");
            prompt.push_str(&pinned);
        }
        Ok(prompt)
    }

    /// Full message array for the next model call. `history` is
    /// (user_text, final_assistant_text) per prior turn, oldest first.
    pub async fn build(
        &self,
        session_id: &SessionId,
        history: &[(String, Option<String>)],
        user_text: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages = vec![ChatMessage::system(self.system_prompt(session_id).await?)];

        let start = history.len().saturating_sub(HISTORY_TURN_WINDOW);
        for (user, assistant) in &history[start..] {
            messages.push(ChatMessage::user(user.clone()));
            if let Some(text) = assistant {
                messages.push(ChatMessage::assistant(text.clone()));
            }
        }

        messages.push(ChatMessage::user(user_text));
        Ok(messages)
    }

    async fn pinned_section(&self, session_id: &SessionId) -> Result<String, StoreError> {
        let rows = self.items.list(session_id, 500)?;
        let mut pinned: Vec<ContextItemRow> =
            rows.into_iter().filter(|r| r.pinned).collect();
        // Stored newest-first; inject oldest-first for stable prompts.
        pinned.reverse();

        let mut seen = std::collections::HashSet::new();
        pinned.retain(|r| seen.insert((r.kind.clone(), r.content_ref.clone())));

        if pinned.is_empty() {
            return Ok(String::new());
        }

        let mut parts = vec![
            "# Pinned Context\n\
             Items the user pinned for this session. Treat them as \
             high-priority background; open the full source with tools if a \
             digest is not enough.\n"
                .to_string(),
        ];
        let mut used = 0usize;

        for item in pinned.iter().take(MAX_PINNED_ITEMS) {
            let body = self.item_body(item).await;
            let section = format!(
                "## {}\nkind: {}\nref: {}\n\n{}\n\n---\n",
                if item.title.is_empty() {
                    &item.content_ref
                } else {
                    &item.title
                },
                item.kind,
                item.content_ref,
                body.trim(),
            );
            if used + section.len() > TOTAL_CHAR_BUDGET {
                parts.push("\n(Additional pinned context omitted due to size limits.)\n".into());
                break;
            }
            used += section.len();
            parts.push(section);
        }

        Ok(parts.join("\n").trim().to_string())
    }

    async fn item_body(&self, item: &ContextItemRow) -> String {
        match item.kind.as_str() {
            "file" => {
                let content = match self.sandbox.read_file(&item.content_ref, None).await {
                    Ok(out) => out.content,
                    Err(_) => return "(Missing file)".to_string(),
                };

                if content.len() <= SUMMARY_TRIGGER_CHARS {
                    return truncate_chars(&content, RAW_ITEM_CHAR_CAP);
                }

                let sha = sha256_hex(&format!("{}{}", item.content_ref, content));
                if let (Some(summary), Some(cached_sha)) =
                    (item.summary.as_ref(), item.summary_sha256.as_ref())
                {
                    if cached_sha == &sha {
                        return summary.clone();
                    }
                }

                let summary = self.summarizer.summarize(&item.title, &content);
                if let Err(e) = self.items.update_summary(&item.id, &summary, &sha) {
                    warn!(item = %item.id, error = %e, "failed to cache context summary");
                }
                summary
            }
            "web" => match &item.summary {
                Some(summary) if !summary.is_empty() => summary.clone(),
                _ => "(Pinned URL only. Use http_fetch to read the page if needed.)".to_string(),
            },
            "summary" | "memory" => item
                .summary
                .clone()
                .unwrap_or_else(|| "(No stored content)".to_string()),
            _ => "(Unsupported pinned context kind)".to_string(),
        }
    }
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let head: String = text.chars().take(cap).collect();
    format!("{head}\n\n...(truncated)...")
}

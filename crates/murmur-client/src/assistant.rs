//! Chat assistant: reply ideas, rewriting, summaries and translation.
//!
//! The language model sits behind [`Assistant`]. Only the newest
//! [`CONTEXT_MESSAGES`] messages of a conversation are handed to it, and
//! encrypted messages never leave the device in readable form.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use murmur_shared::protocol::{ChatRecord, MessageKind, MessageRecord};
use murmur_shared::types::UserId;

/// How many of the newest messages are shared with the assistant.
pub const CONTEXT_MESSAGES: usize = 20;

/// Stands in for the content of an encrypted message.
pub const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted Message]";

const SUGGEST_INSTRUCTION: &str =
    "You are a helpful chat assistant. Generate replies that fit the context of the conversation.";
const REWRITE_INSTRUCTION: &str = "You are an expert editor. Provide the output as a clean list.";

/// The conversation as the assistant sees it: one `"Name: text"` line per
/// message, oldest first. The local user is `Me`, a sender missing from the
/// chat's member details is `Unknown`.
pub fn build_context(messages: &[MessageRecord], chat: &ChatRecord, me: &UserId) -> String {
    let skip = messages.len().saturating_sub(CONTEXT_MESSAGES);
    messages[skip..]
        .iter()
        .map(|message| {
            let sender = if &message.sender_id == me {
                "Me"
            } else {
                chat.member_details
                    .get(&message.sender_id)
                    .map(|details| details.display_name.as_str())
                    .unwrap_or("Unknown")
            };
            let content = match message.kind {
                MessageKind::Encrypted => ENCRYPTED_PLACEHOLDER,
                MessageKind::Text => message.text.as_str(),
            };
            format!("{sender}: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantTask {
    SuggestReplies,
    Rewrite,
    Summarize,
    Translate,
}

impl AssistantTask {
    fn failure_message(self) -> &'static str {
        match self {
            Self::SuggestReplies => "Failed to generate suggestions. Please try again.",
            Self::Rewrite => "Failed to rewrite text.",
            Self::Summarize => "Failed to summarize.",
            Self::Translate => "Failed to translate.",
        }
    }
}

/// One call to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantRequest {
    pub task: AssistantTask,
    pub prompt: String,
    pub system_instruction: Option<&'static str>,
    /// The answer must be a JSON object shaped like [`ReplySuggestions`].
    pub json_reply: bool,
}

impl AssistantRequest {
    pub fn suggest_replies(context: &str) -> Self {
        Self {
            task: AssistantTask::SuggestReplies,
            prompt: format!(
                "Read the following chat history and suggest 5 different replies for \"Me\".\n\nChat History:\n{context}"
            ),
            system_instruction: Some(SUGGEST_INSTRUCTION),
            json_reply: true,
        }
    }

    pub fn rewrite(text: &str) -> Self {
        Self {
            task: AssistantTask::Rewrite,
            prompt: format!(
                "Rewrite the following text in 3 styles (Professional, Casual, Enthusiastic): \"{text}\""
            ),
            system_instruction: Some(REWRITE_INSTRUCTION),
            json_reply: false,
        }
    }

    pub fn summarize(context: &str) -> Self {
        Self {
            task: AssistantTask::Summarize,
            prompt: format!("Summarize this chat conversation in bullet points:\n\n{context}"),
            system_instruction: None,
            json_reply: false,
        }
    }

    pub fn translate(context: &str) -> Self {
        Self {
            task: AssistantTask::Translate,
            prompt: format!(
                "Translate the last few messages of this conversation into English (if not already) or provide a translation of the context if it's mixed:\n\n{context}"
            ),
            system_instruction: None,
            json_reply: false,
        }
    }
}

/// Five ready-to-send replies in different tones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySuggestions {
    pub romantic: String,
    pub friendly: String,
    pub professional: String,
    pub funny: String,
    pub short_smart: String,
}

impl ReplySuggestions {
    /// `(label, reply)` pairs in display order.
    pub fn labelled(&self) -> [(&'static str, &str); 5] {
        [
            ("Romantic", self.romantic.as_str()),
            ("Friendly", self.friendly.as_str()),
            ("Professional", self.professional.as_str()),
            ("Funny", self.funny.as_str()),
            ("Smart", self.short_smart.as_str()),
        ]
    }
}

#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("Please type something in the input box to rewrite.")]
    EmptyInput,

    #[error("{task:?} failed: {source}")]
    Backend {
        task: AssistantTask,
        #[source]
        source: anyhow::Error,
    },

    #[error("Malformed reply suggestions: {0}")]
    MalformedReply(#[from] serde_json::Error),
}

impl AssistantError {
    /// Short text for the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyInput => self.to_string(),
            Self::Backend { task, .. } => task.failure_message().to_string(),
            Self::MalformedReply(_) => AssistantTask::SuggestReplies.failure_message().to_string(),
        }
    }
}

/// A text generation backend.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Run one request and return the model's text.
    async fn generate(&self, request: &AssistantRequest) -> anyhow::Result<String>;
}

/// The four assistant tools over any [`Assistant`] backend.
#[derive(Clone)]
pub struct ChatAssistant {
    backend: Arc<dyn Assistant>,
}

impl ChatAssistant {
    pub fn new(backend: Arc<dyn Assistant>) -> Self {
        Self { backend }
    }

    pub async fn suggest_replies(&self, context: &str) -> Result<ReplySuggestions, AssistantError> {
        let reply = self.run(AssistantRequest::suggest_replies(context)).await?;
        let reply = if reply.trim().is_empty() { "{}" } else { reply.as_str() };
        serde_json::from_str(reply).map_err(|e| {
            warn!(error = %e, "assistant returned unusable suggestions");
            AssistantError::from(e)
        })
    }

    /// Rewrite the composer's current input. Blank input is refused before
    /// anything is sent.
    pub async fn rewrite(&self, input: &str) -> Result<String, AssistantError> {
        if input.trim().is_empty() {
            return Err(AssistantError::EmptyInput);
        }
        self.run(AssistantRequest::rewrite(input)).await
    }

    pub async fn summarize(&self, context: &str) -> Result<String, AssistantError> {
        self.run(AssistantRequest::summarize(context)).await
    }

    pub async fn translate(&self, context: &str) -> Result<String, AssistantError> {
        self.run(AssistantRequest::translate(context)).await
    }

    async fn run(&self, request: AssistantRequest) -> Result<String, AssistantError> {
        debug!(task = ?request.task, prompt_len = request.prompt.len(), "asking assistant");
        self.backend.generate(&request).await.map_err(|source| {
            warn!(task = ?request.task, error = %source, "assistant request failed");
            AssistantError::Backend {
                task: request.task,
                source,
            }
        })
    }
}

/// Offline backend with fixed answers. Used by tests and the demo binary.
#[derive(Default)]
pub struct CannedAssistant {
    failing: AtomicBool,
    requests: Mutex<Vec<AssistantRequest>>,
}

impl CannedAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<AssistantRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl Assistant for CannedAssistant {
    async fn generate(&self, request: &AssistantRequest) -> anyhow::Result<String> {
        lock(&self.requests).push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("assistant offline");
        }

        let reply = match request.task {
            AssistantTask::SuggestReplies => serde_json::to_string(&ReplySuggestions {
                romantic: "Thinking of you.".into(),
                friendly: "Sounds great!".into(),
                professional: "Thank you, noted.".into(),
                funny: "My cat agrees.".into(),
                short_smart: "Deal.".into(),
            })?,
            AssistantTask::Rewrite => {
                let text = quoted(&request.prompt);
                format!("- Professional: {text}\n- Casual: {text}\n- Enthusiastic: {text}!")
            }
            AssistantTask::Summarize => body(&request.prompt)
                .lines()
                .map(|line| format!("- {line}"))
                .collect::<Vec<_>>()
                .join("\n"),
            AssistantTask::Translate => body(&request.prompt).to_string(),
        };
        Ok(reply)
    }
}

/// The part of a prompt after its first blank line.
fn body(prompt: &str) -> &str {
    prompt.split_once("\n\n").map_or(prompt, |(_, rest)| rest)
}

/// The text between the first and last double quote.
fn quoted(prompt: &str) -> &str {
    match (prompt.find('"'), prompt.rfind('"')) {
        (Some(start), Some(end)) if end > start => &prompt[start + 1..end],
        _ => prompt,
    }
}

fn lock(mutex: &Mutex<Vec<AssistantRequest>>) -> MutexGuard<'_, Vec<AssistantRequest>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use murmur_shared::protocol::{MessageBody, MessageDraft};
    use murmur_shared::types::{ChatId, MessageId};
    use murmur_store::ChatDraft;

    use crate::session::tests::profile;

    use super::*;

    fn chat() -> ChatRecord {
        ChatDraft::between(&profile("alice"), &profile("bob"))
            .into_record(ChatId::from("c"), Utc::now())
    }

    fn message(i: i64, from: &str, body: MessageBody) -> MessageRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        MessageRecord::from_draft(
            MessageId::from(format!("m{i:02}")),
            base + Duration::seconds(i),
            MessageDraft {
                chat_id: ChatId::from("c"),
                sender_id: UserId::from(from),
                body,
            },
        )
    }

    #[test]
    fn context_names_senders_and_hides_ciphertext() {
        let messages = vec![
            message(0, "alice", MessageBody::Text("hi bob".into())),
            message(1, "bob", MessageBody::Text("hey".into())),
            message(
                2,
                "bob",
                MessageBody::Encrypted {
                    ciphertext: "Zm9vYmFy".into(),
                    self_destruct: 0,
                },
            ),
            message(3, "mallory", MessageBody::Text("who am i".into())),
        ];

        let context = build_context(&messages, &chat(), &UserId::from("alice"));
        assert_eq!(
            context,
            "Me: hi bob\nbob: hey\nbob: [Encrypted Message]\nUnknown: who am i"
        );
    }

    #[test]
    fn context_keeps_the_newest_twenty() {
        let messages: Vec<_> = (0..25)
            .map(|i| message(i, "bob", MessageBody::Text(i.to_string())))
            .collect();
        let context = build_context(&messages, &chat(), &UserId::from("alice"));
        let lines: Vec<_> = context.lines().collect();
        assert_eq!(lines.len(), CONTEXT_MESSAGES);
        assert_eq!(lines[0], "bob: 5");
        assert_eq!(lines[19], "bob: 24");

        assert_eq!(build_context(&[], &chat(), &UserId::from("alice")), "");
    }

    #[tokio::test]
    async fn suggestions_parse_into_five_tones() {
        let backend = Arc::new(CannedAssistant::new());
        let assistant = ChatAssistant::new(backend.clone());

        let ideas = assistant.suggest_replies("bob: dinner?").await.unwrap();
        assert_eq!(ideas.short_smart, "Deal.");
        assert_eq!(ideas.labelled()[4], ("Smart", "Deal."));

        let sent = &backend.requests()[0];
        assert!(sent.json_reply);
        assert!(sent.prompt.ends_with("Chat History:\nbob: dinner?"));
        assert_eq!(sent.system_instruction, Some(SUGGEST_INSTRUCTION));
    }

    #[tokio::test]
    async fn blank_rewrite_is_refused_locally() {
        let backend = Arc::new(CannedAssistant::new());
        let assistant = ChatAssistant::new(backend.clone());

        let err = assistant.rewrite("   ").await.unwrap_err();
        assert!(matches!(err, AssistantError::EmptyInput));
        assert_eq!(
            err.user_message(),
            "Please type something in the input box to rewrite."
        );
        assert!(backend.requests().is_empty());

        let styles = assistant.rewrite("see you soon").await.unwrap();
        assert_eq!(styles.lines().count(), 3);
        assert!(styles.contains("Casual: see you soon"));
    }

    #[tokio::test]
    async fn summary_and_translation_use_the_context() {
        let assistant = ChatAssistant::new(Arc::new(CannedAssistant::new()));
        let context = "Me: hola\nbob: hi";

        let summary = assistant.summarize(context).await.unwrap();
        assert_eq!(summary, "- Me: hola\n- bob: hi");
        assert_eq!(assistant.translate(context).await.unwrap(), context);
    }

    #[tokio::test]
    async fn backend_failure_maps_to_task_message() {
        let backend = Arc::new(CannedAssistant::new());
        backend.set_failing(true);
        let assistant = ChatAssistant::new(backend);

        let err = assistant.summarize("x").await.unwrap_err();
        assert_eq!(err.user_message(), "Failed to summarize.");
        let err = assistant.suggest_replies("x").await.unwrap_err();
        assert_eq!(
            err.user_message(),
            "Failed to generate suggestions. Please try again."
        );
    }

    #[tokio::test]
    async fn empty_or_partial_suggestions_are_rejected() {
        struct Terse;

        #[async_trait]
        impl Assistant for Terse {
            async fn generate(&self, _: &AssistantRequest) -> anyhow::Result<String> {
                Ok(r#"{"friendly": "ok"}"#.into())
            }
        }

        let err = ChatAssistant::new(Arc::new(Terse))
            .suggest_replies("x")
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::MalformedReply(_)));
    }
}

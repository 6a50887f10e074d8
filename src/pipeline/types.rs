//! Shared types for the mail processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

/// Topic assigned when the model answers with a category the account does not have.
pub const DEFAULT_CATEGORY: &str = "Others";

// ── Raw message ─────────────────────────────────────────────────────

/// A mailbox participant: optional display name plus address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: Option<String>,
    pub address: String,
}

impl Participant {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name
                .map(|n| n.trim().trim_matches('"').trim().to_string())
                .filter(|n| !n.is_empty()),
            address: address.trim().to_string(),
        }
    }

    /// Parse `Name <addr@host>` or a bare address.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>'))
            && open < close
        {
            let name = &raw[..open];
            let address = &raw[open + 1..close];
            return Self::new(Some(name), address);
        }
        Self::new(None, raw)
    }

    /// Parse a comma-separated header value into participants.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// One node of a message body tree.
///
/// Providers that expose a MIME tree map it onto `Multipart`; providers that
/// hand back a single rendered body produce a lone `Plain` or `Html` leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyPart {
    Plain(String),
    Html(String),
    Multipart {
        subtype: String,
        children: Vec<BodyPart>,
    },
    /// Non-text leaf (attachment payload, calendar blob, ...).
    Other { mime_type: String },
}

/// Attachment metadata as reported by the provider. Contents are never fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub provider_attachment_id: Option<String>,
    pub filename: String,
}

/// A message as fetched from a provider, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub provider_message_id: String,
    pub subject: String,
    pub sender: Participant,
    pub cc: Vec<Participant>,
    pub bcc: Vec<Participant>,
    pub body: BodyPart,
    pub sent_at: DateTime<Utc>,
    pub is_reply: bool,
    pub attachments: Vec<AttachmentMeta>,
}

/// Canonical form produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub provider_message_id: String,
    pub subject: String,
    pub body: String,
    pub sender: Participant,
    pub cc: Vec<Participant>,
    pub bcc: Vec<Participant>,
    pub sent_at: DateTime<Utc>,
    pub is_reply: bool,
    pub has_attachments: bool,
    pub attachments: Vec<AttachmentMeta>,
}

// ── Taxonomy ────────────────────────────────────────────────────────

/// Message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Importance {
    Important,
    Informative,
    Useless,
}

impl Importance {
    pub const ALL: [Importance; 3] = [Self::Important, Self::Informative, Self::Useless];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Important => "important",
            Self::Informative => "informative",
            Self::Useless => "useless",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Whether the message expects an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnswerRequirement {
    Required,
    Maybe,
    NotRequired,
}

impl AnswerRequirement {
    pub const ALL: [AnswerRequirement; 3] = [Self::Required, Self::Maybe, Self::NotRequired];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "Answer Required",
            Self::Maybe => "Might Require Answer",
            Self::NotRequired => "No Answer Required",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Relevance of the message to the account owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relevance {
    High,
    Possible,
    NotRelevant,
}

impl Relevance {
    pub const ALL: [Relevance; 3] = [Self::High, Self::Possible, Self::NotRelevant];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "Highly Relevant",
            Self::Possible => "Possibly Relevant",
            Self::NotRelevant => "Not Relevant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Boolean content flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub spam: bool,
    pub scam: bool,
    pub newsletter: bool,
    pub notification: bool,
    pub meeting: bool,
}

impl Flags {
    pub const NAMES: [&'static str; 5] = ["spam", "scam", "newsletter", "notification", "meeting"];

    /// Names of the flags that are set, in declaration order.
    pub fn active(&self) -> Vec<&'static str> {
        let values = [
            self.spam,
            self.scam,
            self.newsletter,
            self.notification,
            self.meeting,
        ];
        Self::NAMES
            .into_iter()
            .zip(values)
            .filter_map(|(name, on)| on.then_some(name))
            .collect()
    }
}

/// Structured classification of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub topic: String,
    pub importance: Importance,
    pub answer: AnswerRequirement,
    pub relevance: Relevance,
    pub flags: Flags,
    pub summary_one_line: String,
    pub summary_short: String,
}

impl Classification {
    /// Taxonomy values written back to the mailbox, in application order.
    pub fn label_names(&self) -> Vec<String> {
        let mut names = vec![
            self.importance.as_str().to_string(),
            self.answer.as_str().to_string(),
            self.relevance.as_str().to_string(),
        ];
        names.extend(self.flags.active().into_iter().map(str::to_string));
        names
    }
}

/// Transient value returned by a classifier call. Folded into the record, never stored as-is.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub classification: Classification,
    pub usage: TokenUsage,
    /// Identifier of the backend/model that produced it.
    pub model: String,
}

/// Account-level context handed to the classifier.
#[derive(Debug, Clone, Default)]
pub struct ClassificationContext {
    pub mailbox_address: String,
    /// `(name, description)` pairs of the account's categories.
    pub categories: Vec<(String, String)>,
    pub is_reply: bool,
    pub sender: Option<Participant>,
}

impl ClassificationContext {
    /// Map a topic onto a known category name, or `DEFAULT_CATEGORY`.
    pub fn resolve_topic(&self, topic: &str) -> String {
        self.categories
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(topic.trim()))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// How one message's pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A new record reached `CLASSIFIED`.
    Persisted { record_id: String },
    /// A record for this id already existed; nothing was written.
    AlreadyPresent,
    /// Deliberately skipped (remote message gone, sender blocked).
    Skipped { reason: String },
    /// Classification exhausted its attempts; record is `FAILED`.
    Failed { record_id: String, error: String },
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Persisted { .. } => "persisted",
            Self::AlreadyPresent => "already_present",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Result of one reconciliation batch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Messages newly persisted (the single integer reported to callers).
    pub processed_count: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Per-item errors: `(provider_message_id, error)`.
    pub errors: Vec<(String, String)>,
}

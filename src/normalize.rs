//! Content normalizer: raw provider bundle to canonical text.
//!
//! One contract for every provider:
//! 1. Resolve the body tree to text. Inside one container, non-empty plain
//!    text wins over HTML; HTML is used only when no plain sibling has content.
//!    Children are concatenated in document order.
//! 2. Clean the text: links, addresses and image placeholders go, line endings
//!    become `\n`, lines are trimmed, runs of blank lines collapse.
//! 3. Drop a leading greeting line and a trailing sign-off block.
//!
//! Pure functions only; the same input always yields the same output.

use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::types::{BodyPart, NormalizedMessage, RawMessage};

const GREETINGS: &[&str] = &["bonjour", "hello", "hi", "dear", "salut"];

const SIGN_OFFS: &[&str] = &[
    "best regards",
    "regards",
    "sincerely",
    "cordially",
    "yours truly",
    "cordialement",
    "bien à vous",
];

static BRACKETED_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:https?|mailto):[^>]*>").expect("valid regex"));
static BARE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:https?://|mailto:)\S+").expect("valid regex"));
static IMAGE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[image:?[^\]]*\]").expect("valid regex"));
static EMAIL_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<?\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b>?").expect("valid regex")
});
static INLINE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
/// A whole line that is only a salutation: "Hi Bob," or "Dear Ms Smith".
static GREETING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^(?:{})\b(?:[^.!?\n]{{0,40}}[,!:]|(?:\s+[\p{{L}}'-]+){{0,3}}\s*)$",
        GREETINGS.join("|")
    ))
    .expect("valid regex")
});
/// A whole line that is only a closing phrase, optionally with a short name.
static SIGN_OFF_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^(?:{})\s*[,.!]?(?:\s+[\p{{L}}'-]+){{0,3}}$",
        SIGN_OFFS.join("|")
    ))
    .expect("valid regex")
});
/// Non-empty lines a signature block may hold after the closing phrase.
const MAX_SIGNATURE_LINES: usize = 3;
static HTML_DROP_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>").expect("valid regex")
});
static HTML_LINE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6]|table|blockquote)\s*>").expect("valid regex")
});
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

/// Normalize a raw provider message.
pub fn normalize(raw: &RawMessage) -> NormalizedMessage {
    NormalizedMessage {
        provider_message_id: raw.provider_message_id.clone(),
        subject: normalize_subject(&raw.subject),
        body: normalize_body(&raw.body),
        sender: raw.sender.clone(),
        cc: raw.cc.clone(),
        bcc: raw.bcc.clone(),
        sent_at: raw.sent_at,
        is_reply: raw.is_reply,
        has_attachments: !raw.attachments.is_empty(),
        attachments: raw.attachments.clone(),
    }
}

/// Collapse whitespace in a subject line.
pub fn normalize_subject(subject: &str) -> String {
    subject.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve and clean a body tree.
pub fn normalize_body(body: &BodyPart) -> String {
    let text = extract_text(body).unwrap_or_default();
    clean_text(&text)
}

/// Resolve a body tree to text, applying the plain-over-HTML tie-break at each level.
pub fn extract_text(part: &BodyPart) -> Option<String> {
    match part {
        BodyPart::Plain(text) => non_empty(text.clone()),
        BodyPart::Html(html) => non_empty(html_to_text(html)),
        BodyPart::Other { .. } => None,
        BodyPart::Multipart { children, .. } => {
            let has_plain = children
                .iter()
                .any(|c| matches!(c, BodyPart::Plain(t) if !t.trim().is_empty()));

            let pieces: Vec<String> = children
                .iter()
                .filter(|c| !(has_plain && matches!(c, BodyPart::Html(_))))
                .filter_map(extract_text)
                .collect();

            non_empty(pieces.join("\n\n"))
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() { None } else { Some(text) }
}

/// Reduce HTML to readable text, keeping block boundaries as line breaks.
pub fn html_to_text(html: &str) -> String {
    let without_blocks = HTML_DROP_BLOCK.replace_all(html, "");
    let with_breaks = HTML_LINE_BREAK.replace_all(&without_blocks, "\n");
    let stripped = HTML_TAG.replace_all(&with_breaks, "");
    decode_entities(&stripped)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Clean extracted text into its canonical form.
pub fn clean_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    let text = BRACKETED_LINK.replace_all(&text, "");
    let text = IMAGE_PLACEHOLDER.replace_all(&text, "");
    let text = BARE_LINK.replace_all(&text, "");
    let text = EMAIL_ADDRESS.replace_all(&text, "");

    let lines: Vec<String> = text
        .split('\n')
        .map(|line| INLINE_SPACE.replace_all(line, " ").trim().to_string())
        .collect();

    let lines = strip_sign_off(strip_greeting(lines));

    let joined = lines.join("\n");
    BLANK_RUN.replace_all(&joined, "\n\n").trim().to_string()
}

/// Drop the first non-empty line when it is nothing but a greeting.
fn strip_greeting(mut lines: Vec<String>) -> Vec<String> {
    if let Some(idx) = lines.iter().position(|l| !l.is_empty())
        && GREETING_LINE.is_match(&lines[idx])
    {
        lines.remove(idx);
    }
    lines
}

/// Drop the last sign-off line and the short signature block after it.
fn strip_sign_off(mut lines: Vec<String>) -> Vec<String> {
    if let Some(idx) = lines.iter().rposition(|l| SIGN_OFF_LINE.is_match(l)) {
        let trailing = lines[idx + 1..].iter().filter(|l| !l.is_empty()).count();
        if trailing <= MAX_SIGNATURE_LINES {
            lines.truncate(idx);
        }
    }
    lines
}

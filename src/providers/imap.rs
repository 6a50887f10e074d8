//! Generic IMAP/SMTP adapter.
//!
//! Speaks raw IMAP over rustls on a blocking socket (every call runs in
//! `spawn_blocking`) and sends through lettre's SMTP transport. Messages are
//! identified by their `Message-ID` header with the angle brackets stripped;
//! messages without one fall back to `uid-<n>`. Labels become IMAP keywords.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders, PartType};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ProviderError;
use crate::pipeline::types::{AttachmentMeta, BodyPart, Participant, RawMessage};
use crate::providers::{
    CredentialSource, Cursor, LabelSpec, OutgoingMail, ProviderAdapter, ProviderKind, RemoteLabel,
};
use crate::store::traits::Account;

const PROVIDER: &str = "imap";
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const UID_PREFIX: &str = "uid-";

static MESSAGE_ID_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)message-id:\s*<?([^>\s]+)>?").expect("valid regex"));
static FETCH_UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUID (\d+)").expect("valid regex"));

// ── Configuration ───────────────────────────────────────────────────

/// Server defaults for IMAP accounts. An account's own `server` overrides the IMAP host.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub imap_host: Option<String>,
    pub imap_port: u16,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            imap_host: None,
            imap_port: 993,
            smtp_host: None,
            smtp_port: 587,
        }
    }
}

impl ImapConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            imap_host: std::env::var("MAIL_ASSIST_IMAP_HOST").ok(),
            imap_port: std::env::var("MAIL_ASSIST_IMAP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.imap_port),
            smtp_host: std::env::var("MAIL_ASSIST_SMTP_HOST").ok(),
            smtp_port: std::env::var("MAIL_ASSIST_SMTP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.smtp_port),
        }
    }
}

// ── Adapter ─────────────────────────────────────────────────────────

pub struct ImapAdapter {
    config: ImapConfig,
    credentials: Arc<dyn CredentialSource>,
}

impl ImapAdapter {
    pub fn new(config: ImapConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            config,
            credentials,
        }
    }

    fn imap_host(&self, account: &Account) -> Result<String, ProviderError> {
        account
            .server
            .clone()
            .or_else(|| self.config.imap_host.clone())
            .ok_or_else(|| ProviderError::Unsupported {
                provider: PROVIDER.to_string(),
                operation: format!("no IMAP host configured for {}", account.address),
            })
    }

    fn smtp_host(&self, account: &Account) -> Result<String, ProviderError> {
        if let Some(ref host) = self.config.smtp_host {
            return Ok(host.clone());
        }
        Ok(self.imap_host(account)?.replace("imap", "smtp"))
    }

    /// Open an authenticated session on INBOX and run `op` on a blocking thread.
    async fn with_session<T, F>(&self, account: &Account, op: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, ProviderError> + Send + 'static,
    {
        let password = self.credentials.access_token(account).await?;
        let host = self.imap_host(account)?;
        let port = self.config.imap_port;
        let username = account.address.clone();

        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&host, port, &username, &password)?;
            session.select_inbox()?;
            let result = op(&mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| transient(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl ProviderAdapter for ImapAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn fetch_by_id(&self, account: &Account, id: &str) -> Result<RawMessage, ProviderError> {
        let id = id.to_string();
        self.with_session(account, move |session| {
            let uid = session.resolve_uid(&id)?;
            let response = session.command(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
            let bytes = response.literals.into_iter().next().ok_or_else(|| {
                ProviderError::NotFound {
                    provider: PROVIDER.to_string(),
                    id: id.clone(),
                }
            })?;
            parse_rfc822(&bytes, &id)
        })
        .await
    }

    async fn fetch_ids_since(
        &self,
        account: &Account,
        cursor: Option<&Cursor>,
    ) -> Result<Vec<String>, ProviderError> {
        let since = cursor.and_then(Cursor::as_timestamp);
        self.with_session(account, move |session| {
            let search = match since {
                Some(ts) => format!("UID SEARCH SINCE {}", imap_date(ts)),
                None => "UID SEARCH ALL".to_string(),
            };
            let uids = parse_search(&session.command(&search)?.lines);
            if uids.is_empty() {
                return Ok(Vec::new());
            }

            let set = uids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let response = session.command(&format!(
                "UID FETCH {set} (UID BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])"
            ))?;
            Ok(message_ids_from_headers(&response))
        })
        .await
    }

    async fn list_labels(&self, account: &Account) -> Result<Vec<RemoteLabel>, ProviderError> {
        self.with_session(account, |session| {
            Ok(session
                .keywords
                .iter()
                .map(|k| RemoteLabel {
                    id: k.clone(),
                    name: k.clone(),
                    color: None,
                })
                .collect())
        })
        .await
    }

    /// Keywords exist as soon as they are stored; nothing to create remotely.
    async fn create_label(
        &self,
        _account: &Account,
        spec: &LabelSpec,
    ) -> Result<RemoteLabel, ProviderError> {
        let keyword = keyword_for(&spec.name);
        Ok(RemoteLabel {
            id: keyword.clone(),
            name: keyword,
            color: spec.color.clone(),
        })
    }

    async fn apply_labels(
        &self,
        account: &Account,
        id: &str,
        label_ids: &[String],
    ) -> Result<(), ProviderError> {
        if label_ids.is_empty() {
            return Ok(());
        }
        let id = id.to_string();
        let keywords = label_ids
            .iter()
            .map(|l| keyword_for(l))
            .collect::<Vec<_>>()
            .join(" ");
        self.with_session(account, move |session| {
            let uid = session.resolve_uid(&id)?;
            session.command(&format!("UID STORE {uid} +FLAGS ({keywords})"))?;
            Ok(())
        })
        .await
    }

    async fn move_to_folder(
        &self,
        account: &Account,
        id: &str,
        folder: &str,
    ) -> Result<(), ProviderError> {
        let id = id.to_string();
        let mailbox = quote(folder);
        self.with_session(account, move |session| {
            let uid = session.resolve_uid(&id)?;
            // NO here means the mailbox already exists.
            if let Err(e) = session.command(&format!("CREATE {mailbox}")) {
                tracing::debug!(error = %e, "IMAP CREATE refused");
            }
            session.command(&format!("UID MOVE {uid} {mailbox}"))?;
            Ok(())
        })
        .await
    }

    async fn send(&self, account: &Account, mail: &OutgoingMail) -> Result<(), ProviderError> {
        let password = self.credentials.access_token(account).await?;
        let host = self.smtp_host(account)?;
        let port = self.config.smtp_port;
        let from = account.address.clone();
        let raw = crate::providers::gmail::build_rfc822(&from, mail)?;
        let recipients = mail.to.clone();

        tokio::task::spawn_blocking(move || {
            let transport = SmtpTransport::relay(&host)
                .map_err(|e| transient(format!("SMTP relay error: {e}")))?
                .port(port)
                .credentials(Credentials::new(
                    from.clone(),
                    password.expose_secret().to_string(),
                ))
                .build();

            let envelope = lettre::address::Envelope::new(
                from.parse().ok(),
                recipients.iter().filter_map(|r| r.parse().ok()).collect(),
            )
            .map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("invalid envelope: {e}"),
            })?;

            transport
                .send_raw(&envelope, &raw)
                .map_err(|e| transient(format!("SMTP send failed: {e}")))?;
            tracing::info!(to = ?recipients, "Mail sent over SMTP");
            Ok(())
        })
        .await
        .map_err(|e| transient(format!("SMTP task failed: {e}")))?
    }

    fn supports_folders(&self) -> bool {
        true
    }
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Untagged lines plus any literals (`{n}` payloads) of one command.
#[derive(Debug, Default)]
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
    /// Lines that announced a literal, in literal order.
    literal_lines: Vec<String>,
}

struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
    /// Keywords reported by `SELECT` (`* FLAGS (...)`), system flags excluded.
    keywords: Vec<String>,
}

impl ImapSession {
    fn open(
        host: &str,
        port: u16,
        username: &str,
        password: &SecretString,
    ) -> Result<Self, ProviderError> {
        let tcp = TcpStream::connect((host, port)).map_err(transient)?;
        tcp.set_read_timeout(Some(IO_TIMEOUT)).map_err(transient)?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("invalid server name {host}: {e}"),
            })?;
        let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(transient)?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
            keywords: Vec::new(),
        };

        let _greeting = session.read_line()?;
        session
            .command(&format!(
                "LOGIN {} {}",
                quote(username),
                quote(password.expose_secret())
            ))
            .map_err(|e| ProviderError::AuthExpired {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;
        Ok(session)
    }

    fn select_inbox(&mut self) -> Result<(), ProviderError> {
        let response = self.command("SELECT \"INBOX\"")?;
        self.keywords = parse_flags(&response.lines);
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, ProviderError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).map_err(transient)?;
        if n == 0 {
            return Err(transient("IMAP connection closed"));
        }
        Ok(String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }

    fn command(&mut self, cmd: &str) -> Result<ImapResponse, ProviderError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .map_err(transient)?;
        stream.flush().map_err(transient)?;

        // Never echo arguments: LOGIN carries the password.
        let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let done_prefix = format!("{tag} ");
        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal).map_err(transient)?;
                response.literals.push(literal);
                response.literal_lines.push(line);
                continue;
            }
            if let Some(status) = line.strip_prefix(&done_prefix) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                return Err(ProviderError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: format!("{verb}: {status}"),
                });
            }
            response.lines.push(line);
        }
    }

    /// Map a message id onto the UID in the selected mailbox.
    fn resolve_uid(&mut self, id: &str) -> Result<u32, ProviderError> {
        let not_found = || ProviderError::NotFound {
            provider: PROVIDER.to_string(),
            id: id.to_string(),
        };
        if let Some(uid) = id.strip_prefix(UID_PREFIX) {
            return uid.parse().map_err(|_| not_found());
        }
        let response = self.command(&format!(
            "UID SEARCH HEADER Message-ID {}",
            quote(&format!("<{id}>"))
        ))?;
        parse_search(&response.lines)
            .into_iter()
            .next()
            .ok_or_else(not_found)
    }

    fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT") {
            tracing::debug!(error = %e, "IMAP logout failed");
        }
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

fn transient(e: impl std::fmt::Display) -> ProviderError {
    ProviderError::Transient {
        provider: PROVIDER.to_string(),
        reason: e.to_string(),
    }
}

/// Size of a literal announced at the end of a line (`... {123}`).
fn literal_len(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

fn parse_flags(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* FLAGS ("))
        .flat_map(|rest| {
            rest.trim_end_matches(')')
                .split_whitespace()
                .filter(|f| !f.starts_with('\\'))
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Pair each fetched header literal with its UID and pull the message id.
fn message_ids_from_headers(response: &ImapResponse) -> Vec<String> {
    response
        .literal_lines
        .iter()
        .zip(&response.literals)
        .filter_map(|(line, literal)| {
            let header = String::from_utf8_lossy(literal);
            match MESSAGE_ID_HEADER.captures(&header) {
                Some(c) => Some(strip_angle_brackets(&c[1]).to_string()),
                None => FETCH_UID
                    .captures(line)
                    .map(|c| format!("{UID_PREFIX}{}", &c[1])),
            }
        })
        .collect()
}

fn strip_angle_brackets(id: &str) -> &str {
    id.trim().trim_start_matches('<').trim_end_matches('>')
}

fn imap_date(ts: DateTime<Utc>) -> String {
    ts.format("%d-%b-%Y").to_string()
}

/// IMAP keyword for a label name (atoms cannot carry spaces or specials).
fn keyword_for(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            '(' | ')' | '{' | '}' | '%' | '*' | '"' | '\\' | ']' => None,
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect()
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse an RFC 822 message into the provider-neutral raw form.
fn parse_rfc822(bytes: &[u8], id: &str) -> Result<RawMessage, ProviderError> {
    let parsed = MessageParser::default()
        .parse(bytes)
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("unparseable message {id}"),
        })?;

    let sender = addresses(parsed.from())
        .into_iter()
        .next()
        .unwrap_or_else(|| Participant::new(None, "unknown"));
    let sent_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let mut attachments = Vec::new();
    let body = if parsed.parts.is_empty() {
        BodyPart::Plain(String::new())
    } else {
        part_to_body(&parsed, 0, &mut attachments)
    };

    Ok(RawMessage {
        provider_message_id: parsed
            .message_id()
            .map(|m| strip_angle_brackets(m).to_string())
            .unwrap_or_else(|| id.to_string()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        sender,
        cc: addresses(parsed.cc()),
        bcc: addresses(parsed.bcc()),
        body,
        sent_at,
        is_reply: !matches!(parsed.in_reply_to(), HeaderValue::Empty),
        attachments,
    })
}

fn addresses(address: Option<&Address>) -> Vec<Participant> {
    let addrs: Vec<&mail_parser::Addr> = match address {
        Some(Address::List(list)) => list.iter().collect(),
        Some(Address::Group(groups)) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
        None => Vec::new(),
    };
    addrs
        .into_iter()
        .filter_map(|a| Some(Participant::new(a.name(), a.address()?)))
        .collect()
}

fn part_to_body(
    message: &mail_parser::Message,
    index: usize,
    attachments: &mut Vec<AttachmentMeta>,
) -> BodyPart {
    let Some(part) = message.parts.get(index) else {
        return BodyPart::Other {
            mime_type: "application/octet-stream".to_string(),
        };
    };
    let mime_type = part
        .content_type()
        .map(|ct| format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or("")))
        .unwrap_or_else(|| "text/plain".to_string());

    if let Some(name) = part.attachment_name() {
        attachments.push(AttachmentMeta {
            provider_attachment_id: None,
            filename: name.to_string(),
        });
        return BodyPart::Other { mime_type };
    }

    match &part.body {
        PartType::Text(text) => BodyPart::Plain(text.to_string()),
        PartType::Html(html) => BodyPart::Html(html.to_string()),
        PartType::Multipart(children) => BodyPart::Multipart {
            subtype: part
                .content_type()
                .and_then(|ct| ct.subtype())
                .unwrap_or("mixed")
                .to_string(),
            children: children
                .iter()
                .map(|&child| part_to_body(message, child as usize, attachments))
                .collect(),
        },
        _ => BodyPart::Other { mime_type },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALTERNATIVE: &str = "From: \"Frank Ops\" <frank@ops.example>\r\n\
To: me@example.com\r\n\
Cc: Gina <gina@example.com>\r\n\
Subject: Deploy window\r\n\
Message-ID: <deploy-42@ops.example>\r\n\
In-Reply-To: <deploy-41@ops.example>\r\n\
Date: Tue, 6 Jan 2026 14:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Window is 14:00 UTC.\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Window is <b>14:00</b> UTC.</p>\r\n\
--b1--\r\n";

    // ── Message parsing tests ───────────────────────────────────────

    #[test]
    fn parses_multipart_alternative() {
        let raw = parse_rfc822(ALTERNATIVE.as_bytes(), "uid-1").unwrap();
        assert_eq!(raw.provider_message_id, "deploy-42@ops.example");
        assert_eq!(raw.subject, "Deploy window");
        assert_eq!(raw.sender.address, "frank@ops.example");
        assert_eq!(raw.sender.name.as_deref(), Some("Frank Ops"));
        assert_eq!(raw.cc.len(), 1);
        assert!(raw.is_reply);
        assert_eq!(raw.sent_at.to_rfc3339(), "2026-01-06T14:00:00+00:00");

        let BodyPart::Multipart { subtype, children } = raw.body else {
            panic!("expected multipart");
        };
        assert_eq!(subtype, "alternative");
        assert_eq!(children.len(), 2);
        assert!(matches!(&children[0], BodyPart::Plain(t) if t.contains("Window is 14:00 UTC.")));
        assert!(matches!(&children[1], BodyPart::Html(h) if h.contains("<b>14:00</b>")));
    }

    #[test]
    fn missing_message_id_keeps_lookup_id() {
        let msg = "From: a@b.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let raw = parse_rfc822(msg.as_bytes(), "uid-7").unwrap();
        assert_eq!(raw.provider_message_id, "uid-7");
        assert!(!raw.is_reply);
    }

    // ── Protocol helper tests ───────────────────────────────────────

    #[test]
    fn literal_length_detection() {
        assert_eq!(literal_len("* 1 FETCH (UID 5 BODY[] {342}"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (UID 5 BODY[] {12+}"), Some(12));
        assert_eq!(literal_len("* OK done"), None);
    }

    #[test]
    fn search_and_flags_parsing() {
        let lines = vec![
            "* FLAGS (\\Answered \\Seen important_ Answer_Required)".to_string(),
            "* SEARCH 3 9 12".to_string(),
        ];
        assert_eq!(parse_search(&lines), vec![3, 9, 12]);
        assert_eq!(parse_flags(&lines), vec!["important_", "Answer_Required"]);
    }

    #[test]
    fn header_literals_yield_ids() {
        let response = ImapResponse {
            lines: Vec::new(),
            literal_lines: vec![
                "* 1 FETCH (UID 10 BODY[HEADER.FIELDS (MESSAGE-ID)] {40}".into(),
                "* 2 FETCH (UID 11 BODY[HEADER.FIELDS (MESSAGE-ID)] {2}".into(),
            ],
            literals: vec![
                b"Message-ID:\r\n <abc@host.example>\r\n\r\n".to_vec(),
                b"\r\n".to_vec(),
            ],
        };
        assert_eq!(
            message_ids_from_headers(&response),
            vec!["abc@host.example", "uid-11"]
        );
    }

    #[test]
    fn keyword_and_quote_escaping() {
        assert_eq!(keyword_for("Answer Required"), "Answer_Required");
        assert_eq!(keyword_for("a(b)\"c"), "abc");
        assert_eq!(quote("p\"w\\d"), "\"p\\\"w\\\\d\"");
        assert_eq!(strip_angle_brackets(" <id@x> "), "id@x");
    }

    #[test]
    fn imap_date_format() {
        let ts = DateTime::parse_from_rfc3339("2026-02-03T23:59:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(imap_date(ts), "03-Feb-2026");
    }

    #[test]
    fn smtp_host_derived_from_imap_host() {
        let adapter = ImapAdapter::new(
            ImapConfig {
                imap_host: Some("imap.mail.example".into()),
                ..ImapConfig::default()
            },
            Arc::new(crate::providers::StaticCredentials::new()),
        );
        let account = Account::new("o", ProviderKind::Imap, "me@mail.example", "c");
        assert_eq!(adapter.smtp_host(&account).unwrap(), "smtp.mail.example");

        let mut custom = account.clone();
        custom.server = Some("imap.other.example".into());
        assert_eq!(adapter.imap_host(&custom).unwrap(), "imap.other.example");
    }
}

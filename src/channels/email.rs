//! Email mailbox: IMAP polling for inbound, SMTP via lettre for outbound.
//!
//! Messages are fetched with `BODY.PEEK[]` so fetching never sets `\Seen`.
//! The poller acknowledges each message with `mark_handled` once it has
//! been replied to or deliberately skipped.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use rustls_pki_types::{InvalidDnsNameError, ServerName};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::config::{env_parse, env_required};
use crate::error::{ChannelError, ConfigError};
use crate::pipeline::types::{IncomingEmail, MailSource, Whitelist};

const CHANNEL_NAME: &str = "email";

/// Socket read timeout for IMAP sessions.
const IMAP_READ_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub whitelist: Whitelist,
}

impl EmailConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let imap_host = env_required(lookup, "EMAIL_IMAP_HOST")?;
        let imap_port: u16 = env_parse(lookup, "EMAIL_IMAP_PORT", 993)?;
        let smtp_host = lookup("EMAIL_SMTP_HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port: u16 = env_parse(lookup, "EMAIL_SMTP_PORT", 587)?;
        let username = env_required(lookup, "EMAIL_USERNAME")?;
        let password = SecretString::from(env_required(lookup, "EMAIL_PASSWORD")?);
        let from_address = lookup("EMAIL_FROM_ADDRESS")
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| username.clone());
        let whitelist = Whitelist::parse(&lookup("EMAIL_WHITELIST").unwrap_or_default());

        Ok(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            whitelist,
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP + SMTP implementation of `MailSource`.
pub struct ImapSmtpMailbox {
    config: Arc<EmailConfig>,
}

impl ImapSmtpMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MailSource for ImapSmtpMailbox {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn whitelist(&self) -> &Whitelist {
        &self.config.whitelist
    }

    fn own_address(&self) -> &str {
        &self.config.from_address
    }

    async fn fetch_new(&self) -> Result<Vec<IncomingEmail>, ChannelError> {
        let cfg = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("fetch task panicked: {e}"),
            })?
            .map_err(|e| e.into_channel_error("fetch"))
    }

    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let cfg = Arc::clone(&self.config);
        let (to, subject, body) = (to.to_string(), subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || send_smtp(&cfg, &to, &subject, &body))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("send task panicked: {e}"),
            })?
    }

    async fn mark_handled(&self, ids: &[String]) -> Result<(), ChannelError> {
        if ids.is_empty() {
            return Ok(());
        }
        let cfg = Arc::clone(&self.config);
        let uids = ids.to_vec();
        tokio::task::spawn_blocking(move || mark_seen_imap(&cfg, &uids))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("mark-seen task panicked: {e}"),
            })?
            .map_err(|e| e.into_channel_error("mark seen"))
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: CHANNEL_NAME.into(),
        reason,
    }
}

/// Send a plain-text email (blocking, run in spawn_blocking).
fn send_smtp(config: &EmailConfig, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    // 465 speaks TLS from the first byte; everything else upgrades.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    }
    .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?;

    let transport = builder
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let email = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    info!(to = %to, "Email sent");
    Ok(())
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Failures inside a blocking IMAP session.
#[derive(Debug, thiserror::Error)]
enum ImapError {
    #[error("IMAP login rejected: {0}")]
    Login(String),

    #[error("IMAP command failed: {0}")]
    Command(String),

    #[error("IMAP connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Invalid IMAP host name: {0}")]
    ServerName(#[from] InvalidDnsNameError),
}

impl ImapError {
    fn into_channel_error(self, op: &str) -> ChannelError {
        match self {
            Self::Login(reason) => ChannelError::AuthFailed {
                name: CHANNEL_NAME.into(),
                reason,
            },
            other => ChannelError::FetchFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("{op}: {other}"),
            },
        }
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Lines of a tagged command's response, plus any literals it carried.
#[derive(Debug, Default)]
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// A logged-in IMAP session with INBOX selected.
struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    fn open(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(IMAP_READ_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };

        let _greeting = session.read_line()?;

        let login = format!(
            "LOGIN {} {}",
            quote_imap(&config.username),
            quote_imap(config.password.expose_secret())
        );
        session.command(&login).map_err(|e| match e {
            ImapError::Command(reason) => ImapError::Login(reason),
            other => other,
        })?;
        session.command("SELECT \"INBOX\"")?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        if self.stream.read_until(b'\n', &mut buf)? == 0 {
            return Err(ImapError::Closed);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a command and collect its response up to the tagged status line.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            if let Some(status) = line.strip_prefix(&tag) {
                let status = status.trim();
                if !status.starts_with("OK") {
                    return Err(ImapError::Command(status.to_string()));
                }
                response.lines.push(line);
                return Ok(response);
            }
            response.lines.push(line);
        }
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Fetch unseen emails without marking them (blocking, run in spawn_blocking).
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<IncomingEmail>, ImapError> {
    let mut session = ImapSession::open(config)?;

    let search = session.command("UID SEARCH UNSEEN")?;
    let uids = parse_search_response(&search.lines);
    debug!(count = uids.len(), "Unseen messages on server");

    let mut raw_messages = Vec::with_capacity(uids.len());
    for uid in uids {
        let fetched = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        match fetched.literals.into_iter().next() {
            Some(raw) => raw_messages.push((uid, raw)),
            None => debug!(uid = %uid, "FETCH returned no body"),
        }
    }

    let (results, unreadable) = parse_fetched(raw_messages);
    if !unreadable.is_empty() {
        // The poller never sees these UIDs, so acknowledge them here.
        warn!(uids = ?unreadable, "Marking unparseable messages as seen");
        session.command(&store_seen_command(&unreadable))?;
    }

    session.logout();
    Ok(results)
}

/// Set `\Seen` on the given UIDs (blocking, run in spawn_blocking).
fn mark_seen_imap(config: &EmailConfig, uids: &[String]) -> Result<(), ImapError> {
    let mut session = ImapSession::open(config)?;
    session.command(&store_seen_command(uids))?;
    session.logout();
    Ok(())
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Quote a string for use as an IMAP quoted-string argument.
pub fn quote_imap(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Byte count of a literal announced at the end of a line (`... {123}\r\n`).
pub fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

/// Collect UIDs from `* SEARCH` untagged responses.
pub fn parse_search_response(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(str::split_whitespace)
        .filter(|uid| uid.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// `UID STORE` command that sets `\Seen` on `uids`.
pub fn store_seen_command(uids: &[String]) -> String {
    format!("UID STORE {} +FLAGS (\\Seen)", uids.join(","))
}

/// Parse fetched `(uid, raw)` pairs. Returns the parsed emails and the UIDs
/// of messages that could not be parsed (no sender address or bad MIME).
pub fn parse_fetched(raw_messages: Vec<(String, Vec<u8>)>) -> (Vec<IncomingEmail>, Vec<String>) {
    let mut emails = Vec::with_capacity(raw_messages.len());
    let mut unreadable = Vec::new();
    for (uid, raw) in raw_messages {
        match parse_incoming(&uid, &raw) {
            Some(email) => emails.push(email),
            None => unreadable.push(uid),
        }
    }
    (emails, unreadable)
}

/// Turn a raw RFC 822 message into an `IncomingEmail`.
pub fn parse_incoming(uid: &str, raw: &[u8]) -> Option<IncomingEmail> {
    let parsed = MessageParser::default().parse(raw)?;
    let (sender_address, sender_name) = extract_sender(&parsed)?;
    Some(IncomingEmail {
        id: uid.to_string(),
        body: extract_text(&parsed),
        sender_name,
        sender_address,
    })
}

/// Sender address and display name. The name falls back to the address.
fn extract_sender(parsed: &mail_parser::Message) -> Option<(String, String)> {
    let addr = parsed.from().and_then(|a| a.first())?;
    let address = addr.address()?.to_string();
    let name = addr
        .name()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| address.clone());
    Some((address, name))
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.trim().to_string();
        }
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ───────────────────────────────────────────────────────────

//! Shared types for the email pipeline.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ChannelError;

/// Sentinel used when the model could not find a sender name.
pub const UNKNOWN_NAME: &str = "Unknown";

// ── Incoming email ──────────────────────────────────────────────────

/// One message fetched from the mail source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingEmail {
    /// Mailbox-local identifier (IMAP UID), used to acknowledge the message.
    pub id: String,
    /// Plain-text body.
    pub body: String,
    /// Display name from the From header (falls back to the address).
    pub sender_name: String,
    /// Bare sender address.
    pub sender_address: String,
}

// ── Extracted properties ────────────────────────────────────────────

/// What the customer is writing about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Complaint,
    RefundRequest,
    ProductFeedback,
    CustomerService,
    #[default]
    Other,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Self::Complaint,
        Self::RefundRequest,
        Self::ProductFeedback,
        Self::CustomerService,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complaint => "complaint",
            Self::RefundRequest => "refund_request",
            Self::ProductFeedback => "product_feedback",
            Self::CustomerService => "customer_service",
            Self::Other => "other",
        }
    }

    /// Lenient parse of a model-supplied label. Anything unrecognised is
    /// `Other`.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .unwrap_or(Self::Other)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured fields pulled out of an email by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedProperties {
    pub category: Category,
    pub mentioned_product: String,
    pub issue_description: String,
    pub name: String,
}

impl ExtractedProperties {
    /// Whether the model found a usable sender name.
    pub fn has_known_name(&self) -> bool {
        let name = self.name.trim();
        !name.is_empty() && !name.eq_ignore_ascii_case(UNKNOWN_NAME)
    }
}

// ── Pipeline outcome ────────────────────────────────────────────────

/// Result of running one email through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when extraction failed.
    pub properties: Option<ExtractedProperties>,
    /// Body for the outgoing email.
    pub reply: String,
}

// ── Whitelist ───────────────────────────────────────────────────────

/// Sender addresses allowed to trigger an automated reply.
///
/// Matching is exact and case-sensitive. An empty whitelist denies
/// everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    addresses: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated list, ignoring blanks.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        )
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Sorted addresses, for startup logging.
    pub fn sorted(&self) -> Vec<&str> {
        let mut list: Vec<&str> = self.addresses.iter().map(String::as_str).collect();
        list.sort_unstable();
        list
    }
}

// ── Mail source trait ───────────────────────────────────────────────

/// The mailbox the poller reads from and replies through. Pure I/O.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Channel name (e.g. "email").
    fn name(&self) -> &str;

    /// Addresses allowed to get automated replies.
    fn whitelist(&self) -> &Whitelist;

    /// Address replies are sent from, used to skip our own mail.
    fn own_address(&self) -> &str;

    /// Messages not yet acknowledged.
    async fn fetch_new(&self) -> Result<Vec<IncomingEmail>, ChannelError>;

    /// Send a plain-text email.
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError>;

    /// Mark messages as handled so the next fetch skips them.
    async fn mark_handled(&self, ids: &[String]) -> Result<(), ChannelError>;
}

//! Mail I/O: the IMAP/SMTP mailbox and the poller that drives the pipeline.

pub mod email;
pub mod email_poller;

pub use email::{EmailConfig, ImapSmtpMailbox};
pub use email_poller::{REPLY_SUBJECT, ScanReport, poll_once, spawn_email_poller};

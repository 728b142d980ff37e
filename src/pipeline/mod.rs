//! Email processing pipeline.
//!
//! Every whitelisted inbound email flows through:
//! 1. `FieldExtractor::extract()`: LLM turns the body into structured fields
//! 2. `ReplyComposer::compose()`: LLM drafts a support reply from those fields
//!
//! `EmailProcessor` ties the two together; the poller in
//! `channels::email_poller` feeds it and sends the replies.

pub mod composer;
pub mod extractor;
pub mod processor;
pub mod types;

pub use composer::ReplyComposer;
pub use extractor::FieldExtractor;
pub use processor::{EXTRACTION_FAILED_REPLY, EmailProcessor};
pub use types::{
    Category, ExtractedProperties, IncomingEmail, MailSource, ProcessOutcome, Whitelist,
};

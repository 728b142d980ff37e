//! Email processor: runs one email through extraction and composition.
//!
//! Flow:
//! 1. `FieldExtractor::extract()` → structured fields
//! 2. `ReplyComposer::compose()` → reply text
//!
//! The composer is never called when extraction fails.

use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, info};

use crate::error::{ExtractionError, PipelineError};
use crate::pipeline::composer::ReplyComposer;
use crate::pipeline::extractor::FieldExtractor;
use crate::pipeline::types::{IncomingEmail, ProcessOutcome};

/// Reply text produced when the model output could not be parsed.
pub const EXTRACTION_FAILED_REPLY: &str = "Error: Could not extract properties.";

/// Ties the extractor and composer together. Holds no per-email state.
pub struct EmailProcessor {
    extractor: FieldExtractor,
    composer: ReplyComposer,
}

impl EmailProcessor {
    pub fn new(extractor: FieldExtractor, composer: ReplyComposer) -> Self {
        Self {
            extractor,
            composer,
        }
    }

    /// Process a single email.
    ///
    /// Malformed model output is a normal outcome with no properties. A
    /// model-client failure is an error so the caller can decide whether to
    /// retry the email later.
    pub async fn process(&self, email: &IncomingEmail) -> Result<ProcessOutcome, PipelineError> {
        debug!(id = %email.id, sender = %email.sender_address, "Extracting properties");

        let properties = match self.extractor.extract(&email.body).await {
            Ok(props) => props,
            Err(ExtractionError::MalformedResponse { .. }) => {
                return Ok(ProcessOutcome {
                    properties: None,
                    reply: EXTRACTION_FAILED_REPLY.to_string(),
                });
            }
            Err(ExtractionError::Llm(e)) => return Err(PipelineError::Llm(e)),
        };

        info!(
            id = %email.id,
            category = %properties.category,
            product = %properties.mentioned_product,
            "Extracted properties"
        );

        let reply = self.composer.compose(&properties).await;

        Ok(ProcessOutcome {
            properties: Some(properties),
            reply,
        })
    }

    /// Process emails through a sliding window of `max_concurrent` in-flight
    /// calls. A new email starts as soon as the oldest one finishes.
    ///
    /// Emails are pulled from `emails` lazily, so an iterator that stops
    /// yielding (e.g. on shutdown) stops new work without cancelling the
    /// emails already in flight. Results come back in input order.
    pub fn process_stream<'a, I>(
        &'a self,
        emails: I,
        max_concurrent: usize,
    ) -> impl Stream<Item = (IncomingEmail, Result<ProcessOutcome, PipelineError>)> + 'a
    where
        I: IntoIterator<Item = IncomingEmail>,
        I::IntoIter: 'a,
    {
        stream::iter(emails)
            .map(move |email| async move {
                let result = self.process(&email).await;
                (email, result)
            })
            .buffered(max_concurrent.max(1))
    }

    /// Process a batch with at most `max_concurrent` emails in flight.
    ///
    /// Results come back in input order, each paired with its email.
    pub async fn process_batch(
        &self,
        emails: Vec<IncomingEmail>,
        max_concurrent: usize,
    ) -> Vec<(IncomingEmail, Result<ProcessOutcome, PipelineError>)> {
        self.process_stream(emails, max_concurrent).collect().await
    }
}

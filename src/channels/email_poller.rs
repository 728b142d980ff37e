//! Inbox poller: fetches new mail, runs it through the pipeline, replies.
//!
//! Each scan:
//! 1. Fetches unacknowledged emails from the `MailSource`
//! 2. Skips senders outside the whitelist (and our own address)
//! 3. Runs survivors through `EmailProcessor`
//! 4. Sends the reply and acknowledges the message
//!
//! Failures are contained per email: a message whose model call or reply
//! failed stays unacknowledged and is picked up again next scan.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PollerConfig;
use crate::error::PipelineError;
use crate::pipeline::processor::EmailProcessor;
use crate::pipeline::types::{IncomingEmail, MailSource, ProcessOutcome};

/// Subject line of every automated reply.
pub const REPLY_SUBJECT: &str = "AI Customer Service Reply";

/// Granularity of the stop-flag check while sleeping between scans.
const STOP_CHECK_STEP: Duration = Duration::from_secs(1);

/// Counters for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Messages returned by the mail source.
    pub fetched: usize,
    /// Skipped because the sender is not whitelisted, or is us.
    pub ignored: usize,
    /// Replies sent.
    pub replied: usize,
    /// Extraction failed and no reply was sent by policy.
    pub unanswered: usize,
    /// Model or send failures; left for the next scan.
    pub failed: usize,
}

/// Spawn a background task that polls the mailbox until stopped.
///
/// Returns a `JoinHandle` and a stop flag. Set the flag to stop polling;
/// the task exits after the current email.
pub fn spawn_email_poller(
    mailbox: Arc<dyn MailSource>,
    processor: Arc<EmailProcessor>,
    config: PollerConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let handle = tokio::spawn(async move {
        info!(
            channel = mailbox.name(),
            interval_secs = config.interval.as_secs(),
            "Email poller started"
        );

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            debug!("Checking for new emails");
            let report = poll_once(mailbox.as_ref(), &processor, &config, &stop).await;
            if report.fetched > 0 {
                info!(
                    fetched = report.fetched,
                    ignored = report.ignored,
                    replied = report.replied,
                    unanswered = report.unanswered,
                    failed = report.failed,
                    "Scan complete"
                );
            }

            sleep_unless_stopped(config.interval, &stop).await;
        }

        info!("Email poller shutting down");
    });

    (handle, stop_flag)
}

/// Run a single scan: fetch → filter → process → reply → acknowledge.
pub async fn poll_once(
    mailbox: &dyn MailSource,
    processor: &EmailProcessor,
    config: &PollerConfig,
    stop: &AtomicBool,
) -> ScanReport {
    let mut report = ScanReport::default();

    let emails = match mailbox.fetch_new().await {
        Ok(emails) => emails,
        Err(e) => {
            error!(error = %e, "Email fetch failed");
            return report;
        }
    };
    report.fetched = emails.len();
    if emails.is_empty() {
        return report;
    }

    let mut handled: Vec<String> = Vec::new();
    let mut candidates: Vec<IncomingEmail> = Vec::with_capacity(emails.len());

    for email in emails {
        if email.sender_address == mailbox.own_address() {
            debug!(sender = %email.sender_address, "Skipping self-sent email");
            report.ignored += 1;
            handled.push(email.id);
            continue;
        }
        if !mailbox.whitelist().contains(&email.sender_address) {
            info!(
                sender_name = %email.sender_name,
                sender = %email.sender_address,
                "Ignored email - not in whitelist"
            );
            report.ignored += 1;
            handled.push(email.id);
            continue;
        }
        candidates.push(email);
    }

    // The stop flag is checked each time the window pulls a new email, so
    // shutdown lets in-flight emails finish but starts nothing new.
    let total = candidates.len();
    let mut started = 0usize;
    let pending = candidates.into_iter().take_while(|_| {
        let go = !stop.load(Ordering::Relaxed);
        started += usize::from(go);
        go
    });
    {
        let mut results = pin!(processor.process_stream(pending, config.max_concurrent));
        while let Some((email, result)) = results.next().await {
            if deliver(mailbox, config, &email, result, &mut report).await {
                handled.push(email.id);
            }
        }
    }
    if started < total {
        info!(
            skipped = total - started,
            "Stop requested, leaving remaining emails for later"
        );
    }

    if let Err(e) = mailbox.mark_handled(&handled).await {
        warn!(error = %e, count = handled.len(), "Failed to acknowledge emails");
    }

    report
}

/// Send the reply for one pipeline result. Returns whether the email is
/// done with and can be acknowledged.
async fn deliver(
    mailbox: &dyn MailSource,
    config: &PollerConfig,
    email: &IncomingEmail,
    result: Result<ProcessOutcome, PipelineError>,
    report: &mut ScanReport,
) -> bool {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(PipelineError::Llm(e)) if e.is_transient() => {
            warn!(id = %email.id, error = %e, "Model call failed, will retry next scan");
            report.failed += 1;
            return false;
        }
        Err(e) => {
            error!(id = %email.id, error = %e, "Email processing failed");
            report.failed += 1;
            return false;
        }
    };

    if outcome.properties.is_none() && !config.reply_on_extraction_failure {
        warn!(
            id = %email.id,
            sender = %email.sender_address,
            "Could not extract properties, not replying"
        );
        report.unanswered += 1;
        return true;
    }

    match mailbox
        .send_email(&email.sender_address, REPLY_SUBJECT, &outcome.reply)
        .await
    {
        Ok(()) => {
            info!(
                sender_name = %email.sender_name,
                sender = %email.sender_address,
                "Replied to email"
            );
            report.replied += 1;
            true
        }
        Err(e) => {
            error!(id = %email.id, error = %e, "Failed to send reply");
            report.failed += 1;
            false
        }
    }
}

async fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let nap = remaining.min(STOP_CHECK_STEP);
        tokio::time::sleep(nap).await;
        remaining -= nap;
    }
}

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mailbot::channels::{ImapSmtpMailbox, spawn_email_poller};
use mailbot::config::AppConfig;
use mailbot::llm::create_provider;
use mailbot::pipeline::{EmailProcessor, FieldExtractor, ReplyComposer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let _log_guard = init_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 mailbot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Model: {} ({})",
        config.llm.model,
        config.llm.backend.label()
    );
    eprintln!(
        "   Mailbox: {} (IMAP: {}, SMTP: {})",
        config.email.from_address, config.email.imap_host, config.email.smtp_host
    );
    eprintln!(
        "   Whitelist: {}",
        if config.email.whitelist.is_empty() {
            "none (deny all)".to_string()
        } else {
            config.email.whitelist.sorted().join(", ")
        }
    );
    eprintln!(
        "   Polling every {}s, signing as {}\n",
        config.poller.interval.as_secs(),
        config.support.signature_name
    );

    let llm = create_provider(&config.llm).context("failed to create LLM provider")?;

    let processor = Arc::new(EmailProcessor::new(
        FieldExtractor::new(Arc::clone(&llm), &config.support),
        ReplyComposer::new(llm, &config.support),
    ));
    let mailbox = Arc::new(ImapSmtpMailbox::new(config.email));

    let (mut handle, stop) = spawn_email_poller(mailbox, processor, config.poller);

    tokio::select! {
        result = &mut handle => {
            result.context("email poller task failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, stopping after the current email");
            stop.store(true, Ordering::Relaxed);
            handle.await.context("email poller task failed")?;
        }
    }

    Ok(())
}

/// Console logging, plus daily-rolling files when `MAILBOT_LOG_DIR` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match std::env::var("MAILBOT_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "mailbot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    guard
}

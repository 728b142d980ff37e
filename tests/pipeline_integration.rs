//! End-to-end tests for the email pipeline and poller.
//!
//! A scripted model stands in for the LLM and an in-memory mailbox for
//! IMAP/SMTP, so every test runs offline through the public API.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mailbot::channels::{REPLY_SUBJECT, poll_once};
use mailbot::config::{PollerConfig, SupportConfig};
use mailbot::error::{ChannelError, LlmError};
use mailbot::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use mailbot::pipeline::{
    Category, EmailProcessor, FieldExtractor, IncomingEmail, MailSource, ReplyComposer, Whitelist,
};

const JANE_BODY: &str = "My toaster Model Z won't turn on. – Jane";
const JANE_EXTRACTION: &str = r#"{"category":"complaint","mentioned_product":"Model Z","issue_description":"won't turn on","name":"Jane"}"#;

/// Answers extraction prompts with a fixed string and reply prompts by
/// following the salutation instruction, like a well-behaved model.
struct ScriptedModel {
    extraction: String,
    extraction_calls: Mutex<Vec<String>>,
    reply_calls: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(extraction: &str) -> Arc<Self> {
        Arc::new(Self {
            extraction: extraction.to_string(),
            extraction_calls: Mutex::new(Vec::new()),
            reply_calls: Mutex::new(Vec::new()),
        })
    }

    fn reply_count(&self) -> usize {
        self.reply_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request.user_prompt();
        let content = if prompt.starts_with("Extract") {
            self.extraction_calls.lock().unwrap().push(prompt);
            self.extraction.clone()
        } else {
            let salutation = prompt
                .split('"')
                .nth(1)
                .unwrap_or("Hello,")
                .to_string();
            self.reply_calls.lock().unwrap().push(prompt);
            format!("{salutation}\n\nThanks for reaching out, we will fix this.\n\nJohn Doe")
        };
        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

struct FakeMailbox {
    inbox: Vec<IncomingEmail>,
    whitelist: Whitelist,
    sent: Mutex<Vec<(String, String, String)>>,
    handled: Mutex<Vec<String>>,
}

impl FakeMailbox {
    fn new(inbox: Vec<IncomingEmail>, whitelist: &[&str]) -> Self {
        Self {
            inbox,
            whitelist: Whitelist::new(whitelist.iter().copied()),
            sent: Mutex::new(Vec::new()),
            handled: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MailSource for FakeMailbox {
    fn name(&self) -> &str {
        "fake"
    }

    fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    fn own_address(&self) -> &str {
        "support@shop.example"
    }

    async fn fetch_new(&self) -> Result<Vec<IncomingEmail>, ChannelError> {
        Ok(self.inbox.clone())
    }

    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.into(), subject.into(), body.into()));
        Ok(())
    }

    async fn mark_handled(&self, ids: &[String]) -> Result<(), ChannelError> {
        self.handled.lock().unwrap().extend_from_slice(ids);
        Ok(())
    }
}

fn processor(model: &Arc<ScriptedModel>) -> EmailProcessor {
    let llm: Arc<dyn LlmProvider> = model.clone();
    let config = SupportConfig::default();
    EmailProcessor::new(
        FieldExtractor::new(Arc::clone(&llm), &config),
        ReplyComposer::new(llm, &config),
    )
}

fn email(id: &str, address: &str, body: &str) -> IncomingEmail {
    IncomingEmail {
        id: id.into(),
        body: body.into(),
        sender_name: "Jane".into(),
        sender_address: address.into(),
    }
}

#[tokio::test]
async fn end_to_end_reply_for_jane() {
    let model = ScriptedModel::new(JANE_EXTRACTION);
    let mailbox = FakeMailbox::new(vec![email("7", "jane@x.com", JANE_BODY)], &["jane@x.com"]);
    let stop = AtomicBool::new(false);

    let report = poll_once(&mailbox, &processor(&model), &PollerConfig::default(), &stop).await;
    assert_eq!(report.replied, 1);

    // Extraction saw the body verbatim.
    assert!(model.extraction_calls.lock().unwrap()[0].contains(JANE_BODY));

    // Composer got exactly the extracted fields.
    let reply_prompt = model.reply_calls.lock().unwrap()[0].clone();
    assert!(reply_prompt.contains("Dear Jane"));
    assert!(reply_prompt.contains("complaint"));
    assert!(reply_prompt.contains("Model Z"));
    assert!(reply_prompt.contains("won't turn on"));

    let sent = mailbox.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (to, subject, body) = &sent[0];
    assert_eq!(to, "jane@x.com");
    assert_eq!(subject, "AI Customer Service Reply");
    assert_eq!(subject, REPLY_SUBJECT);
    assert!(!body.trim().is_empty());
    assert!(body.starts_with("Dear Jane,"));

    assert_eq!(*mailbox.handled.lock().unwrap(), vec!["7".to_string()]);
}

#[tokio::test]
async fn whitelist_filters_before_pipeline() {
    let model = ScriptedModel::new(JANE_EXTRACTION);
    let mailbox = FakeMailbox::new(
        vec![
            email("1", "a@x.com", "first"),
            email("2", "b@x.com", "second"),
        ],
        &["a@x.com"],
    );
    let stop = AtomicBool::new(false);

    poll_once(&mailbox, &processor(&model), &PollerConfig::default(), &stop).await;

    let extraction_calls = model.extraction_calls.lock().unwrap();
    assert_eq!(extraction_calls.len(), 1);
    assert!(extraction_calls[0].contains("first"));
    let sent = mailbox.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "a@x.com");
}

#[tokio::test]
async fn whitelist_match_is_case_sensitive() {
    let model = ScriptedModel::new(JANE_EXTRACTION);
    let mailbox = FakeMailbox::new(vec![email("1", "A@x.com", JANE_BODY)], &["a@x.com"]);
    let stop = AtomicBool::new(false);

    let report = poll_once(&mailbox, &processor(&model), &PollerConfig::default(), &stop).await;

    assert_eq!(report.ignored, 1);
    assert!(model.extraction_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_name_reply_opens_with_dear_customer() {
    let model = ScriptedModel::new(
        "```json\n{\"category\":\"other\",\"mentioned_product\":\"\",\"issue_description\":\"question\",\"name\":\"Unknown\"}\n```",
    );
    let outcome = processor(&model)
        .process(&email("1", "a@x.com", "Do you ship abroad?"))
        .await
        .unwrap();

    let props = outcome.properties.unwrap();
    assert_eq!(props.category, Category::Other);
    assert_eq!(props.name, "Unknown");
    assert!(outcome.reply.starts_with("Dear customer"));
}

#[tokio::test]
async fn malformed_extraction_never_reaches_composer() {
    let model = ScriptedModel::new("I'm not sure what you mean.");
    let outcome = processor(&model)
        .process(&email("1", "a@x.com", JANE_BODY))
        .await
        .unwrap();

    assert!(outcome.properties.is_none());
    assert_eq!(outcome.reply, "Error: Could not extract properties.");
    assert_eq!(model.reply_count(), 0);
}

#[tokio::test]
async fn out_of_enum_category_is_coerced() {
    let model = ScriptedModel::new(r#"{"category":"compliment","name":"Ravi"}"#);
    let outcome = processor(&model)
        .process(&email("1", "a@x.com", "Love the blender!"))
        .await
        .unwrap();

    let props = outcome.properties.unwrap();
    assert_eq!(props.category, Category::Other);
    assert!(outcome.reply.starts_with("Dear Ravi"));
}

#[tokio::test]
async fn concurrent_batch_replies_to_everyone() {
    let model = ScriptedModel::new(JANE_EXTRACTION);
    let inbox = (1..=5)
        .map(|i| email(&i.to_string(), "a@x.com", JANE_BODY))
        .collect();
    let mailbox = FakeMailbox::new(inbox, &["a@x.com"]);
    let stop = AtomicBool::new(false);
    let config = PollerConfig {
        max_concurrent: 3,
        ..PollerConfig::default()
    };

    let report = poll_once(&mailbox, &processor(&model), &config, &stop).await;

    assert_eq!(report.replied, 5);
    assert_eq!(
        *mailbox.handled.lock().unwrap(),
        vec!["1", "2", "3", "4", "5"]
    );
}

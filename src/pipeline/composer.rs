//! Reply composer: drafts the customer reply from extracted fields.

use std::sync::Arc;

use tracing::warn;

use crate::config::SupportConfig;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::ExtractedProperties;

/// Salutation used when the sender's name is unknown.
pub const GENERIC_SALUTATION: &str = "Dear customer";

/// Asks the model to write a friendly support reply.
pub struct ReplyComposer {
    llm: Arc<dyn LlmProvider>,
    signature_name: String,
    temperature: f32,
    max_tokens: u32,
}

impl ReplyComposer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &SupportConfig) -> Self {
        Self {
            llm,
            signature_name: config.signature_name.clone(),
            temperature: config.reply_temperature,
            max_tokens: config.reply_max_tokens,
        }
    }

    /// Draft a reply. The model output is returned unmodified; a failed or
    /// empty response yields a locally built apology instead.
    pub async fn compose(&self, props: &ExtractedProperties) -> String {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_reply_system_prompt(&self.signature_name)),
            ChatMessage::user(build_reply_user_prompt(props)),
        ])
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        match self.llm.complete(request).await {
            Ok(response) if !response.content.trim().is_empty() => response.content,
            Ok(_) => {
                warn!(category = %props.category, "Reply model returned empty text, using fallback");
                fallback_reply(props, &self.signature_name)
            }
            Err(e) => {
                warn!(error = %e, category = %props.category, "Reply model call failed, using fallback");
                fallback_reply(props, &self.signature_name)
            }
        }
    }
}

/// How the reply should open.
pub fn salutation(props: &ExtractedProperties) -> String {
    if props.has_known_name() {
        format!("Dear {}", props.name.trim())
    } else {
        GENERIC_SALUTATION.to_string()
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_reply_system_prompt(signature_name: &str) -> String {
    format!(
        "You are an AI customer support agent that writes friendly emails back to customers.\n\n\
         Write a reply that includes:\n\
         - an acknowledgment showing you understood the problem\n\
         - a proposed solution or next step\n\
         - a polite sign-off\n\n\
         Your sign-off name in the email is {signature_name}.\n\
         Reply with the email body only, no subject line."
    )
}

fn build_reply_user_prompt(props: &ExtractedProperties) -> String {
    let product = if props.mentioned_product.trim().is_empty() {
        "no specific product"
    } else {
        props.mentioned_product.trim()
    };
    let issue = if props.issue_description.trim().is_empty() {
        "no details given"
    } else {
        props.issue_description.trim()
    };

    format!(
        "Open the email with \"{salutation},\".\n\
         The customer's email was categorized as {category}, and mentioned {product}.\n\
         They described an issue: {issue}.\n\
         Please reply to this email in a friendly and helpful manner.",
        salutation = salutation(props),
        category = props.category,
    )
}

/// Generic apology used when the model gives us nothing to send.
pub fn fallback_reply(props: &ExtractedProperties, signature_name: &str) -> String {
    format!(
        "{},\n\n\
         Thank you for contacting us, and we are sorry for the trouble. \
         We have received your message and a member of our team will follow up with you shortly.\n\n\
         Kind regards,\n\
         {signature_name}",
        salutation(props)
    )
}

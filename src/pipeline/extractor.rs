//! Field extractor: turns an email body into `ExtractedProperties`.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SupportConfig;
use crate::error::ExtractionError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Category, ExtractedProperties, UNKNOWN_NAME};

/// Leading fence with an optional language tag, and a trailing fence.
static LEADING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\A```[ \t]*(?:json)?[ \t]*\r?\n?").unwrap());
static TRAILING_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r?\n?```\s*\z").unwrap());

/// Asks the model for the structured fields of an email.
pub struct FieldExtractor {
    llm: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: u32,
}

impl FieldExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &SupportConfig) -> Self {
        Self {
            llm,
            temperature: config.extraction_temperature,
            max_tokens: config.extraction_max_tokens,
        }
    }

    /// Extract properties from `body`. One model call, no retry.
    pub async fn extract(&self, body: &str) -> Result<ExtractedProperties, ExtractionError> {
        let request = CompletionRequest::new(vec![ChatMessage::user(build_extraction_prompt(
            body,
        ))])
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = self.llm.complete(request).await?;
        debug!(raw_response = %response.content, "Raw extraction response");

        parse_extraction_response(&response.content).inspect_err(|e| {
            warn!(
                raw_response = %response.content,
                error = %e,
                "Failed to decode extraction response"
            );
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the extraction instruction with the email body embedded verbatim.
pub fn build_extraction_prompt(body: &str) -> String {
    let categories = Category::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Extract the following details from the given email text:\n\
         - category (one of: {categories})\n\
         - mentioned_product (name of the product mentioned in the email, empty string if none)\n\
         - issue_description (brief explanation of the problem encountered)\n\
         - name (name of the sender if available, otherwise \"{UNKNOWN_NAME}\")\n\n\
         Email Text:\n\
         {body}\n\n\
         Respond with ONLY a valid JSON object with exactly these keys:\n\
         {{\"category\": \"...\", \"mentioned_product\": \"...\", \"issue_description\": \"...\", \"name\": \"...\"}}"
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Remove a surrounding markdown code fence (```` ```json ... ``` ````).
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = LEADING_FENCE.find(trimmed).map_or(0, |m| m.end());
    let rest = &trimmed[start..];
    let end = TRAILING_FENCE.find(rest).map_or(rest.len(), |m| m.start());
    rest[..end].trim()
}

/// Parse the model output into `ExtractedProperties`.
///
/// Missing fields take defaults and an unrecognised category becomes
/// `other`; only output that is not a JSON object is rejected.
pub fn parse_extraction_response(raw: &str) -> Result<ExtractedProperties, ExtractionError> {
    let cleaned = strip_code_fences(raw);
    let malformed = || ExtractionError::MalformedResponse {
        raw: cleaned.to_string(),
    };

    let value: Value = serde_json::from_str(cleaned).map_err(|_| malformed())?;
    let Value::Object(fields) = value else {
        return Err(malformed());
    };

    let category = fields
        .get("category")
        .and_then(Value::as_str)
        .map(Category::from_label)
        .unwrap_or_default();

    let name = text_field(fields.get("name"));
    let name = if name.is_empty() {
        UNKNOWN_NAME.to_string()
    } else {
        name
    };

    Ok(ExtractedProperties {
        category,
        mentioned_product: text_field(fields.get("mentioned_product")),
        issue_description: text_field(fields.get("issue_description")),
        name,
    })
}

/// Read a free-text field. Null or absent is empty; numbers and bools are
/// rendered as text.
fn text_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::CompletionResponse;

    // ── Fence stripping ─────────────────────────────────────────────

    #[test]
    fn strip_json_fence() {
        let raw = "```json\n{\"category\": \"other\"}\n```";
        assert_eq!(strip_code_fences(raw), "{\"category\": \"other\"}");
    }

    #[test]
    fn strip_bare_fence() {
        let raw = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn strip_fence_with_surrounding_whitespace() {
        let raw = "\n\n  ```JSON\r\n{\"a\": 1}\r\n```  \n";
        assert_eq!(strip_code_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn strip_single_line_fence() {
        assert_eq!(strip_code_fences("```json {\"a\": 1}```"), "{\"a\": 1}");
    }

    #[test]
    fn unfenced_passthrough() {
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn inner_backticks_untouched() {
        let raw = "{\"issue_description\": \"error in `main`\"}";
        assert_eq!(strip_code_fences(raw), raw);
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_full_response() {
        let raw = r#"{"category":"complaint","mentioned_product":"Model Z","issue_description":"won't turn on","name":"Jane"}"#;
        let props = parse_extraction_response(raw).unwrap();
        assert_eq!(props.category, Category::Complaint);
        assert_eq!(props.mentioned_product, "Model Z");
        assert_eq!(props.issue_description, "won't turn on");
        assert_eq!(props.name, "Jane");
    }

    #[test]
    fn fenced_and_unfenced_parse_identically() {
        let plain = r#"{"category":"other","mentioned_product":"","issue_description":"general question","name":"Unknown"}"#;
        let fenced = format!("```json\n{plain}\n```");
        assert_eq!(
            parse_extraction_response(&fenced).unwrap(),
            parse_extraction_response(plain).unwrap()
        );
    }

    #[test]
    fn parse_missing_fields_use_defaults() {
        let props = parse_extraction_response(r#"{"issue_description": "late delivery"}"#).unwrap();
        assert_eq!(props.category, Category::Other);
        assert_eq!(props.mentioned_product, "");
        assert_eq!(props.name, "Unknown");
    }

    #[test]
    fn parse_null_and_empty_name_become_unknown() {
        let props = parse_extraction_response(r#"{"category":"other","name":null}"#).unwrap();
        assert_eq!(props.name, "Unknown");
        let props = parse_extraction_response(r#"{"category":"other","name":"  "}"#).unwrap();
        assert_eq!(props.name, "Unknown");
    }

    #[test]
    fn parse_out_of_enum_category_coerced() {
        let props = parse_extraction_response(r#"{"category":"praise","name":"Bo"}"#).unwrap();
        assert_eq!(props.category, Category::Other);
        let props = parse_extraction_response(r#"{"category":42}"#).unwrap();
        assert_eq!(props.category, Category::Other);
    }

    #[test]
    fn parse_non_json_is_malformed() {
        let err = parse_extraction_response("Sorry, I can't help with that.").unwrap_err();
        match err {
            ExtractionError::MalformedResponse { raw } => {
                assert_eq!(raw, "Sorry, I can't help with that.");
            }
            other => panic!("Expected MalformedResponse, got {other:?}"),
        }
    }

    #[test]
    fn parse_json_array_is_malformed() {
        assert!(matches!(
            parse_extraction_response("[1, 2, 3]"),
            Err(ExtractionError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn parse_truncated_json_is_malformed() {
        assert!(matches!(
            parse_extraction_response("```json\n{\"category\": \"compl"),
            Err(ExtractionError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn prompt_embeds_body_verbatim() {
        let body = "My toaster Model Z won't turn on. – Jane";
        let prompt = build_extraction_prompt(body);
        assert!(prompt.contains(body));
        assert!(prompt.contains("refund_request"));
        assert!(prompt.contains("mentioned_product"));
        assert!(prompt.contains("\"Unknown\""));
    }

    // ── Extractor with mock LLM ─────────────────────────────────────

    struct ScriptedLlm {
        response: Result<String, ()>,
        prompts: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn ok(response: &str) -> Self {
            Self {
                response: Ok(response.to_string()),
                prompts: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                response: Err(()),
                prompts: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.user_prompt());
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 10,
                    output_tokens: 10,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "connection refused".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn extract_sends_body_and_parses() {
        let llm = Arc::new(ScriptedLlm::ok(
            "```json\n{\"category\":\"refund_request\",\"mentioned_product\":\"Kettle\",\"issue_description\":\"leaks\",\"name\":\"Sam\"}\n```",
        ));
        let extractor = FieldExtractor::new(llm.clone(), &SupportConfig::default());

        let props = extractor.extract("My kettle leaks. Sam").await.unwrap();
        assert_eq!(props.category, Category::RefundRequest);
        assert_eq!(props.name, "Sam");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert!(llm.prompts.lock().unwrap()[0].contains("My kettle leaks. Sam"));
    }

    #[tokio::test]
    async fn extract_malformed_does_not_retry() {
        let llm = Arc::new(ScriptedLlm::ok("not json at all"));
        let extractor = FieldExtractor::new(llm.clone(), &SupportConfig::default());

        let err = extractor.extract("hello").await.unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedResponse { .. }));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extract_llm_failure_is_distinct() {
        let llm = Arc::new(ScriptedLlm::failing());
        let extractor = FieldExtractor::new(llm, &SupportConfig::default());

        let err = extractor.extract("hello").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Llm(_)));
    }
}

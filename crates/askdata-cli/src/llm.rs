//! OpenAI integration for natural language to SQL translation
//!
//! The model's answer is untrusted: it is returned as a [`CandidateQuery`]
//! and must pass the safety gate before anything runs.

use std::time::Duration;

use askdata_duck::SchemaDescription;
use askdata_gate::CandidateQuery;
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use thiserror::Error;

use crate::config::LlmConfig;

/// System prompt - one table, SELECT only, JSON answer
const SYSTEM_PROMPT: &str = r#"You are an AI data analyst working on a single SQL table called `data`.
The user will ask questions about the data. Your job is to write a single
SQL SELECT query that answers the question.

Context:
- The data from a spreadsheet has been loaded into a single table named `data`.
- The schema with column names, types and example values is provided.
- The SQL dialect is DuckDB.

Rules:
- The query MUST start with SELECT.
- Use only the table name `data`.
- Use only columns that exist in the provided schema.
- NEVER use UPDATE, DELETE, INSERT, DROP, CREATE, ALTER, TRUNCATE, ATTACH or ';'.
- Prefer simple, readable SQL.
- You may use WHERE, GROUP BY, ORDER BY, LIMIT and basic aggregates
  (COUNT, AVG, SUM, MIN, MAX).

You must ALWAYS respond with exactly one JSON object and NOTHING else.

JSON format:
{
  "sql": "<SQL query here as a single-line string>",
  "comment": "<very short explanation of what this query does>"
}"#;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("OpenAI request failed: {0}")]
    Api(#[from] OpenAIError),

    #[error("OpenAI request timed out after {0}s")]
    Timeout(u64),

    #[error("No response from OpenAI")]
    EmptyResponse,

    #[error("Model did not return a usable JSON plan after {attempts} attempt(s). Raw: {raw}")]
    Unparseable { attempts: usize, raw: String },
}

/// The model's answer to one question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub sql: CandidateQuery,
    pub comment: Option<String>,
}

/// Natural language to SQL
#[async_trait]
pub trait Translator {
    async fn translate(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Translation, TranslationError>;
}

pub fn build_user_prompt(question: &str, schema: &str) -> String {
    format!(
        "SCHEMA:\n{}\n\nQUESTION:\n{}\n\nReturn ONLY a JSON object with fields \"sql\" and \"comment\".",
        schema, question
    )
}

/// Extract `{"sql": ..., "comment": ...}` from a model reply.
///
/// Markdown code fences around the JSON are tolerated.
pub fn parse_plan(content: &str) -> Result<Translation, String> {
    let trimmed = content.trim();
    let inner = if let Some(s) = trimmed.strip_prefix("```json") {
        s
    } else if let Some(s) = trimmed.strip_prefix("```") {
        s
    } else {
        trimmed
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner).trim();

    let value: serde_json::Value =
        serde_json::from_str(inner).map_err(|e| format!("invalid JSON: {}", e))?;
    let plan = value
        .as_object()
        .ok_or_else(|| "expected a JSON object".to_string())?;

    let sql = match plan.get("sql") {
        Some(serde_json::Value::String(sql)) if !sql.trim().is_empty() => sql.clone(),
        Some(_) => return Err("'sql' must be a non-empty string".to_string()),
        None => return Err("missing 'sql' field".to_string()),
    };
    let comment = plan
        .get("comment")
        .and_then(|c| c.as_str())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    Ok(Translation {
        sql: CandidateQuery::new(sql),
        comment,
    })
}

/// One chat completion round trip. `Ok(None)` means the API answered
/// without any message content.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatCompletionRequestMessage],
    ) -> Result<Option<String>, OpenAIError>;
}

/// The OpenAI chat completions API
pub struct OpenAiChat {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
}

impl OpenAiChat {
    pub fn new(api_key: String, config: &LlmConfig) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = &config.base_url {
            openai_config = openai_config.with_api_base(base);
        }

        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn complete(
        &self,
        messages: &[ChatCompletionRequestMessage],
    ) -> Result<Option<String>, OpenAIError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages.to_vec())
            .temperature(0.0) // Deterministic output
            .max_completion_tokens(self.max_tokens)
            .response_format(ResponseFormat::JsonObject)
            .build()?;

        let response = self.client.chat().create(request).await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content))
    }
}

/// Translator that asks a chat model for a JSON plan, retrying unparseable
/// answers with corrective feedback
pub struct ChatTranslator<B> {
    backend: B,
    model: String,
    timeout: Duration,
    max_retries: usize,
    prompt_samples: usize,
}

impl ChatTranslator<OpenAiChat> {
    pub fn openai(api_key: String, config: &LlmConfig, prompt_samples: usize) -> Self {
        Self::new(OpenAiChat::new(api_key, config), config, prompt_samples)
    }
}

impl<B: ChatBackend> ChatTranslator<B> {
    pub fn new(backend: B, config: &LlmConfig, prompt_samples: usize) -> Self {
        Self {
            backend,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            prompt_samples,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatCompletionRequestMessage],
    ) -> Result<String, TranslationError> {
        tokio::time::timeout(self.timeout, self.backend.complete(messages))
            .await
            .map_err(|_| TranslationError::Timeout(self.timeout.as_secs()))??
            .ok_or(TranslationError::EmptyResponse)
    }
}

#[async_trait]
impl<B: ChatBackend> Translator for ChatTranslator<B> {
    async fn translate(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Translation, TranslationError> {
        let user_prompt = build_user_prompt(question, &schema.to_prompt(self.prompt_samples));

        let mut messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_PROMPT)
                    .build()?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt)
                    .build()?,
            ),
        ];

        let attempts = self.max_retries + 1;
        let mut attempt = 1;
        loop {
            let content = self.complete(&messages).await?;
            tracing::debug!(attempt, model = %self.model, "LLM response: {}", content);

            match parse_plan(&content) {
                Ok(translation) => return Ok(translation),
                Err(problem) if attempt < attempts => {
                    tracing::warn!(attempt, %problem, "could not parse model answer, retrying");
                    attempt += 1;
                    messages.push(ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(content)
                            .build()?,
                    ));
                    messages.push(ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(format!(
                                "Error: {}. Return ONLY a JSON object with fields \"sql\" and \"comment\".",
                                problem
                            ))
                            .build()?,
                    ));
                }
                Err(_) => {
                    return Err(TranslationError::Unparseable {
                        attempts,
                        raw: content,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn test_system_prompt_rules() {
        assert!(SYSTEM_PROMPT.contains("MUST start with SELECT"));
        assert!(SYSTEM_PROMPT.contains("`data`"));
        assert!(SYSTEM_PROMPT.contains("\"sql\""));
    }

    #[test]
    fn test_build_user_prompt() {
        let prompt = build_user_prompt("How many rows?", "TABLE: data (3 rows)");
        assert!(prompt.starts_with("SCHEMA:\nTABLE: data (3 rows)\n\nQUESTION:\nHow many rows?"));
        assert!(prompt.ends_with("fields \"sql\" and \"comment\"."));
    }

    #[test]
    fn test_parse_plan() {
        let reply = r#"{"sql": "SELECT COUNT(*) FROM data", "comment": "counts rows"}"#;
        let t = parse_plan(reply).unwrap();
        assert_eq!(t.sql.as_str(), "SELECT COUNT(*) FROM data");
        assert_eq!(t.comment.as_deref(), Some("counts rows"));
    }

    #[test]
    fn test_parse_plan_with_fences() {
        let t = parse_plan("```json\n{\"sql\": \"SELECT 1\"}\n```").unwrap();
        assert_eq!(t.sql.as_str(), "SELECT 1");
        assert_eq!(t.comment, None);
    }

    #[test]
    fn test_parse_plan_keeps_sql_verbatim() {
        // the gate decides, not the parser
        let t = parse_plan(r#"{"sql": "DROP TABLE data", "comment": ""}"#).unwrap();
        assert_eq!(t.sql.as_str(), "DROP TABLE data");
        assert_eq!(t.comment, None);
    }

    #[test]
    fn test_parse_plan_errors() {
        assert!(parse_plan("SELECT 1").unwrap_err().contains("invalid JSON"));
        assert!(parse_plan("[1, 2]").unwrap_err().contains("JSON object"));
        assert!(parse_plan(r#"{"comment": "x"}"#).unwrap_err().contains("missing 'sql'"));
        assert!(parse_plan(r#"{"sql": "  "}"#).unwrap_err().contains("non-empty"));
        assert!(parse_plan(r#"{"sql": 42}"#).unwrap_err().contains("non-empty"));
    }

    /// Replays canned replies and records the size of each conversation it
    /// was sent
    struct ScriptedChat {
        replies: Mutex<VecDeque<Option<String>>>,
        seen: Mutex<Vec<Vec<ChatCompletionRequestMessage>>>,
    }

    impl ScriptedChat {
        fn new(replies: &[Option<&str>]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.map(str::to_string)).collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedChat {
        async fn complete(
            &self,
            messages: &[ChatCompletionRequestMessage],
        ) -> Result<Option<String>, OpenAIError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.replies.lock().unwrap().pop_front().expect("no scripted reply left"))
        }
    }

    /// Never answers in time
    struct StalledChat;

    #[async_trait]
    impl ChatBackend for StalledChat {
        async fn complete(
            &self,
            _messages: &[ChatCompletionRequestMessage],
        ) -> Result<Option<String>, OpenAIError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    fn empty_schema() -> SchemaDescription {
        SchemaDescription {
            table: "data".to_string(),
            row_count: 0,
            columns: vec![],
        }
    }

    fn config(max_retries: usize, timeout_secs: u64) -> LlmConfig {
        LlmConfig {
            max_retries,
            timeout_secs,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn test_retry_with_feedback_recovers() {
        let chat = ScriptedChat::new(&[
            Some("SELECT COUNT(*) FROM data"),
            Some(r#"{"sql": "SELECT COUNT(*) FROM data", "comment": "row count"}"#),
        ]);
        let translator = ChatTranslator::new(chat, &config(1, 5), 3);

        let t = translator.translate("How many rows?", &empty_schema()).await.unwrap();
        assert_eq!(t.sql.as_str(), "SELECT COUNT(*) FROM data");

        let seen = translator.backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), 2);
        // system, user, rejected answer, correction
        assert_eq!(seen[1].len(), 4);
        let correction = serde_json::to_string(&seen[1][3]).unwrap();
        assert!(correction.contains("invalid JSON"));
        let rejected = serde_json::to_string(&seen[1][2]).unwrap();
        assert!(rejected.contains("SELECT COUNT(*) FROM data"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_unparseable() {
        let chat = ScriptedChat::new(&[Some("nope"), Some("still not json")]);
        let translator = ChatTranslator::new(chat, &config(1, 5), 3);

        let err = translator.translate("anything", &empty_schema()).await.unwrap_err();
        match err {
            TranslationError::Unparseable { attempts, raw } => {
                assert_eq!(attempts, 2);
                assert_eq!(raw, "still not json");
            }
            other => panic!("expected unparseable answer, got {:?}", other),
        }
        assert!(translator.backend.replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_retry_when_disabled() {
        let chat = ScriptedChat::new(&[Some("nope"), Some(r#"{"sql": "SELECT 1"}"#)]);
        let translator = ChatTranslator::new(chat, &config(0, 5), 3);

        let err = translator.translate("anything", &empty_schema()).await.unwrap_err();
        assert!(matches!(err, TranslationError::Unparseable { attempts: 1, .. }));
        assert_eq!(translator.backend.replies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_content_is_empty_response() {
        let translator = ChatTranslator::new(ScriptedChat::new(&[None]), &config(1, 5), 3);

        let err = translator.translate("anything", &empty_schema()).await.unwrap_err();
        assert!(matches!(err, TranslationError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let translator = ChatTranslator::new(StalledChat, &config(1, 1), 3);

        let err = translator.translate("anything", &empty_schema()).await.unwrap_err();
        assert!(matches!(err, TranslationError::Timeout(1)));
        assert_eq!(err.to_string(), "OpenAI request timed out after 1s");
    }

    #[tokio::test]
    async fn test_unreachable_api_is_translation_error() {
        let config = LlmConfig {
            base_url: Some("http://127.0.0.1:9/v1".to_string()),
            timeout_secs: 5,
            max_retries: 0,
            ..LlmConfig::default()
        };
        let translator = ChatTranslator::openai("sk-test".to_string(), &config, 3);

        let err = translator.translate("anything", &empty_schema()).await.unwrap_err();
        assert!(matches!(err, TranslationError::Api(_) | TranslationError::Timeout(_)));
    }
}

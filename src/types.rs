//! Core types: parts, turns, conversations, and request configuration

use crate::config::{
    DEFAULT_LIVE_MODEL, DEFAULT_MODEL, DEFAULT_VOICE, IMAGE_GENERATION_MODEL, NEW_CHAT_TITLE,
    get_backend_url, get_model,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;

/// Author of a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
    Error,
}

/// Media carried inline (base64 `data`) or by reference (`uri`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "fileUri")]
    pub uri: Option<String>,
}

impl InlineData {
    /// Inline base64 payload
    pub fn from_base64(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: Some(data.into()),
            uri: None,
        }
    }

    /// Payload hosted elsewhere
    pub fn from_uri(mime_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: None,
            uri: Some(uri.into()),
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableCode {
    #[serde(default = "default_code_language")]
    pub language: String,
    pub code: String,
}

fn default_code_language() -> String {
    "PYTHON".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResult {
    pub name: String,
    #[serde(default)]
    pub result: Value,
}

/// Visible loading indicator standing in for an image function's output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImagePlaceholder {
    pub function_name: String,
    pub loading_text: String,
}

impl ImagePlaceholder {
    pub fn for_function(function_name: impl Into<String>) -> Self {
        let function_name = function_name.into();
        let loading_text = if function_name == "editImage" {
            "Editing image...".to_string()
        } else {
            "Generating image...".to_string()
        };
        Self {
            function_name,
            loading_text,
        }
    }
}

/// Uploaded file referenced by a user turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// One semantically-typed fragment of a turn.
///
/// Serialized externally tagged, so a text part is `{"text": "..."}` and an
/// image is `{"inlineImage": {"mimeType": ..., "data": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    InlineImage(InlineData),
    ExecutableCode(ExecutableCode),
    CodeExecutionResult(CodeExecutionResult),
    Thought(String),
    FunctionCall(FunctionCall),
    FunctionResult(FunctionResult),
    ImagePlaceholder(ImagePlaceholder),
    FileData(FileData),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Part::Thought(text.into())
    }

    /// Text content of a plain text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            _ => None,
        }
    }

    /// True for an image placeholder that has not been resolved yet
    pub fn is_pending_image(&self) -> bool {
        matches!(self, Part::ImagePlaceholder(_))
    }

    /// Function name for call, result and placeholder parts
    pub fn function_name(&self) -> Option<&str> {
        match self {
            Part::FunctionCall(call) => Some(&call.name),
            Part::FunctionResult(result) => Some(&result.name),
            Part::ImagePlaceholder(placeholder) => Some(&placeholder.function_name),
            _ => None,
        }
    }

    /// Converts to the upstream API part shape.
    ///
    /// Returns `None` for display-only parts that must not be transmitted.
    pub fn to_api_value(&self) -> Option<Value> {
        let value = match self {
            Part::Text(text) => json!({ "text": text }),
            Part::Thought(text) => json!({ "text": text, "thought": true }),
            Part::InlineImage(inline) => match (&inline.data, &inline.uri) {
                (Some(data), _) => {
                    json!({ "inlineData": { "mimeType": inline.mime_type, "data": data } })
                }
                (None, Some(uri)) => {
                    json!({ "fileData": { "mimeType": inline.mime_type, "fileUri": uri } })
                }
                (None, None) => return None,
            },
            Part::ExecutableCode(code) => json!({ "executableCode": code }),
            Part::CodeExecutionResult(result) => json!({
                "codeExecutionResult": {
                    "outcome": result.outcome.as_deref().unwrap_or("OUTCOME_OK"),
                    "output": result.output,
                }
            }),
            Part::FunctionCall(call) => json!({
                "functionCall": { "name": call.name, "args": call.args }
            }),
            Part::FunctionResult(result) => json!({
                "functionResponse": { "name": result.name, "response": result.result }
            }),
            Part::FileData(file) => json!({
                "fileData": { "mimeType": file.mime_type, "fileUri": file.file_uri }
            }),
            Part::ImagePlaceholder(_) => return None,
        };
        Some(value)
    }
}

/// Rejects an API part that carries `text` next to a function call or result.
///
/// The upstream API treats these fields as a oneof.
pub fn validate_api_part(part: &Value) -> Result<()> {
    let Some(object) = part.as_object() else {
        return Err(Error::invalid_input("API part must be a JSON object"));
    };
    let is_function = ["functionCall", "functionResult", "functionResponse"]
        .iter()
        .any(|key| object.contains_key(*key));
    if is_function && object.contains_key("text") {
        return Err(Error::invalid_input(
            "function call/result parts cannot carry a text field",
        ));
    }
    Ok(())
}

/// Token accounting reported with a finished response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "inputTokenCount")]
    pub prompt_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "outputTokenCount")]
    pub candidates_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u64>,
}

impl UsageMetadata {
    /// Overwrites fields present in `other`, keeping the rest
    pub fn merge(&mut self, other: &UsageMetadata) {
        if other.prompt_token_count.is_some() {
            self.prompt_token_count = other.prompt_token_count;
        }
        if other.candidates_token_count.is_some() {
            self.candidates_token_count = other.candidates_token_count;
        }
        if other.thoughts_token_count.is_some() {
            self.thoughts_token_count = other.thoughts_token_count;
        }
        if other.total_token_count.is_some() {
            self.total_token_count = other.total_token_count;
        }
    }
}

/// Completion metadata, attached to a turn only when it finalizes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_ratings: Option<Value>,
}

/// One role-attributed message made of ordered parts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TurnMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_context_metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parts,
            metadata: None,
            grounding_metadata: None,
            url_context_metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// User turn with uploaded files appended after the prompt text
    pub fn user_with_files(text: impl Into<String>, files: Vec<FileData>) -> Self {
        let mut parts = vec![Part::text(text)];
        parts.extend(files.into_iter().map(Part::FileData));
        Self::new(Role::User, parts)
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Role::Error, vec![Part::text(text)])
    }

    /// Text of the first plain text part
    pub fn first_text(&self) -> Option<&str> {
        self.parts.iter().find_map(Part::as_text)
    }

    /// All plain text parts joined in order
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    /// Converts to an API `contents` entry, or `None` if nothing is transmittable
    pub fn to_api_content(&self) -> Result<Option<Value>> {
        let role = match self.role {
            Role::User => "user",
            Role::Model => "model",
            Role::System | Role::Error => return Ok(None),
        };

        let mut parts = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            if let Some(value) = part.to_api_value() {
                validate_api_part(&value)?;
                parts.push(value);
            }
        }

        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(json!({ "role": role, "parts": parts })))
    }
}

/// An ordered list of turns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: String,
    pub messages: Vec<Turn>,
    #[serde(default)]
    pub pinned: bool,
    pub timestamp: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            model: model.into(),
            messages: Vec::new(),
            pinned: false,
            timestamp: Utc::now(),
        }
    }

    /// A fresh conversation titled "New Chat"
    pub fn untitled(model: impl Into<String>) -> Self {
        Self::new(NEW_CHAT_TITLE, model)
    }

    pub fn turn(&self, turn_id: &str) -> Option<&Turn> {
        self.messages.iter().find(|t| t.id == turn_id)
    }

    pub fn position(&self, turn_id: &str) -> Option<usize> {
        self.messages.iter().position(|t| t.id == turn_id)
    }
}

// ============================================================================
// CHAT OPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FunctionCallingMode {
    #[default]
    Auto,
    Any,
    None,
}

/// Settings for chat requests
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Backend base URL (e.g., "http://localhost:9000")
    pub base_url: String,

    /// Model ID sent as `modelId`
    pub model: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum output tokens
    pub max_output_tokens: u32,

    /// System instruction (ignored by image generation models)
    pub system_instruction: Option<String>,

    /// Google Search grounding, exclusive with every other tool
    pub enable_google_search: bool,

    /// Code execution, used only when search is off
    pub enable_code_execution: bool,

    /// Backend function calling with `selected_tools`
    pub enable_function_calling: bool,

    pub selected_tools: Vec<String>,

    pub function_calling_mode: FunctionCallingMode,

    /// `Some(true)` requests thoughts, `Some(false)` suppresses them
    pub enable_thinking: Option<bool>,

    /// Fixed budget, or -1 for dynamic thinking
    pub thinking_budget: Option<i32>,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: String::new(),
            temperature: 0.7,
            max_output_tokens: 8192,
            system_instruction: None,
            enable_google_search: false,
            enable_code_execution: false,
            enable_function_calling: false,
            selected_tools: Vec::new(),
            function_calling_mode: FunctionCallingMode::Auto,
            enable_thinking: None,
            thinking_budget: None,
            timeout: 120,
        }
    }
}

impl ChatOptions {
    pub fn builder() -> ChatOptionsBuilder {
        ChatOptionsBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ChatOptionsBuilder {
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    system_instruction: Option<String>,
    enable_google_search: Option<bool>,
    enable_code_execution: Option<bool>,
    enable_function_calling: Option<bool>,
    selected_tools: Vec<String>,
    function_calling_mode: Option<FunctionCallingMode>,
    enable_thinking: Option<bool>,
    thinking_budget: Option<i32>,
    timeout: Option<u64>,
}

impl ChatOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn google_search(mut self, enabled: bool) -> Self {
        self.enable_google_search = Some(enabled);
        self
    }

    pub fn code_execution(mut self, enabled: bool) -> Self {
        self.enable_code_execution = Some(enabled);
        self
    }

    pub fn function_calling(mut self, enabled: bool) -> Self {
        self.enable_function_calling = Some(enabled);
        self
    }

    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.selected_tools.push(name.into());
        self
    }

    pub fn function_calling_mode(mut self, mode: FunctionCallingMode) -> Self {
        self.function_calling_mode = Some(mode);
        self
    }

    pub fn thinking(mut self, enabled: bool) -> Self {
        self.enable_thinking = Some(enabled);
        self
    }

    pub fn thinking_budget(mut self, budget: i32) -> Self {
        self.thinking_budget = Some(budget);
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Unset `model` and `base_url` fall back to `APSARA_MODEL` and `APSARA_BACKEND_URL`,
    /// then to the built-in defaults.
    pub fn build(self) -> Result<ChatOptions> {
        let model = self
            .model
            .or_else(|| get_model(Some(DEFAULT_MODEL), true))
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::config("model is required"))?;

        let base_url = self
            .base_url
            .unwrap_or_else(|| get_backend_url(None));
        if base_url.trim().is_empty() {
            return Err(Error::config("base_url is required"));
        }

        if let Some(temp) = self.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(Error::config("temperature must be between 0.0 and 2.0"));
            }
        }

        let defaults = ChatOptions::default();
        Ok(ChatOptions {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_output_tokens: self.max_output_tokens.unwrap_or(defaults.max_output_tokens),
            system_instruction: self.system_instruction,
            enable_google_search: self.enable_google_search.unwrap_or(false),
            enable_code_execution: self.enable_code_execution.unwrap_or(false),
            enable_function_calling: self.enable_function_calling.unwrap_or(false),
            selected_tools: self.selected_tools,
            function_calling_mode: self.function_calling_mode.unwrap_or_default(),
            enable_thinking: self.enable_thinking,
            thinking_budget: self.thinking_budget,
            timeout: self.timeout.unwrap_or(defaults.timeout),
        })
    }
}

// ============================================================================
// REQUEST BODY
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i32>,
}

/// The `config` object of a chat request
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub tools: Vec<Value>,
    pub disable_default_tools: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_google_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_function_calling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_calling_mode: Option<FunctionCallingMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

impl RequestConfig {
    /// Applies tool priority: search, then code execution, then function calling.
    pub fn from_options(options: &ChatOptions, model: &str) -> Self {
        let is_image_gen = model == IMAGE_GENERATION_MODEL;

        let mut config = RequestConfig {
            generation_config: GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_output_tokens,
            },
            system_instruction: None,
            tools: Vec::new(),
            disable_default_tools: true,
            enable_google_search: options.enable_google_search.then_some(true),
            enable_function_calling: None,
            selected_tools: None,
            function_calling_mode: None,
            allowed_function_names: None,
            thinking_config: None,
        };

        if !is_image_gen {
            config.system_instruction = options
                .system_instruction
                .clone()
                .filter(|s| !s.trim().is_empty());

            if options.enable_google_search {
                config.tools = vec![json!({ "googleSearch": {} })];
            } else if options.enable_code_execution {
                config.tools = vec![json!({ "codeExecution": {} })];
            } else if options.enable_function_calling && !options.selected_tools.is_empty() {
                config.enable_function_calling = Some(true);
                config.selected_tools = Some(options.selected_tools.clone());
                config.function_calling_mode = Some(options.function_calling_mode);
                if options.function_calling_mode == FunctionCallingMode::Any {
                    config.allowed_function_names = Some(options.selected_tools.clone());
                }
            }
        }

        config.thinking_config = options.enable_thinking.map(|enabled| ThinkingConfig {
            include_thoughts: enabled,
            thinking_budget: if enabled {
                options.thinking_budget.filter(|b| *b == -1 || *b >= 0)
            } else {
                None
            },
        });

        config
    }
}

/// Body of `POST /chat` and `POST /chat/stream`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub model_id: String,
    pub contents: Vec<Value>,
    pub config: RequestConfig,
}

impl ChatRequest {
    /// Builds the request from history. Only user and model turns with
    /// transmittable parts are sent.
    pub fn new(model: impl Into<String>, history: &[Turn], config: RequestConfig) -> Result<Self> {
        let mut contents = Vec::with_capacity(history.len());
        for turn in history {
            if let Some(content) = turn.to_api_content()? {
                contents.push(content);
            }
        }

        if contents.is_empty() {
            return Err(Error::invalid_input("request has no content to send"));
        }

        Ok(Self {
            model_id: model.into(),
            contents,
            config,
        })
    }
}

// ============================================================================
// LIVE OPTIONS
// ============================================================================

/// Output modality of a live session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Text,
    Audio,
    Video,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "TEXT",
            Modality::Audio => "AUDIO",
            Modality::Video => "VIDEO",
        }
    }
}

/// Settings for a live relay connection
#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub base_url: String,
    pub model: String,
    pub modalities: BTreeSet<Modality>,
    pub voice: String,
    pub system_instruction: Option<String>,
    pub transcription_enabled: bool,
    pub sliding_window_enabled: bool,
    pub sliding_window_tokens: u32,
    pub media_resolution: Option<String>,
    /// Handle from a previous session's `sessionResumptionUpdate`
    pub resume_handle: Option<String>,
}

impl LiveOptions {
    pub fn builder() -> LiveOptionsBuilder {
        LiveOptionsBuilder::default()
    }

    pub fn wants_audio(&self) -> bool {
        self.modalities.contains(&Modality::Audio)
    }

    /// Builds the `/live` WebSocket URL with its query parameters
    pub fn to_url(&self) -> Result<reqwest::Url> {
        let base = reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("invalid live base URL: {}", e)))?;
        let mut url = base
            .join("/live")
            .map_err(|e| Error::config(format!("invalid live base URL: {}", e)))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(Error::config(format!(
                    "unsupported live URL scheme: {}",
                    other
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::config("cannot switch live URL to a WebSocket scheme"))?;

        let modalities = self
            .modalities
            .iter()
            .map(Modality::as_str)
            .collect::<Vec<_>>()
            .join(",");

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("model", &self.model);
            query.append_pair("modalities", &modalities);
            if self.wants_audio() {
                query.append_pair("voice", &self.voice);
            }
            if let Some(instruction) = &self.system_instruction {
                query.append_pair("systemInstruction", instruction);
            }
            query.append_pair("transcriptionEnabled", &self.transcription_enabled.to_string());
            query.append_pair("slidingWindowEnabled", &self.sliding_window_enabled.to_string());
            if self.sliding_window_enabled {
                query.append_pair("slidingWindowTokens", &self.sliding_window_tokens.to_string());
            }
            if let Some(resolution) = &self.media_resolution {
                query.append_pair("mediaResolution", resolution);
            }
            if let Some(handle) = &self.resume_handle {
                query.append_pair("resumeHandle", handle);
            }
        }

        Ok(url)
    }
}

#[derive(Debug, Default)]
pub struct LiveOptionsBuilder {
    base_url: Option<String>,
    model: Option<String>,
    modalities: BTreeSet<Modality>,
    voice: Option<String>,
    system_instruction: Option<String>,
    transcription_enabled: Option<bool>,
    sliding_window_enabled: Option<bool>,
    sliding_window_tokens: Option<u32>,
    media_resolution: Option<String>,
    resume_handle: Option<String>,
}

impl LiveOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn modality(mut self, modality: Modality) -> Self {
        self.modalities.insert(modality);
        self
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn transcription(mut self, enabled: bool) -> Self {
        self.transcription_enabled = Some(enabled);
        self
    }

    pub fn sliding_window(mut self, enabled: bool, tokens: u32) -> Self {
        self.sliding_window_enabled = Some(enabled);
        self.sliding_window_tokens = Some(tokens);
        self
    }

    pub fn media_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.media_resolution = Some(resolution.into());
        self
    }

    pub fn resume_handle(mut self, handle: impl Into<String>) -> Self {
        self.resume_handle = Some(handle.into());
        self
    }

    /// An unset `base_url` falls back to `APSARA_BACKEND_URL`, then to the built-in default
    pub fn build(self) -> Result<LiveOptions> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| get_backend_url(None));
        if base_url.trim().is_empty() {
            return Err(Error::config("base_url is required"));
        }

        let mut modalities = self.modalities;
        if modalities.is_empty() {
            modalities.insert(Modality::Text);
        }

        Ok(LiveOptions {
            base_url,
            model: self.model.unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string()),
            modalities,
            voice: self.voice.unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            system_instruction: self.system_instruction,
            transcription_enabled: self.transcription_enabled.unwrap_or(true),
            sliding_window_enabled: self.sliding_window_enabled.unwrap_or(true),
            sliding_window_tokens: self.sliding_window_tokens.unwrap_or(4000),
            media_resolution: self.media_resolution,
            resume_handle: self.resume_handle,
        })
    }
}

//! Gemini provider implementation.
//!
//! Talks to the `generateContent` endpoint of the Generative Language API.
//!
//! Supports:
//! - Multimodal user turns (text + media). Small blobs go inline as base64;
//!   larger ones are uploaded once through the Files API and referenced by URI

//! - Function calling (`functionCall` / `functionResponse` parts)
//! - Per-category safety settings and safety-block detection
//! - Max-token truncation and malformed-function-call detection

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use gemcord_core::error::ModelError;
use gemcord_core::media::{MediaBlob, Provenance};
use gemcord_core::message::Turn;
use gemcord_core::provider::*;
use gemcord_core::tool::ToolCall;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Blobs larger than this are uploaded instead of sent inline.
pub const DEFAULT_INLINE_LIMIT: usize = 1024 * 1024;

/// Uploaded files expire after 48 hours; re-upload a little before that.
const UPLOAD_TTL: Duration = Duration::from_secs(47 * 60 * 60);

/// How long to wait for an uploaded file to finish processing.
const FILE_ACTIVE_TIMEOUT: Duration = Duration::from_secs(30);

struct Upload {
    uri: String,
    uploaded_at: Instant,
}

/// A Gemini model provider.
pub struct GeminiProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
    inline_limit: usize,
    poll_interval: Duration,
    /// File URIs of uploaded blobs, by blob id
    uploads: Mutex<HashMap<u64, Upload>>,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://generativelanguage.googleapis.com")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let timeout = Duration::from_secs(120);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            timeout,
            inline_limit: DEFAULT_INLINE_LIMIT,
            poll_interval: Duration::from_secs(1),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Largest blob, in bytes, sent inline with the request.
    pub fn with_inline_limit(mut self, bytes: usize) -> Self {
        self.inline_limit = bytes;
        self
    }

    /// Delay between checks on a file that is still processing.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn transport_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            ModelError::Network(e.to_string())
        }
    }

    // ── Files API ──

    /// Make sure every oversized blob in the request has a live file URI.
    /// Returns the URIs to reference, by blob id.
    async fn prepare_uploads(&self, request: &ModelRequest) -> Result<HashMap<u64, String>, ModelError> {
        let mut uris = HashMap::new();
        let oversized = request
            .turns()
            .filter_map(|turn| match turn {
                Turn::User(user) => Some(user.media.iter()),
                _ => None,
            })
            .flatten()
            .filter(|blob| blob.len() > self.inline_limit)
            .collect::<Vec<&MediaBlob>>();

        for blob in oversized {
            if uris.contains_key(&blob.id()) {
                continue;
            }
            let cached = self.cached_upload(blob.id());
            let uri = match cached {
                Some(uri) => uri,
                None => {
                    let uri = self.upload(blob).await?;
                    self.remember_upload(blob.id(), uri.clone());
                    uri
                }
            };
            uris.insert(blob.id(), uri);
        }
        Ok(uris)
    }

    fn cached_upload(&self, blob_id: u64) -> Option<String> {
        let uploads = self.uploads.lock().ok()?;
        uploads
            .get(&blob_id)
            .filter(|u| u.uploaded_at.elapsed() < UPLOAD_TTL)
            .map(|u| u.uri.clone())
    }

    fn remember_upload(&self, blob_id: u64, uri: String) {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.retain(|_, u| u.uploaded_at.elapsed() < UPLOAD_TTL);
            uploads.insert(
                blob_id,
                Upload {
                    uri,
                    uploaded_at: Instant::now(),
                },
            );
        }
    }

    /// Resumable upload: start a session, send the bytes, wait until active.
    async fn upload(&self, blob: &MediaBlob) -> Result<String, ModelError> {
        let start = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", blob.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", blob.mime_type())
            .json(&serde_json::json!({"file": {"display_name": blob.source()}}))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let start = ensure_success(start).await?;
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ModelError::Upload("no upload URL in the start response".into()))?
            .to_string();

        let finished = self
            .client
            .post(&upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(blob.data().to_vec())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let uploaded: ApiUploadResponse = ensure_success(finished)
            .await?
            .json()
            .await
            .map_err(|e| ModelError::Upload(format!("failed to parse upload response: {e}")))?;

        info!(
            name = %uploaded.file.name,
            source = %blob.source(),
            bytes = blob.len(),
            "Uploaded media"
        );
        let file = self.wait_until_active(uploaded.file).await?;
        Ok(file.uri)
    }

    /// Poll a processing file until it is active. A file still processing at
    /// the deadline is used anyway.
    async fn wait_until_active(&self, mut file: ApiFile) -> Result<ApiFile, ModelError> {
        let deadline = Instant::now() + FILE_ACTIVE_TIMEOUT;
        loop {
            match file.state.as_deref() {
                Some("FAILED") => {
                    return Err(ModelError::Upload(format!("{} failed to process", file.name)));
                }
                Some("PROCESSING") if Instant::now() < deadline => {}
                Some("PROCESSING") => {
                    warn!(name = %file.name, "File still processing, using it anyway");
                    return Ok(file);
                }
                _ => return Ok(file),
            }

            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .client
                .get(format!("{}/v1beta/{}", self.base_url, file.name))
                .header("x-goog-api-key", &self.api_key)
                .send()
                .await
                .map_err(|e| self.transport_error(e))?;
            file = ensure_success(response)
                .await?
                .json()
                .await
                .map_err(|e| ModelError::Upload(format!("failed to parse file status: {e}")))?;
        }
    }

    /// Convert a request into the API wire format. Blobs with an entry in
    /// `uploads` are referenced by URI instead of sent inline.
    fn to_api_request(request: &ModelRequest, uploads: &HashMap<u64, String>) -> ApiRequest {
        let system_instruction = request
            .system_prompt
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| ApiContent {
                role: None,
                parts: vec![ApiPart::text(p)],
            });

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ApiTools {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| ApiFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        let safety_settings = HarmCategory::ALL
            .iter()
            .map(|&category| ApiSafetySetting {
                category,
                threshold: request.safety_threshold,
            })
            .collect();

        ApiRequest {
            system_instruction,
            contents: Self::to_api_contents(request.turns(), uploads),
            tools,
            safety_settings,
            generation_config: ApiGenerationConfig {
                temperature: request.temperature,
            },
        }
    }

    /// Convert turns to contents. Consecutive tool results share one content.
    fn to_api_contents<'a>(
        turns: impl Iterator<Item = &'a Turn>,
        uploads: &HashMap<u64, String>,
    ) -> Vec<ApiContent> {
        let mut contents: Vec<ApiContent> = Vec::new();
        let mut previous_was_tool_result = false;

        for turn in turns {
            match turn {
                Turn::User(user) => {
                    let mut parts = vec![ApiPart::text(user.prompt_text())];
                    parts.extend(user.media.iter().map(|blob| match uploads.get(&blob.id()) {
                        Some(uri) => ApiPart::file(blob, uri),
                        None => ApiPart::inline(blob),
                    }));
                    contents.push(ApiContent::with_role("user", parts));
                    previous_was_tool_result = false;
                }
                Turn::Model(model) => {
                    let mut parts = Vec::new();
                    if !model.text.is_empty() {
                        parts.push(ApiPart::text(&model.text));
                    }
                    parts.extend(model.tool_calls.iter().map(|call| ApiPart {
                        function_call: Some(ApiFunctionCall {
                            id: None,
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        }),
                        ..ApiPart::default()
                    }));
                    if !parts.is_empty() {
                        contents.push(ApiContent::with_role("model", parts));
                    }
                    previous_was_tool_result = false;
                }
                Turn::ToolResult(result) => {
                    let part = ApiPart {
                        function_response: Some(ApiFunctionResponse {
                            name: result.tool_name.clone(),
                            response: result.outcome.to_response_json(),
                        }),
                        ..ApiPart::default()
                    };
                    match contents.last_mut() {
                        Some(last) if previous_was_tool_result => last.parts.push(part),
                        _ => contents.push(ApiContent::with_role("user", vec![part])),
                    }
                    previous_was_tool_result = true;
                }
            }
        }

        contents
    }

    /// Interpret an API response.
    fn parse_response(response: ApiResponse, requested_model: &str) -> Result<ModelResponse, ModelError> {
        let usage = response.usage_metadata.map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        });
        let model = response
            .model_version
            .unwrap_or_else(|| requested_model.to_string());

        if let Some(feedback) = response.prompt_feedback.filter(|f| f.block_reason.is_some()) {
            debug!(reason = ?feedback.block_reason, "Prompt blocked");
            return Ok(ModelResponse {
                reply: ModelReply::Blocked {
                    ratings: convert_ratings(feedback.safety_ratings),
                },
                usage,
                model,
            });
        }

        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Malformed("response had no candidates".into()))?;

        let finish_reason = candidate.finish_reason.as_deref().unwrap_or("STOP");
        match finish_reason {
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII" => {
                return Ok(ModelResponse {
                    reply: ModelReply::Blocked {
                        ratings: convert_ratings(candidate.safety_ratings),
                    },
                    usage,
                    model,
                });
            }
            "MALFORMED_FUNCTION_CALL" => {
                return Err(ModelError::Malformed(
                    candidate
                        .finish_message
                        .unwrap_or_else(|| "malformed function call".into()),
                ));
            }
            _ => {}
        }

        let mut text = String::new();
        let mut calls = Vec::new();
        let mut media = Vec::new();

        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for part in parts {
            if part.thought.unwrap_or(false) {
                continue;
            }
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(call) = part.function_call {
                calls.push(ToolCall {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name: call.name,
                    arguments: call.args,
                });
            }
            if let Some(inline) = part.inline_data {
                let data = BASE64
                    .decode(inline.data.as_bytes())
                    .map_err(|e| ModelError::Malformed(format!("invalid inline data: {e}")))?;
                media.push(MediaBlob::new(data, inline.mime_type, Provenance::Generated, "model"));
            }
        }

        let reply = if !calls.is_empty() {
            ModelReply::ToolCalls { text, calls }
        } else {
            ModelReply::Final {
                text,
                media,
                truncated: finish_reason == "MAX_TOKENS",
            }
        };

        Ok(ModelResponse { reply, usage, model })
    }
}

/// Ratings with categories this build does not know are dropped.
fn convert_ratings(ratings: Vec<ApiSafetyRating>) -> Vec<SafetyRating> {
    ratings
        .into_iter()
        .filter_map(|r| {
            let category = serde_json::from_value(serde_json::Value::String(r.category)).ok()?;
            let probability = serde_json::from_value(serde_json::Value::String(r.probability)).ok()?;
            Some(SafetyRating { category, probability })
        })
        .collect()
}

/// Turn a non-2xx response into an API error.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %error_body, "Gemini returned error");
    Err(ModelError::Api {
        status_code: status.as_u16(),
        message: error_message(&error_body),
    })
}

/// Pull `error.message` out of an API error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let uploads = self.prepare_uploads(&request).await?;
        let body = Self::to_api_request(&request, &uploads);

        debug!(
            provider = "gemini",
            model = %request.model,
            contents = body.contents.len(),
            tools = request.tools.len(),
            uploaded = uploads.len(),
            "Sending generateContent request"
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let api_response: ApiResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| ModelError::Malformed(format!("failed to parse response: {e}")))?;

        Self::parse_response(api_response, &request.model)
    }

    async fn health_check(&self) -> Result<bool, ModelError> {
        let url = format!("{}/v1beta/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

// --- API wire types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTools>,
    safety_settings: Vec<ApiSafetySetting>,
    generation_config: ApiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ApiPart>,
}

impl ApiContent {
    fn with_role(role: &str, parts: Vec<ApiPart>) -> Self {
        Self {
            role: Some(role.into()),
            parts,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<ApiInlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<ApiFileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<ApiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<ApiFunctionResponse>,
}

impl ApiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    fn inline(blob: &MediaBlob) -> Self {
        Self {
            inline_data: Some(ApiInlineData {
                mime_type: blob.mime_type().to_string(),
                data: BASE64.encode(blob.data()),
            }),
            ..Self::default()
        }
    }

    fn file(blob: &MediaBlob, uri: &str) -> Self {
        Self {
            file_data: Some(ApiFileData {
                mime_type: blob.mime_type().to_string(),
                file_uri: uri.to_string(),
            }),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Deserialize)]
struct ApiUploadResponse {
    file: ApiFile,
}

/// Files API resource.
#[derive(Debug, Deserialize)]
struct ApiFile {
    name: String,
    uri: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiTools {
    function_declarations: Vec<ApiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct ApiFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ApiSafetySetting {
    category: HarmCategory,
    threshold: HarmBlockThreshold,
}

#[derive(Debug, Serialize)]
struct ApiGenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<ApiPromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<ApiUsage>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCandidate {
    #[serde(default)]
    content: Option<ApiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    finish_message: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<ApiSafetyRating>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<ApiSafetyRating>,
}

#[derive(Debug, Deserialize)]
struct ApiSafetyRating {
    category: String,
    probability: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{truncate_text, GenerateError, ImageGenerator, ImageRequest};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const TOP_P: f64 = 0.95;

pub struct GeminiGenerator {
    api_key: String,
    api_base: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiGenerator {
    pub fn new(api_key: String, api_base: Option<String>, timeout: Duration) -> Self {
        Self {
            api_key,
            api_base: api_base
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "OFF",
            })
        })
        .collect()
    }

    fn build_payload(request: &ImageRequest) -> Value {
        let mut parts = Vec::new();
        if let Some(reference) = request.reference_image.as_ref() {
            parts.push(json!({
                "inlineData": {
                    "mimeType": sniff_mime(reference),
                    "data": BASE64.encode(reference),
                }
            }));
        }
        parts.push(json!({ "text": request.prompt }));

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": parts,
            })]),
        );
        payload.insert(
            "generationConfig".to_string(),
            json!({
                "temperature": request.temperature,
                "topP": TOP_P,
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": {
                    "aspectRatio": request.aspect_ratio.as_str(),
                },
            }),
        );
        payload.insert(
            "safetySettings".to_string(),
            Value::Array(Self::default_safety_settings()),
        );
        Value::Object(payload)
    }

    fn extract_first_image(response_payload: &Value) -> Result<Vec<u8>, GenerateError> {
        if let Some(reason) = response_payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            return Err(GenerateError::ContentFiltered(format!(
                "Gemini blocked the prompt ({reason})"
            )));
        }

        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut finish_reasons = Vec::new();
        for candidate in &candidates {
            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                finish_reasons.push(reason.to_string());
            }
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let data = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(|inline| inline.get("data"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                return BASE64.decode(data.as_bytes()).map_err(|err| {
                    GenerateError::Provider(format!("Gemini image base64 decode failed: {err}"))
                });
            }
        }

        if finish_reasons
            .iter()
            .any(|reason| reason.contains("SAFETY") || reason == "PROHIBITED_CONTENT")
        {
            return Err(GenerateError::ContentFiltered(format!(
                "Gemini withheld the image ({})",
                finish_reasons.join(", ")
            )));
        }
        Err(GenerateError::EmptyResponse(format!(
            "Gemini returned {} candidate(s) without image data",
            candidates.len()
        )))
    }
}

impl ImageGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        "google_genai"
    }

    fn validate_config(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
        if !self.validate_config() {
            return Err(GenerateError::Auth("Gemini API key is not configured".to_string()));
        }
        let endpoint = self.endpoint_for_model(&request.model);
        tracing::info!(
            model = %request.model,
            aspect_ratio = %request.aspect_ratio,
            has_reference = request.reference_image.is_some(),
            "Gemini image request"
        );
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(&Self::build_payload(request))
            .send()
            .map_err(|err| GenerateError::from_transport("Gemini", err))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| GenerateError::from_transport("Gemini", err))?;
        if !status.is_success() {
            return Err(GenerateError::from_status("Gemini", status, &body));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            GenerateError::Provider(format!(
                "Gemini returned invalid JSON ({err}): {}",
                truncate_text(&body, 256)
            ))
        })?;
        Self::extract_first_image(&parsed)
    }
}

pub(crate) fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(&b"WEBP"[..]) {
        "image/webp"
    } else {
        "image/png"
    }
}

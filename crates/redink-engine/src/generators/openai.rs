use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{json, Value};

use super::gemini::sniff_mime;
use super::{truncate_text, AspectRatio, GenerateError, ImageGenerator, ImageRequest};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Any endpoint speaking the OpenAI images API.
pub struct OpenAiCompatibleGenerator {
    api_key: String,
    api_base: String,
    timeout: Duration,
    http: HttpClient,
}

impl OpenAiCompatibleGenerator {
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

    fn size_for(aspect_ratio: AspectRatio) -> &'static str {
        match aspect_ratio {
            AspectRatio::Square => "1024x1024",
            AspectRatio::Portrait3x4 | AspectRatio::Tall9x16 => "1024x1536",
            AspectRatio::Landscape4x3 | AspectRatio::Wide16x9 => "1536x1024",
        }
    }

    fn generation_payload(request: &ImageRequest) -> Value {
        json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": Self::size_for(request.aspect_ratio),
            "response_format": "b64_json",
        })
    }

    fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let builder = self
            .http
            .post(&endpoint)
            .json(&Self::generation_payload(request));
        self.send(builder)
    }

    fn edit(&self, request: &ImageRequest, reference: &[u8]) -> Result<Vec<u8>, GenerateError> {
        let endpoint = format!("{}/images/edits", self.api_base);
        let mime = sniff_mime(reference);
        let file_name = match mime {
            "image/jpeg" => "reference.jpg",
            "image/webp" => "reference.webp",
            _ => "reference.png",
        };
        let part = MultipartPart::bytes(reference.to_vec())
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|err| GenerateError::InvalidInput(format!("invalid mime '{mime}': {err}")))?;
        let form = MultipartForm::new()
            .text("model", request.model.clone())
            .text("prompt", request.prompt.clone())
            .text("n", "1")
            .text("size", Self::size_for(request.aspect_ratio))
            .part("image[]", part);
        self.send(self.http.post(&endpoint).multipart(form))
    }

    fn send(&self, builder: RequestBuilder) -> Result<Vec<u8>, GenerateError> {
        let response = builder
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .map_err(|err| GenerateError::from_transport("OpenAI", err))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| GenerateError::from_transport("OpenAI", err))?;
        if !status.is_success() {
            return Err(GenerateError::from_status("OpenAI", status, &body));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            GenerateError::Provider(format!(
                "OpenAI returned invalid JSON ({err}): {}",
                truncate_text(&body, 256)
            ))
        })?;
        self.extract_first_image(&parsed)
    }

    fn extract_first_image(&self, response_payload: &Value) -> Result<Vec<u8>, GenerateError> {
        let rows = response_payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in rows {
            if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
                return BASE64.decode(b64.as_bytes()).map_err(|err| {
                    GenerateError::Provider(format!("OpenAI image base64 decode failed: {err}"))
                });
            }
            if let Some(url) = row.get("url").and_then(Value::as_str) {
                return self.download_image(url);
            }
        }
        Err(GenerateError::EmptyResponse(
            "OpenAI response carried no image data".to_string(),
        ))
    }

    fn download_image(&self, url: &str) -> Result<Vec<u8>, GenerateError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .map_err(|err| GenerateError::from_transport("image download", err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GenerateError::from_status("image download", status, &body));
        }
        let bytes = response
            .bytes()
            .map_err(|err| GenerateError::from_transport("image download", err))?;
        Ok(bytes.to_vec())
    }
}

impl ImageGenerator for OpenAiCompatibleGenerator {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    fn validate_config(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
        if !self.validate_config() {
            return Err(GenerateError::Auth("OpenAI API key is not configured".to_string()));
        }
        tracing::info!(
            model = %request.model,
            aspect_ratio = %request.aspect_ratio,
            has_reference = request.reference_image.is_some(),
            "OpenAI-compatible image request"
        );
        match request.reference_image.as_deref() {
            Some(reference) => self.edit(request, reference),
            None => self.generate(request),
        }
    }
}

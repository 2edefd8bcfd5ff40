//! Image generator adapters behind one blocking interface.

mod dryrun;
mod gemini;
mod openai;
mod retry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use redink_contracts::config::{ConfigError, ProviderKind, ProviderSettings};
use reqwest::StatusCode;
use thiserror::Error;

pub use dryrun::DryrunGenerator;
pub use gemini::GeminiGenerator;
pub use openai::OpenAiCompatibleGenerator;
pub use retry::{RetryPolicy, RetryingGenerator, Sleeper, ThreadSleeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AspectRatio {
    Square,
    #[default]
    Portrait3x4,
    Landscape4x3,
    Wide16x9,
    Tall9x16,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape4x3,
        AspectRatio::Wide16x9,
        AspectRatio::Tall9x16,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Wide16x9 => "16:9",
            AspectRatio::Tall9x16 => "9:16",
        }
    }

    /// Pixel size used where a provider wants explicit dimensions.
    pub fn dims(self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Portrait3x4 => (768, 1024),
            AspectRatio::Landscape4x3 => (1024, 768),
            AspectRatio::Wide16x9 => (1536, 864),
            AspectRatio::Tall9x16 => (864, 1536),
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = GenerateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        AspectRatio::ALL
            .into_iter()
            .find(|ratio| ratio.as_str() == trimmed)
            .ok_or_else(|| {
                GenerateError::InvalidInput(format!(
                    "unsupported aspect ratio {trimmed:?} (expected one of 1:1, 3:4, 4:3, 16:9, 9:16)"
                ))
            })
    }
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub temperature: f64,
    pub model: String,
    pub reference_image: Option<Vec<u8>>,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: AspectRatio::default(),
            temperature: 1.0,
            model: String::new(),
            reference_image: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("content filtered: {0}")]
    ContentFiltered(String),
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("provider returned no image: {0}")]
    EmptyResponse(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("image generation failed after {attempts} attempts; last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<GenerateError>,
    },
}

impl GenerateError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GenerateError::RateLimited(_))
    }

    /// Whether another attempt could succeed. For `Exhausted` this reflects
    /// the last underlying error so a later user retry is still offered.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerateError::RateLimited(_)
            | GenerateError::Transient(_)
            | GenerateError::EmptyResponse(_)
            | GenerateError::Provider(_) => true,
            GenerateError::ContentFiltered(_)
            | GenerateError::InvalidInput(_)
            | GenerateError::Auth(_) => false,
            GenerateError::Exhausted { last, .. } => last.is_retryable(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, GenerateError::Exhausted { .. })
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(provider: &str, status: StatusCode, body: &str) -> Self {
        let detail = format!("{provider} returned {}: {}", status.as_u16(), truncate_text(body, 512));
        let lowered = body.to_ascii_lowercase();
        if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
            GenerateError::RateLimited(detail)
        } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            GenerateError::Transient(detail)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            GenerateError::Auth(detail)
        } else if lowered.contains("safety") || lowered.contains("blocked") {
            GenerateError::ContentFiltered(detail)
        } else if status.is_client_error() {
            GenerateError::InvalidInput(detail)
        } else {
            GenerateError::Provider(detail)
        }
    }

    pub fn from_transport(provider: &str, err: reqwest::Error) -> Self {
        let detail = format!("{provider} request failed: {err}");
        if err.is_timeout() || err.is_connect() || err.is_request() {
            GenerateError::Transient(detail)
        } else {
            GenerateError::Provider(detail)
        }
    }
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn validate_config(&self) -> bool;
    fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError>;
}

impl<G: ImageGenerator + ?Sized> ImageGenerator for Box<G> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn validate_config(&self) -> bool {
        (**self).validate_config()
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
        (**self).generate_image(request)
    }
}

impl<G: ImageGenerator + ?Sized> ImageGenerator for Arc<G> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn validate_config(&self) -> bool {
        (**self).validate_config()
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
        (**self).generate_image(request)
    }
}

/// Build the adapter for one provider entry, wrapped in the default retry policy.
pub fn build_generator(
    name: &str,
    settings: &ProviderSettings,
) -> Result<Box<dyn ImageGenerator>, ConfigError> {
    let inner: Box<dyn ImageGenerator> = match settings.kind {
        ProviderKind::GoogleGenai => Box::new(GeminiGenerator::new(
            settings.require_api_key(name)?,
            settings.resolved_base_url(),
            settings.request_timeout(),
        )),
        ProviderKind::OpenaiCompatible => Box::new(OpenAiCompatibleGenerator::new(
            settings.require_api_key(name)?,
            settings.resolved_base_url(),
            settings.request_timeout(),
        )),
        ProviderKind::Dryrun => Box::new(DryrunGenerator::new()),
    };
    tracing::info!(
        provider = name,
        kind = settings.kind.as_str(),
        model = %settings.resolved_model(),
        "image generator ready"
    );
    Ok(Box::new(RetryingGenerator::new(inner, RetryPolicy::default())))
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

//! External caption/enhancement generation.
//!
//! `Generator` is the seam: production uses `GeminiClient` over the
//! Gemini-style generateContent HTTP API; tests substitute closures or
//! counters. Failures split into retryable (timeouts, 5xx, quota) and
//! terminal (4xx, malformed responses, missing credentials) so the retry
//! policy knows what is worth another attempt.

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Prompt for image captioning.
const CAPTION_PROMPT: &str = "Describe this image in 2-4 sentences as a single paragraph. \
    Use only visible facts: the main subject and any actions or poses; \
    notable objects or clothing; a few key colors; background elements; \
    and the lighting or atmosphere. Avoid speculation and brand names.";

/// System prompt for query enhancement.
const ENHANCE_SYSTEM_PROMPT: &str = "You rewrite short user queries into one clear, descriptive sentence for an image search engine.\n\
    \n\
    Your output must:\n\
    - Keep the user's exact wording at the start.\n\
    - Continue the same sentence with a short phrase such as 'the image might show ...' or 'the image might include ...'.\n\
    - In that clause, describe only what could visually appear in a photo that matches the query: objects, subjects, environments, or settings directly implied by it.\n\
    \n\
    Strict rules:\n\
    - Do NOT invent events, actions, emotions, relationships, props, or scenery not clearly implied.\n\
    - Do NOT add story, mood, time of day, or creative embellishment unless already explicit.\n\
    - Use neutral, factual language.\n\
    - If the query already looks like a complete photo caption, simply return it as-is.\n\
    - If the query is abstract (e.g. emotions, ideas), you may briefly ground it in a neutral, plausible visual form (e.g. 'a single person sitting alone').\n\
    - Output exactly ONE sentence, no bullet points, no multiple sentences, no quotes.\n\
    - Stay concise (under ~40 tokens).";

/// Few-shot examples steering enhancement toward literal visual phrasing.
const ENHANCE_FEW_SHOTS: &[(&str, &str)] = &[
    (
        "a person reading",
        "a person reading, the image might include an open book and hands holding the pages",
    ),
    (
        "mountain landscape",
        "a mountain landscape, the image might include rocky peaks and a clear sky",
    ),
    (
        "city skyline",
        "a city skyline, the image might include tall modern buildings and an urban horizon",
    ),
    (
        "fruit on a table",
        "fruit on a table, the image might include apples and oranges arranged on a wooden surface",
    ),
    (
        "feeling lonely",
        "feeling lonely, the image might include a single person sitting alone on a bench in an open space",
    ),
];

/// Generation failures, split by whether a retry can help.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    /// Transient failures (timeout, connection error, 5xx, quota) worth retrying.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Permanent failures (4xx, malformed response, missing credentials); retrying cannot help.
    #[error("terminal: {0}")]
    Terminal(String),
}

/// Size/token accounting for one caption generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaptionStats {
    pub orig_w: u32,
    pub orig_h: u32,
    pub new_w: u32,
    pub new_h: u32,
    pub jpeg_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CaptionOutput {
    pub caption: String,
    pub stats: CaptionStats,
}

/// External generation capability. Callers must route invocations through
/// the rate gate; implementations only perform the call.
pub trait Generator: Send + Sync {
    fn generate_caption(
        &self,
        image: &Path,
        max_edge_px: u32,
        jpeg_quality: u8,
    ) -> Result<CaptionOutput, GenerationError>;

    fn enhance_query(&self, query: &str) -> Result<String, GenerationError>;
}

/// Stand-in used when no API key is configured. Every call fails terminally
/// with the stored reason; cache hits still work without ever reaching it.
pub struct UnconfiguredGenerator(pub String);

impl Generator for UnconfiguredGenerator {
    fn generate_caption(
        &self,
        _image: &Path,
        _max_edge_px: u32,
        _jpeg_quality: u8,
    ) -> Result<CaptionOutput, GenerationError> {
        Err(GenerationError::Terminal(self.0.clone()))
    }

    fn enhance_query(&self, _query: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Terminal(self.0.clone()))
    }
}

/// Client for a Gemini-style generateContent endpoint.
pub struct GeminiClient {
    client: reqwest::blocking::Client,
    api_base: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(
        api_base: &str,
        model: &str,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        if api_key.is_empty() {
            return Err(GenerationError::Terminal(
                "GEMINI_API_KEY not set; captioning and query enhancement are unavailable".into(),
            ));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Terminal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    fn generate(&self, contents: Value, temperature: Option<f32>) -> Result<Value, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.api_base, self.model);

        let mut body = json!({ "contents": contents });
        if let Some(t) = temperature {
            body["generationConfig"] = json!({ "temperature": t });
        }

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    GenerationError::Retryable(format!("request failed: {e}"))
                } else {
                    GenerationError::Terminal(format!("request failed: {e}"))
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(GenerationError::Retryable(format!(
                "generation service returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(GenerationError::Terminal(format!(
                "generation service returned {status}"
            )));
        }

        resp.json::<Value>()
            .map_err(|e| GenerationError::Terminal(format!("malformed response body: {e}")))
    }
}

impl Generator for GeminiClient {
    fn generate_caption(
        &self,
        image: &Path,
        max_edge_px: u32,
        jpeg_quality: u8,
    ) -> Result<CaptionOutput, GenerationError> {
        let (b64, mut stats) = prep_image(image, max_edge_px, jpeg_quality)?;

        let contents = json!([{
            "role": "user",
            "parts": [
                { "inline_data": { "mime_type": "image/jpeg", "data": b64 } },
                { "text": CAPTION_PROMPT }
            ]
        }]);

        let resp = self.generate(contents, None)?;

        let raw = extract_text(&resp).ok_or_else(|| {
            GenerationError::Terminal("response contained no caption text".into())
        })?;
        let caption = clean_caption(&raw);
        if caption.is_empty() {
            return Err(GenerationError::Terminal(
                "caption was empty after cleanup".into(),
            ));
        }

        if let Some(usage) = resp.get("usageMetadata") {
            stats.input_tokens = usage.get("promptTokenCount").and_then(|v| v.as_u64());
            stats.output_tokens = usage.get("candidatesTokenCount").and_then(|v| v.as_u64());
        }

        Ok(CaptionOutput { caption, stats })
    }

    fn enhance_query(&self, query: &str) -> Result<String, GenerationError> {
        let mut contents = vec![json!({
            "role": "user",
            "parts": [{ "text": ENHANCE_SYSTEM_PROMPT }]
        })];
        for (q, a) in ENHANCE_FEW_SHOTS {
            contents.push(json!({ "role": "user", "parts": [{ "text": q }] }));
            contents.push(json!({ "role": "model", "parts": [{ "text": a }] }));
        }
        contents.push(json!({ "role": "user", "parts": [{ "text": query }] }));

        // Low temperature keeps the expansion literal.
        let resp = self.generate(Value::Array(contents), Some(0.1))?;

        let text = extract_text(&resp).unwrap_or_default();
        Ok(clean_enhanced(&text, query))
    }
}

/// Resize an image to fit `max_edge_px`, encode as JPEG, base64 it.
fn prep_image(
    path: &Path,
    max_edge_px: u32,
    jpeg_quality: u8,
) -> Result<(String, CaptionStats), GenerationError> {
    let img = image::open(path)
        .map_err(|e| GenerationError::Terminal(format!("failed to decode {}: {e}", path.display())))?;

    let rgb = img.to_rgb8();
    let (orig_w, orig_h) = rgb.dimensions();

    let long_edge = orig_w.max(orig_h);
    let processed = if long_edge > max_edge_px {
        let scale = max_edge_px as f64 / long_edge as f64;
        let new_w = ((orig_w as f64 * scale).round() as u32).max(1);
        let new_h = ((orig_h as f64 * scale).round() as u32).max(1);
        image::imageops::resize(&rgb, new_w, new_h, image::imageops::FilterType::Lanczos3)
    } else {
        rgb
    };
    let (new_w, new_h) = processed.dimensions();

    let mut jpeg = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg);
    let encoder = JpegEncoder::new_with_quality(&mut cursor, jpeg_quality);
    processed
        .write_with_encoder(encoder)
        .map_err(|e| GenerationError::Terminal(format!("JPEG encode failed: {e}")))?;

    let stats = CaptionStats {
        orig_w,
        orig_h,
        new_w,
        new_h,
        jpeg_bytes: jpeg.len(),
        input_tokens: None,
        output_tokens: None,
    };

    Ok((STANDARD.encode(&jpeg), stats))
}

/// Pull the first text content out of a generateContent response.
fn extract_text(resp: &Value) -> Option<String> {
    let candidates = resp.get("candidates")?.as_array()?;
    for candidate in candidates {
        let parts = candidate.get("content")?.get("parts")?.as_array()?;
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if !texts.is_empty() {
            return Some(texts.join(" "));
        }
    }
    None
}

/// Strip the verbose framing models like to wrap captions in.
fn clean_caption(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.is_empty() {
        return text;
    }

    // Drop everything up to the first colon ("Caption: ...").
    if let Some(idx) = text.find(':') {
        text = text[idx + 1..].to_string();
    }

    // Collapse line breaks and runs of whitespace.
    text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    for prefix in ["Here is", "Here's", "Certainly", "This image", "The image shows"] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim_start_matches([' ', ',', '.', '-']).trim().to_string();
            break;
        }
    }

    text
}

/// Normalize an enhancement response to one clean sentence, falling back to
/// the raw query when the model returned nothing usable.
fn clean_enhanced(text: &str, fallback: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return fallback.trim().to_string();
    }

    let mut out = text
        .lines()
        .next()
        .unwrap_or(text)
        .trim()
        .trim_matches(['"', '\''])
        .trim()
        .to_string();

    // Keep only the first sentence.
    if out.contains('.') {
        if let Some(first) = out.split('.').map(str::trim).find(|p| !p.is_empty()) {
            out = first.to_string();
        }
    }

    if out.is_empty() {
        fallback.trim().to_string()
    } else {
        out
    }
}

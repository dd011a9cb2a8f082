// src/llm_extract.rs

use crate::config::{ExtractionMode, LlmBackend, LlmSection};
use crate::error::{FilingError, Result};
use crate::pdf_extract::{self, PdfContent};
use crate::record::RawExtraction;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Sampling temperature for every extraction call. Fixed so that repeated calls can
/// be compared for equality.
const TEMPERATURE: f64 = 0.0;

/// Upper bound on PDF text sent in text mode.
const MAX_TEXT_CHARS: usize = 24_000;

/// Instruction text used when no prompt file is configured.
pub const DEFAULT_PROMPT: &str = r#"Read the attached purchase order and extract the required fields.

Always return one flat JSON object and nothing else: no markdown fences, no commentary.
Do not use thousands separators in numbers (10000, not 10,000).

Extract these fields:
- STYLE# (letters, digits and dashes)
- Color (taken from the description line)
- Order# (letters and digits, followed by a location such as MASTER, GA1, AZ1 or PL1)
- Location (the location part of Order#)
- Size 00, Size 0, Size 2, ... Size 24 (integer quantity per size; sizes may carry a
  suffix on the PO such as 0P, 14W or 16W but the key is just the number; omit sizes
  that are not ordered)
- Total (integer total quantity)
- PO ISSUE (the PO date, mm/dd)
- Requested Ship Date (mm/dd/yy)
- Inseam Size (from the line item comments; empty if absent)
- DESCRIPTION (the product name only)
- C Price (unit price)

Notes:
- Order# is NOT the "Release #".
- The style number comes after the buyer's color description and before the unit
  price. Do not confuse it with the Item Number.
- A quantity is the value printed before EACH, not the line total.
- Sizes follow "Buyers Item Size Description:".

Example:
{"STYLE#": "WD1017-SF", "Color": "Medium Wash", "Order#": "A1174098-MASTER-US", "Location": "MASTER", "Size 0": 2, "Size 2": 5, "Size 4": 10, "Size 16": 3, "Total": 20, "PO ISSUE": "1/27", "Requested Ship Date": "6/25/25", "Inseam Size": 31, "DESCRIPTION": "Pocket Wide Leg Jean", "C Price": 18.5}"#;

/// A PDF made ready for (possibly repeated) extraction calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedDocument {
    /// Uploaded to the provider; referenced by id.
    Uploaded { file_id: String },
    /// Text extracted locally.
    Text(String),
}

/// The AI document-extraction call, treated as a black box.
#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    async fn prepare(&self, filename: &str, pdf: &[u8]) -> Result<PreparedDocument>;

    /// One extraction call. Expected to return a JSON object as text.
    async fn complete(&self, document: &PreparedDocument) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyPolicy {
    /// Require two identical outputs before accepting one.
    pub enabled: bool,
    pub max_attempts: u32,
}

impl ConsistencyPolicy {
    pub fn from_config(llm: &LlmSection) -> Self {
        Self {
            enabled: llm.consistency_check,
            max_attempts: llm.max_attempts.max(1),
        }
    }
}

/// Call the oracle until it produces an accepted output.
///
/// Without the consistency check the first output is accepted. With it, each attempt
/// makes two calls and accepts only byte-identical outputs.
pub async fn consistent_output(
    oracle: &dyn ExtractionOracle,
    document: &PreparedDocument,
    policy: ConsistencyPolicy,
) -> Result<String> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let first = oracle.complete(document).await?;
        if !policy.enabled {
            return Ok(first);
        }
        let second = oracle.complete(document).await?;
        if first == second {
            info!(attempt, "Extraction outputs agree");
            return Ok(first);
        }
        warn!(attempt, of = attempts, "Extraction outputs differ, retrying");
    }
    Err(FilingError::ExtractionInconsistent { attempts })
}

/// Prepare, extract and parse one PDF.
pub async fn extract(
    oracle: &dyn ExtractionOracle,
    filename: &str,
    pdf: &[u8],
    policy: ConsistencyPolicy,
) -> Result<RawExtraction> {
    let document = oracle.prepare(filename, pdf).await?;
    let text = consistent_output(oracle, &document, policy).await?;
    parse_output(&text)
}

/// Parse model output into a raw extraction, tolerating fences and preamble.
pub fn parse_output(content: &str) -> Result<RawExtraction> {
    // Strip markdown fences if the model added them despite instructions
    let json_str = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    // Some models (especially with /think mode) may prepend reasoning text.
    let json_str = extract_json_object(json_str)?;
    RawExtraction::parse(json_str)
}

/// Extract the outermost JSON object from a string that may contain
/// surrounding text (e.g. thinking tokens from qwen3).
fn extract_json_object(s: &str) -> Result<&str> {
    let malformed = |msg: &str| FilingError::InvalidExtraction(format!("{msg}: {s}"));
    let start = s.find('{').ok_or_else(|| malformed("no '{' in model output"))?;
    let end = s.rfind('}').ok_or_else(|| malformed("no '}' in model output"))?;
    if end <= start {
        return Err(malformed("malformed JSON in model output"));
    }
    Ok(&s[start..=end])
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    temperature: f64,
    input: Vec<ResponsesInput>,
}

#[derive(Debug, Serialize)]
struct ResponsesInput {
    role: &'static str,
    content: Vec<InputPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputPart {
    InputFile { file_id: String },
    InputText { text: String },
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

/// Resolved endpoint configuration ready to make API calls.
struct ResolvedEndpoint {
    base_url: String,
    model: String,
    api_key: String,
}

/// Resolve the LLM config section into a concrete endpoint.
fn resolve_endpoint(llm: &LlmSection) -> Result<ResolvedEndpoint> {
    match llm.backend {
        LlmBackend::Ollama => {
            if llm.mode == ExtractionMode::File {
                return Err(FilingError::Config(
                    "the ollama backend cannot take file uploads; set llm.mode = \"text\"".into(),
                ));
            }
            info!(
                url = %llm.ollama.base_url,
                model = %llm.ollama.model,
                "Using Ollama (local) backend"
            );
            Ok(ResolvedEndpoint {
                base_url: llm.ollama.base_url.clone(),
                model: llm.ollama.model.clone(),
                api_key: "ollama".to_string(), // required by API but ignored
            })
        }
        LlmBackend::Remote => {
            let api_key = std::env::var("LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .map_err(|_| {
                    FilingError::Config(
                        "LLM_API_KEY (or OPENAI_API_KEY) env var required for remote backend".into(),
                    )
                })?;
            info!(
                url = %llm.remote.base_url,
                model = %llm.remote.model,
                "Using remote API backend"
            );
            Ok(ResolvedEndpoint {
                base_url: llm.remote.base_url.trim_end_matches('/').to_string(),
                model: llm.remote.model.clone(),
                api_key,
            })
        }
    }
}

/// Check if the Ollama server is reachable.
async fn check_ollama_health(client: &Client, base_url: &str) -> bool {
    // Ollama's health endpoint is at the root (not under /v1)
    let health_url = base_url.trim_end_matches('/').trim_end_matches("/v1");

    match client
        .get(health_url)
        .timeout(Duration::from_secs(3))
        .send()
        .await
    {
        Ok(resp) => {
            if resp.status().is_success() {
                info!("Ollama server is reachable");
                true
            } else {
                warn!(status = %resp.status(), "Ollama server returned non-OK status");
                false
            }
        }
        Err(e) => {
            warn!(error = %e, "Ollama server not reachable");
            false
        }
    }
}

/// Extraction through an OpenAI-compatible API.
pub struct LlmOracle {
    client: Client,
    endpoint: ResolvedEndpoint,
    mode: ExtractionMode,
    prompt: String,
}

impl LlmOracle {
    pub async fn connect(llm: &LlmSection, prompt: String) -> Result<Self> {
        let endpoint = resolve_endpoint(llm)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(llm.timeout_secs))
            .build()
            .map_err(|e| FilingError::Config(format!("HTTP client: {e}")))?;

        // Health check for local backends
        if llm.backend == LlmBackend::Ollama && !check_ollama_health(&client, &endpoint.base_url).await {
            return Err(FilingError::Extraction(format!(
                "Ollama is not running at {}. Start it with: ollama serve",
                endpoint.base_url
            )));
        }

        Ok(Self {
            client,
            endpoint,
            mode: llm.mode,
            prompt,
        })
    }

    async fn upload(&self, filename: &str, pdf: &[u8]) -> Result<String> {
        let part = Part::bytes(pdf.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/pdf")
            .map_err(|e| FilingError::Extraction(e.to_string()))?;
        let form = Form::new().text("purpose", "user_data").part("file", part);

        let response = self
            .client
            .post(format!("{}/files", self.endpoint.base_url))
            .bearer_auth(&self.endpoint.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| FilingError::Extraction(format!("upload failed: {e}")))?;
        let file: FileObject = read_json(response).await?;
        info!(file_id = %file.id, bytes = pdf.len(), "PDF uploaded");
        Ok(file.id)
    }

    async fn respond_to_file(&self, file_id: &str) -> Result<String> {
        let request = ResponsesRequest {
            model: self.endpoint.model.clone(),
            temperature: TEMPERATURE,
            input: vec![ResponsesInput {
                role: "user",
                content: vec![
                    InputPart::InputFile {
                        file_id: file_id.to_string(),
                    },
                    InputPart::InputText {
                        text: self.prompt.clone(),
                    },
                ],
            }],
        };
        let response = self
            .client
            .post(format!("{}/responses", self.endpoint.base_url))
            .bearer_auth(&self.endpoint.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FilingError::Extraction(e.to_string()))?;
        let body: ResponsesResponse = read_json(response).await?;

        let text: String = body
            .output
            .iter()
            .flat_map(|item| item.content.iter())
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text.as_deref())
            .collect();
        if text.is_empty() {
            return Err(FilingError::Extraction("empty response from model".into()));
        }
        Ok(text)
    }

    async fn chat_on_text(&self, pdf_text: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.endpoint.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Extract the fields from the following PO text:\n\n{pdf_text}"),
                },
            ],
            temperature: TEMPERATURE,
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint.base_url))
            .bearer_auth(&self.endpoint.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FilingError::Extraction(e.to_string()))?;
        let chat: ChatResponse = read_json(response).await?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| FilingError::Extraction("empty response from model".into()))
    }
}

#[async_trait]
impl ExtractionOracle for LlmOracle {
    async fn prepare(&self, filename: &str, pdf: &[u8]) -> Result<PreparedDocument> {
        match self.mode {
            ExtractionMode::File => {
                let pages = pdf_extract::page_count(pdf)?;
                info!(pages, "PDF structure ok");
                let file_id = self.upload(filename, pdf).await?;
                Ok(PreparedDocument::Uploaded { file_id })
            }
            ExtractionMode::Text => match pdf_extract::extract_text_from_pdf(pdf) {
                PdfContent::Text(text) => Ok(PreparedDocument::Text(truncate_chars(&text, MAX_TEXT_CHARS))),
                PdfContent::ScannedImage => Err(FilingError::UnreadablePdf(format!(
                    "{filename} looks scanned; use llm.mode = \"file\" for image-only POs"
                ))),
                PdfContent::Error(e) => Err(FilingError::UnreadablePdf(e)),
            },
        }
    }

    async fn complete(&self, document: &PreparedDocument) -> Result<String> {
        match document {
            PreparedDocument::Uploaded { file_id } => self.respond_to_file(file_id).await,
            PreparedDocument::Text(text) => self.chat_on_text(text).await,
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(FilingError::Extraction(format!("LLM API error {status}: {body}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| FilingError::Extraction(format!("unexpected API response: {e}")))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::ScriptedOracle;
    use super::*;

    fn doc() -> PreparedDocument {
        PreparedDocument::Text("po.pdf".into())
    }

    const ON: ConsistencyPolicy = ConsistencyPolicy {
        enabled: true,
        max_attempts: 3,
    };

    #[tokio::test]
    async fn test_unchecked_takes_first_output() {
        let oracle = ScriptedOracle::new(["a", "b"]);
        let policy = ConsistencyPolicy {
            enabled: false,
            max_attempts: 3,
        };
        assert_eq!(consistent_output(&oracle, &doc(), policy).await.unwrap(), "a");
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_checked_accepts_agreeing_pair() {
        let oracle = ScriptedOracle::new(["a", "b", "c", "c"]);
        assert_eq!(consistent_output(&oracle, &doc(), ON).await.unwrap(), "c");
        assert_eq!(oracle.calls(), 4);
    }

    #[tokio::test]
    async fn test_checked_gives_up_after_budget() {
        let oracle = ScriptedOracle::new(["1", "2", "3", "4", "5", "6", "7", "7"]);
        let err = consistent_output(&oracle, &doc(), ON).await.unwrap_err();
        assert!(matches!(err, FilingError::ExtractionInconsistent { attempts: 3 }));
        assert_eq!(oracle.calls(), 6);
    }

    #[test]
    fn test_parse_output_strips_wrapping() {
        let fenced = "```json\n{\"Order#\": \"PO1-MASTER\"}\n```";
        assert!(parse_output(fenced).is_ok());

        let thinking = "<think>the order is PO1</think>\n{\"Order#\": \"PO1-GA1\", \"Size 0\": 3}";
        let raw = parse_output(thinking).unwrap();
        let record = crate::record::normalize(raw).unwrap();
        assert_eq!(record.location, "GA1");

        assert!(matches!(parse_output("no json here"), Err(FilingError::InvalidExtraction(_))));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_prompt_names_every_size() {
        assert!(DEFAULT_PROMPT.contains("Size 00"));
        assert!(DEFAULT_PROMPT.contains("Size 24"));
        assert!(DEFAULT_PROMPT.contains("Requested Ship Date"));
    }
}

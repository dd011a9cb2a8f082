use crate::error::{FilingError, Result};
use crate::layout::Layout;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::{env, fs};

pub const DEFAULT_CONFIG_PATH: &str = "po_filing.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    pub paths: PathsSection,
    #[serde(default)]
    pub llm: LlmSection,
    pub google: GoogleSection,
    #[serde(default)]
    pub layout: Layout,
}

fn default_db_path() -> String {
    "filing/filings.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PathsSection {
    pub intake_dir: PathBuf,
    pub filing_root: PathBuf,
    /// Replaces the built-in instruction text.
    #[serde(default)]
    pub prompt_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    #[default]
    Remote,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Upload the PDF itself.
    #[default]
    File,
    /// Send locally extracted text.
    Text,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub backend: LlmBackend,
    #[serde(default)]
    pub mode: ExtractionMode,
    #[serde(default)]
    pub consistency_check: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_remote")]
    pub remote: EndpointConfig,
    #[serde(default = "default_ollama")]
    pub ollama: EndpointConfig,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            mode: ExtractionMode::default(),
            consistency_check: false,
            max_attempts: default_max_attempts(),
            timeout_secs: default_llm_timeout(),
            remote: default_remote(),
            ollama: default_ollama(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_remote() -> EndpointConfig {
    EndpointConfig {
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4.1".to_string(),
    }
}

fn default_ollama() -> EndpointConfig {
    EndpointConfig {
        base_url: "http://localhost:11434/v1".to_string(),
        model: "qwen3:8b".to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleSection {
    pub service_account_key: PathBuf,
    pub tracking_spreadsheet_id: String,
    #[serde(default = "default_tracking_tab")]
    pub tracking_tab: String,
    pub template_spreadsheet_id: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_google_timeout")]
    pub timeout_secs: u64,
}

impl GoogleSection {
    /// `GOOGLE_JSON_KEY` wins over the configured key path.
    pub fn key_path(&self) -> PathBuf {
        env::var_os("GOOGLE_JSON_KEY")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.service_account_key.clone())
    }
}

fn default_tracking_tab() -> String {
    "Sheet1".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_google_timeout() -> u64 {
    60
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| FilingError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| FilingError::Config(e.to_string()))?;
        if config.layout.row_for(crate::layout::MASTER).is_none() {
            return Err(FilingError::Config(
                "[layout.location_rows] must define a MASTER row".into(),
            ));
        }
        if let Some((location, _)) = config.layout.location_rows.iter().find(|(_, row)| **row == 0) {
            return Err(FilingError::Config(format!(
                "[layout.location_rows] {location} = 0: sheet rows start at 1"
            )));
        }
        Ok(config)
    }

    /// The `--config` path (or `PO_FILING_CONFIG`), else the default file name.
    pub fn resolve_path(flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Instruction text for the extraction model.
    pub fn prompt(&self) -> Result<String> {
        match &self.paths.prompt_path {
            Some(path) => fs::read_to_string(path).map_err(|e| {
                FilingError::Config(format!("cannot read prompt {}: {e}", path.display()))
            }),
            None => Ok(crate::llm_extract::DEFAULT_PROMPT.to_string()),
        }
    }
}

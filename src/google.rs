// src/google.rs

//! Google Sheets / Drive collaborators: the shared tracking sheet and the live template
//! spreadsheet. Plain REST calls through reqwest, authorized with a service-account token.

use crate::cellmap::CellRef;
use crate::config::GoogleSection;
use crate::error::{FilingError, Result};
use crate::sink::is_plain_number;
use crate::sink::template::TemplateSheet;
use crate::sink::tracking::TrackingSheet;
use async_trait::async_trait;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use yup_oauth2::ServiceAccountAuthenticator;
use yup_oauth2::authenticator::Authenticator;

const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/drive.readonly",
];
const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_API: &str = "https://www.googleapis.com/drive/v3/files";
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Base delay; attempt `n` waits `n` times this long.
const BACKOFF: Duration = Duration::from_secs(2);

type ServiceAuth = Authenticator<HttpsConnector<HttpConnector>>;

/// Authorized HTTP access to the Google APIs, shared by both sheets.
#[derive(Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    auth: ServiceAuth,
    retries: u32,
}

impl GoogleClient {
    pub async fn connect(google: &GoogleSection) -> Result<Self> {
        let key_path = google.key_path();
        let key = yup_oauth2::read_service_account_key(&key_path)
            .await
            .map_err(|e| {
                FilingError::Config(format!(
                    "cannot read service account key {}: {e}",
                    key_path.display()
                ))
            })?;
        let client_email = key.client_email.clone();
        let auth = ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|e| FilingError::Config(format!("service account auth: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(google.timeout_secs))
            .build()
            .map_err(|e| FilingError::Config(format!("HTTP client: {e}")))?;

        info!(account = %client_email, "Google service account ready");
        Ok(Self {
            http,
            auth,
            retries: google.retries,
        })
    }

    async fn bearer(&self) -> Result<String> {
        let token = self
            .auth
            .token(&SCOPES)
            .await
            .map_err(|e| FilingError::SinkWriteFailure(format!("token refresh failed: {e}")))?;
        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| FilingError::SinkWriteFailure("token response carried no access token".into()))
    }

    /// Send a request, retrying transport errors, 429 and 5xx with linear back-off.
    async fn send<F>(&self, what: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let token = self.bearer().await?;
            let failure = match build(&self.http).bearer_auth(&token).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let message = format!("{what}: HTTP {status}: {body}");
                    if !is_transient(status) {
                        return Err(FilingError::SinkWriteFailure(message));
                    }
                    message
                }
                Err(e) => format!("{what}: {e}"),
            };

            if attempt > self.retries {
                return Err(FilingError::SinkWriteFailure(failure));
            }
            let delay = BACKOFF * attempt;
            warn!(
                attempt,
                retries = self.retries,
                delay_secs = delay.as_secs(),
                error = %failure,
                "Google API call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Vec<Vec<String>>> {
        let url = format!(
            "{SHEETS_API}/{spreadsheet_id}/values/{}",
            urlencoding::encode(range)
        );
        let resp = self.send("read values", |http| http.get(&url)).await?;
        let body: ValueRange = resp
            .json()
            .await
            .map_err(|e| FilingError::SinkWriteFailure(format!("unexpected values response: {e}")))?;
        Ok(body.rows())
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `'Tab Name'` with embedded quotes doubled, as A1 notation requires.
fn quote_tab(tab: &str) -> String {
    format!("'{}'", tab.replace('\'', "''"))
}

fn a1_range(tab: &str, cells: &str) -> String {
    format!("{}!{cells}", quote_tab(tab))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    major_dimension: Option<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl ValueRange {
    fn write(range: String, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self {
            range: Some(range),
            major_dimension: Some("ROWS".to_string()),
            values: rows,
        }
    }

    fn rows(self) -> Vec<Vec<String>> {
        self.values
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateValues {
    value_input_option: &'static str,
    data: Vec<ValueRange>,
}

/// The shared tracking sheet (one tab of one spreadsheet).
pub struct GoogleTracking {
    client: GoogleClient,
    spreadsheet_id: String,
    tab: String,
}

impl GoogleTracking {
    pub fn new(client: GoogleClient, google: &GoogleSection) -> Self {
        Self {
            client,
            spreadsheet_id: google.tracking_spreadsheet_id.clone(),
            tab: google.tracking_tab.clone(),
        }
    }
}

#[async_trait]
impl TrackingSheet for GoogleTracking {
    async fn header(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .get_values(&self.spreadsheet_id, &a1_range(&self.tab, "1:1"))
            .await?;
        let header = rows.into_iter().next().unwrap_or_default();
        if header.is_empty() {
            return Err(FilingError::SinkWriteFailure(format!(
                "tracking tab {:?} has no header row",
                self.tab
            )));
        }
        Ok(header)
    }

    async fn append_row(&self, row: &[String]) -> Result<u32> {
        // The values API trims trailing empty rows, so the row count is the last used row.
        let used = self
            .client
            .get_values(&self.spreadsheet_id, &quote_tab(&self.tab))
            .await?
            .len();
        let index = used as u32 + 1;
        let range = a1_range(&self.tab, &format!("A{index}"));
        let url = format!(
            "{SHEETS_API}/{}/values/{}?valueInputOption=RAW",
            self.spreadsheet_id,
            urlencoding::encode(&range)
        );
        let cells = row.iter().cloned().map(serde_json::Value::String).collect();
        let body = ValueRange::write(range, vec![cells]);
        self.client
            .send("append tracking row", |http| http.put(&url).json(&body))
            .await?;
        Ok(index)
    }
}

/// The template spreadsheet with one tab per size category.
pub struct GoogleTemplate {
    client: GoogleClient,
    spreadsheet_id: String,
}

impl GoogleTemplate {
    pub fn new(client: GoogleClient, google: &GoogleSection) -> Self {
        Self {
            client,
            spreadsheet_id: google.template_spreadsheet_id.clone(),
        }
    }
}

/// Quantities go out as JSON numbers so the exported cells are numeric, as patched
/// cells are; RAW keeps every other value exactly as written.
fn template_value(value: &str) -> serde_json::Value {
    if is_plain_number(value) {
        if let Ok(n) = value.parse::<i64>() {
            return n.into();
        }
        if let Some(n) = value.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(value.to_string())
}

fn batch_update_body(tab: &str, cells: &[(CellRef, String)]) -> BatchUpdateValues {
    BatchUpdateValues {
        value_input_option: "RAW",
        data: cells
            .iter()
            .map(|(cell, value)| {
                ValueRange::write(a1_range(tab, &cell.to_string()), vec![vec![template_value(value)]])
            })
            .collect(),
    }
}

#[async_trait]
impl TemplateSheet for GoogleTemplate {
    async fn write_cells(&self, tab: &str, cells: &[(CellRef, String)]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }
        let url = format!("{SHEETS_API}/{}/values:batchUpdate", self.spreadsheet_id);
        let body = batch_update_body(tab, cells);
        self.client
            .send("write template cells", |http| http.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn export_xlsx(&self) -> Result<Vec<u8>> {
        let url = format!(
            "{DRIVE_API}/{}/export?mimeType={}",
            self.spreadsheet_id,
            urlencoding::encode(XLSX_MIME)
        );
        let resp = self.client.send("export template", |http| http.get(&url)).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FilingError::SinkWriteFailure(format!("export download: {e}")))?;
        Ok(bytes.to_vec())
    }
}

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::video::{StoredRow, HEADER, URL_COLUMN};

/// Tabular backend the pipeline appends to. The url column is the dedup key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Url keys of every stored row, header excluded.
    async fn existing_keys(&self) -> Result<HashSet<String>, StoreError>;

    async fn append_row(&self, row: &StoredRow) -> Result<(), StoreError>;

    /// Appends in order. The default goes row by row, so a failure leaves the
    /// rows before it persisted and reports how many landed.
    async fn append_rows(&self, rows: &[StoredRow]) -> Result<(), StoreError> {
        for (appended, row) in rows.iter().enumerate() {
            if let Err(e) = self.append_row(row).await {
                return Err(StoreError::Write {
                    appended,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// In-process store. Rejects rows whose url is already present.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<StoredRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_rows(rows: Vec<StoredRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    #[cfg(test)]
    pub fn rows(&self) -> Vec<StoredRow> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredRow>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn existing_keys(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.lock().iter().map(|r| r.url.clone()).collect())
    }

    async fn append_row(&self, row: &StoredRow) -> Result<(), StoreError> {
        let mut rows = self.lock();
        if rows.iter().any(|r| r.url == row.url) {
            return Err(StoreError::Write {
                appended: 0,
                message: format!("duplicate url {}", row.url),
            });
        }
        rows.push(row.clone());
        Ok(())
    }
}

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Google Sheets worksheet over the v4 REST API. The bearer token is
/// provisioned outside this process.
pub struct SheetsRecordStore {
    client: reqwest::Client,
    spreadsheet_id: String,
    sheet_name: String,
    token: String,
    /// Set once the header row is known to exist. Checked before the first append.
    header: OnceCell<()>,
}

impl SheetsRecordStore {
    fn new(spreadsheet_id: &str, sheet_name: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            spreadsheet_id: spreadsheet_id.to_string(),
            sheet_name: sheet_name.to_string(),
            token: token.to_string(),
            header: OnceCell::new(),
        }
    }

    /// Opens the worksheet, failing if the spreadsheet or tab cannot be reached.
    /// Read-only: nothing is written until rows are appended.
    pub async fn connect(
        spreadsheet_id: &str,
        sheet_name: &str,
        token: &str,
    ) -> Result<Self, StoreError> {
        let store = Self::new(spreadsheet_id, sheet_name, token);

        let url = format!(
            "{}/{}?fields=sheets.properties.title",
            SHEETS_API, store.spreadsheet_id
        );
        let resp = store
            .client
            .get(&url)
            .bearer_auth(&store.token)
            .send()
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Init(format!("status {}: {}", status.as_u16(), body)));
        }

        let meta: SpreadsheetMeta = resp
            .json()
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?;
        if !meta.sheets.iter().any(|s| s.properties.title == store.sheet_name) {
            return Err(StoreError::Init(format!(
                "worksheet {:?} not found in {}",
                store.sheet_name, store.spreadsheet_id
            )));
        }

        info!(spreadsheet = %store.spreadsheet_id, sheet = %store.sheet_name, "Worksheet opened");
        Ok(store)
    }

    /// Writes the column header into an empty worksheet so row 1 can be skipped on reads.
    async fn ensure_header(&self) -> Result<(), String> {
        let last = column_letter(HEADER.len() - 1);
        let range = format!("A1:{}1", last);
        let resp = self
            .client
            .get(&self.values_url(&range))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("header check, status {}: {}", status.as_u16(), body));
        }

        let existing: ValueRange = resp.json().await.map_err(|e| e.to_string())?;
        if !existing.values.is_empty() {
            return Ok(());
        }

        let header: Vec<serde_json::Value> = HEADER.iter().map(|h| json!(h)).collect();
        let resp = self
            .client
            .put(&format!("{}?valueInputOption=RAW", self.values_url(&range)))
            .bearer_auth(&self.token)
            .json(&json!({ "majorDimension": "ROWS", "values": [header] }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("could not write header, status {}", resp.status().as_u16()));
        }
        info!(sheet = %self.sheet_name, "Wrote header row");
        Ok(())
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/{}/values/{}",
            SHEETS_API,
            self.spreadsheet_id,
            urlencoding::encode(&a1_range(&self.sheet_name, range))
        )
    }

    /// Values are stored as given. A caption starting with `=` stays text.
    fn append_url(&self) -> String {
        format!(
            "{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.values_url("A1")
        )
    }

    fn append_body(rows: &[StoredRow]) -> serde_json::Value {
        let values: Vec<Vec<serde_json::Value>> = rows.iter().map(StoredRow::to_values).collect();
        json!({ "majorDimension": "ROWS", "values": values })
    }

    async fn append_values(&self, rows: &[StoredRow]) -> Result<(), String> {
        self.header.get_or_try_init(|| self.ensure_header()).await?;

        let resp = self
            .client
            .post(&self.append_url())
            .bearer_auth(&self.token)
            .json(&Self::append_body(rows))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("status {}: {}", status.as_u16(), body));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SheetsRecordStore {
    async fn existing_keys(&self) -> Result<HashSet<String>, StoreError> {
        let column = column_letter(URL_COLUMN);
        // row 1 is the header
        let url = self.values_url(&format!("{}2:{}", column, column));

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Read(format!("status {}: {}", status.as_u16(), body)));
        }

        let range: ValueRange = resp
            .json()
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?;
        let keys = url_keys(range.values);
        debug!(count = keys.len(), "Read existing url keys");
        Ok(keys)
    }

    async fn append_row(&self, row: &StoredRow) -> Result<(), StoreError> {
        self.append_values(std::slice::from_ref(row))
            .await
            .map_err(|message| StoreError::Write {
                appended: 0,
                message,
            })
    }

    async fn append_rows(&self, rows: &[StoredRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.append_values(rows)
            .await
            .map_err(|message| StoreError::Write {
                appended: 0,
                message,
            })
    }
}

/// `'Sheet Name'!G2:G` with quotes in the name doubled.
fn a1_range(sheet_name: &str, range: &str) -> String {
    format!("'{}'!{}", sheet_name.replace('\'', "''"), range)
}

fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn url_keys(values: Vec<Vec<serde_json::Value>>) -> HashSet<String> {
    values
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter_map(|cell| match cell {
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

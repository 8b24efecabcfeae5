use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use yup_oauth2::authenticator::DefaultAuthenticator;

use crate::config::ServiceAccount;
use crate::error::{LeaderboardError, Result};

/// Range covering the fixed voucher layout (code .. date assigned).
pub const VOUCHER_RANGE: &str = "Sheet1!A:G";
/// Range read by the chat search, headers included.
pub const SEARCH_RANGE: &str = "Sheet1!A:Z";

const SHEETS_API: &str = "https://sheets.googleapis.com";
const READ_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
const WRITE_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// A row that was claimed by `claim_first_available`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedVoucher {
    /// 1-based sheet row number (the header is row 1).
    pub row_number: usize,
    pub code: String,
}

/// Tabular data source holding the voucher tables.
///
/// Implementations must be cheap to share across requests.
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// Read `range` (A1 notation) of a spreadsheet as rows of cells.
    async fn read_range(&self, sheet_id: &str, range: &str) -> Result<Vec<Vec<String>>>;

    /// Overwrite `range` of a spreadsheet with `values`.
    async fn write_range(&self, sheet_id: &str, range: &str, values: Vec<Vec<String>>) -> Result<()>;

    /// Claim the first data row whose status is `available` by writing
    /// `cells` over columns B..G of that row.
    ///
    /// The default is a plain read followed by a write with no version check:
    /// two concurrent claims can pick the same row. Backends with an atomic
    /// compare-and-swap should override this.
    async fn claim_first_available(&self, sheet_id: &str, cells: &[String]) -> Result<Option<ClaimedVoucher>> {
        let rows = self.read_range(sheet_id, VOUCHER_RANGE).await?;
        let Some(claimed) = find_first_available(&rows) else {
            return Ok(None);
        };
        let range = format!("Sheet1!B{row}:G{row}", row = claimed.row_number);
        self.write_range(sheet_id, &range, vec![cells.to_vec()]).await?;
        Ok(Some(claimed))
    }
}

/// First data row (header excluded) whose trimmed, lowercased status is `available`.
pub fn find_first_available(rows: &[Vec<String>]) -> Option<ClaimedVoucher> {
    rows.iter().enumerate().skip(1).find_map(|(idx, row)| {
        let status = row.get(1).map(|s| s.trim().to_lowercase()).unwrap_or_default();
        (status == "available").then(|| ClaimedVoucher {
            row_number: idx + 1,
            code: row.first().cloned().unwrap_or_default(),
        })
    })
}

/// Convert column letters to a 1-based index: A -> 1, AA -> 27.
pub fn letter_to_column(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0usize, |acc, c| {
        c.is_ascii_alphabetic()
            .then(|| acc * 26 + (c.to_ascii_uppercase() as u8 - b'A') as usize + 1)
    })
}

/// Cell bounds of an A1 range. Rows are `None` for whole-column ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A1Range {
    pub start_col: usize,
    pub start_row: Option<usize>,
    pub end_col: usize,
    pub end_row: Option<usize>,
}

/// Parse `Sheet1!B5:G5` or `A:G` (sheet prefix optional). Reversed
/// bounds such as `B:A` are rejected.
pub fn parse_a1_range(range: &str) -> Option<A1Range> {
    let cells = range.rsplit('!').next()?;
    let (start, end) = cells.split_once(':')?;
    let split = |cell: &str| -> Option<(usize, Option<usize>)> {
        let letters: String = cell.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        let digits = &cell[letters.len()..];
        let col = letter_to_column(&letters)?;
        let row = if digits.is_empty() { None } else { Some(digits.parse().ok()?) };
        Some((col, row))
    };
    let (start_col, start_row) = split(start)?;
    let (end_col, end_row) = split(end)?;
    if end_col < start_col {
        return None;
    }
    if let (Some(first), Some(last)) = (start_row, end_row) {
        if last < first {
            return None;
        }
    }
    Some(A1Range {
        start_col,
        start_row,
        end_col,
        end_row,
    })
}

#[derive(Deserialize)]
struct SheetValuesResponse {
    values: Option<Vec<Vec<String>>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange<'a> {
    range: &'a str,
    major_dimension: &'static str,
    values: Vec<Vec<String>>,
}

/// Google Sheets v4 values API, authenticated as a service account.
///
/// The authenticator is built on first use and kept for the life of the
/// client; it caches tokens per scope and refreshes them before expiry.
pub struct GoogleSheets {
    http: reqwest::Client,
    account: ServiceAccount,
    base_url: String,
    auth: OnceCell<DefaultAuthenticator>,
}

impl GoogleSheets {
    pub fn new(account: ServiceAccount, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(GoogleSheets {
            http,
            account,
            base_url: SHEETS_API.to_string(),
            auth: OnceCell::new(),
        })
    }

    /// Point the client at another host (used against local stand-ins).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn service_account_key(&self) -> Result<yup_oauth2::ServiceAccountKey> {
        match &self.account {
            ServiceAccount::KeyFile(path) => yup_oauth2::read_service_account_key(path).await.map_err(|e| {
                LeaderboardError::Config(format!("cannot read service account key {}: {}", path.display(), e))
            }),
            ServiceAccount::Inline {
                client_email,
                private_key,
            } => serde_json::from_value(serde_json::json!({
                "type": "service_account",
                "client_email": client_email,
                "private_key": private_key,
                "token_uri": TOKEN_URI,
            }))
            .map_err(|e| LeaderboardError::Config(format!("invalid service account credentials: {}", e))),
        }
    }

    async fn authenticator(&self) -> Result<&DefaultAuthenticator> {
        self.auth
            .get_or_try_init(|| async {
                let key = self.service_account_key().await?;
                let auth = yup_oauth2::ServiceAccountAuthenticator::builder(key)
                    .build()
                    .await
                    .map_err(|e| LeaderboardError::UpstreamFetch(format!("service account authenticator: {}", e)))?;
                debug!("built service account authenticator");
                Ok::<_, LeaderboardError>(auth)
            })
            .await
    }

    async fn access_token(&self, scope: &str) -> Result<String> {
        let token = self
            .authenticator()
            .await?
            .token(&[scope])
            .await
            .map_err(|e| LeaderboardError::UpstreamFetch(format!("service account token: {}", e)))?;
        Ok(token.as_ref().to_string())
    }

    fn values_url(&self, sheet_id: &str, range: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.base_url,
            urlencoding::encode(sheet_id),
            urlencoding::encode(range)
        )
    }
}

async fn upstream_error(context: &str, resp: reqwest::Response) -> LeaderboardError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    LeaderboardError::UpstreamFetch(format!("{} returned {}: {}", context, status, body))
}

#[async_trait]
impl SheetSource for GoogleSheets {
    async fn read_range(&self, sheet_id: &str, range: &str) -> Result<Vec<Vec<String>>> {
        let token = self.access_token(READ_SCOPE).await?;
        let resp = self
            .http
            .get(self.values_url(sheet_id, range))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(upstream_error("sheet read", resp).await);
        }
        let body: SheetValuesResponse = resp.json().await?;
        Ok(body.values.unwrap_or_default())
    }

    async fn write_range(&self, sheet_id: &str, range: &str, values: Vec<Vec<String>>) -> Result<()> {
        let token = self.access_token(WRITE_SCOPE).await?;
        let body = ValueRange {
            range,
            major_dimension: "ROWS",
            values,
        };
        let resp = self
            .http
            .put(self.values_url(sheet_id, range))
            .query(&[("valueInputOption", "USER_ENTERED")])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(upstream_error("sheet write", resp).await);
        }
        Ok(())
    }
}

/// In-process sheet backend keyed by spreadsheet id.
///
/// Used by the test suites and for local demos; reads and writes are counted
/// so callers can assert on upstream traffic.
#[derive(Default)]
pub struct MemorySheets {
    tables: RwLock<HashMap<String, Vec<Vec<String>>>>,
    failing: RwLock<HashSet<String>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemorySheets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sheet_id: &str, rows: Vec<Vec<String>>) {
        self.tables.write().unwrap().insert(sheet_id.to_string(), rows);
    }

    /// Make every read and write of `sheet_id` fail until `recover` is called.
    pub fn fail(&self, sheet_id: &str) {
        self.failing.write().unwrap().insert(sheet_id.to_string());
    }

    pub fn recover(&self, sheet_id: &str) {
        self.failing.write().unwrap().remove(sheet_id);
    }

    pub fn table(&self, sheet_id: &str) -> Option<Vec<Vec<String>>> {
        self.tables.read().unwrap().get(sheet_id).cloned()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, sheet_id: &str) -> Result<()> {
        if self.failing.read().unwrap().contains(sheet_id) {
            return Err(LeaderboardError::UpstreamFetch(format!("sheet {} unavailable", sheet_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SheetSource for MemorySheets {
    async fn read_range(&self, sheet_id: &str, range: &str) -> Result<Vec<Vec<String>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check(sheet_id)?;
        let bounds = parse_a1_range(range)
            .ok_or_else(|| LeaderboardError::UpstreamFetch(format!("unsupported range {}", range)))?;
        let tables = self.tables.read().unwrap();
        let rows = tables
            .get(sheet_id)
            .ok_or_else(|| LeaderboardError::UpstreamFetch(format!("sheet {} not found", sheet_id)))?;
        Ok(rows
            .iter()
            .map(|row| {
                row.iter()
                    .skip(bounds.start_col - 1)
                    .take(bounds.end_col + 1 - bounds.start_col)
                    .cloned()
                    .collect()
            })
            .collect())
    }

    async fn write_range(&self, sheet_id: &str, range: &str, values: Vec<Vec<String>>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check(sheet_id)?;
        let bounds = parse_a1_range(range)
            .ok_or_else(|| LeaderboardError::UpstreamFetch(format!("unsupported range {}", range)))?;
        let Some(start_row) = bounds.start_row else {
            return Err(LeaderboardError::UpstreamFetch(format!("write range {} needs row bounds", range)));
        };

        let mut tables = self.tables.write().unwrap();
        let rows = tables.entry(sheet_id.to_string()).or_default();
        for (offset, values_row) in values.into_iter().enumerate() {
            let row_idx = start_row - 1 + offset;
            if rows.len() <= row_idx {
                rows.resize(row_idx + 1, Vec::new());
            }
            let row = &mut rows[row_idx];
            for (col_offset, value) in values_row.into_iter().enumerate() {
                let col_idx = bounds.start_col - 1 + col_offset;
                if col_idx >= bounds.end_col {
                    warn!("value outside write range {} dropped", range);
                    break;
                }
                if row.len() <= col_idx {
                    row.resize(col_idx + 1, String::new());
                }
                row[col_idx] = value;
            }
        }
        Ok(())
    }
}

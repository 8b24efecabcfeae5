use chrono::{DateTime, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LeaderboardError;

/// A voucher subscription tier.
///
/// Declaration order is the fixed processing order used by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlanKey {
    #[serde(rename = "12month")]
    TwelveMonth,
    #[serde(rename = "3month")]
    ThreeMonth,
    #[serde(rename = "6month")]
    SixMonth,
}

impl PlanKey {
    /// Plans in processing order: 12-month, 3-month, 6-month.
    pub const ALL: [PlanKey; 3] = [PlanKey::TwelveMonth, PlanKey::ThreeMonth, PlanKey::SixMonth];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKey::TwelveMonth => "12month",
            PlanKey::ThreeMonth => "3month",
            PlanKey::SixMonth => "6month",
        }
    }

    /// Human label used in chat search results.
    pub fn label(&self) -> &'static str {
        match self {
            PlanKey::TwelveMonth => "12 Month",
            PlanKey::ThreeMonth => "3 Month",
            PlanKey::SixMonth => "6 Month",
        }
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanKey {
    type Err = LeaderboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "12month" => Ok(PlanKey::TwelveMonth),
            "3month" => Ok(PlanKey::ThreeMonth),
            "6month" => Ok(PlanKey::SixMonth),
            other => Err(LeaderboardError::InvalidPlan(other.to_string())),
        }
    }
}

/// Which underlying table a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Regular,
    Cash,
}

/// One value per plan. Every plan key is always present when serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerPlan<T> {
    #[serde(rename = "12month")]
    pub twelve_month: T,
    #[serde(rename = "3month")]
    pub three_month: T,
    #[serde(rename = "6month")]
    pub six_month: T,
}

impl<T> PerPlan<T> {
    pub fn get(&self, plan: PlanKey) -> &T {
        match plan {
            PlanKey::TwelveMonth => &self.twelve_month,
            PlanKey::ThreeMonth => &self.three_month,
            PlanKey::SixMonth => &self.six_month,
        }
    }

    pub fn get_mut(&mut self, plan: PlanKey) -> &mut T {
        match plan {
            PlanKey::TwelveMonth => &mut self.twelve_month,
            PlanKey::ThreeMonth => &mut self.three_month,
            PlanKey::SixMonth => &mut self.six_month,
        }
    }
}

impl PerPlan<usize> {
    pub fn sum(&self) -> usize {
        self.twelve_month + self.three_month + self.six_month
    }
}

/// Recognised voucher statuses. Anything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoucherStatus {
    Assigned,
    Available,
    Compromised,
    Other,
}

impl VoucherStatus {
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "assigned" => VoucherStatus::Assigned,
            "available" => VoucherStatus::Available,
            "compromised" => VoucherStatus::Compromised,
            _ => VoucherStatus::Other,
        }
    }
}

/// One spreadsheet row of a voucher table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherRow {
    pub code: String,
    pub status: String,
    pub client_name: String,
    pub client_phone: String,
    pub client_email: String,
    pub sales_person: String,
    pub date_assigned: String,
    pub source: Source,
}

impl VoucherRow {
    /// Build a row from raw cells in `A:G` order.
    ///
    /// Missing trailing cells read as empty. The code is kept verbatim, the
    /// status is trimmed and lowercased, every other field is trimmed.
    pub fn from_cells(cells: &[String], source: Source) -> Self {
        let cell = |i: usize| cells.get(i).map(|c| c.trim().to_string()).unwrap_or_default();
        VoucherRow {
            code: cells.first().cloned().unwrap_or_default(),
            status: cell(1).to_lowercase(),
            client_name: cell(2),
            client_phone: cell(3),
            client_email: cell(4),
            sales_person: cell(5),
            date_assigned: cell(6),
            source,
        }
    }

    /// Parse a whole table, skipping its header row.
    pub fn from_table(values: &[Vec<String>], source: Source) -> Vec<Self> {
        values
            .iter()
            .skip(1)
            .map(|cells| VoucherRow::from_cells(cells, source))
            .collect()
    }

    pub fn status(&self) -> VoucherStatus {
        VoucherStatus::classify(&self.status)
    }

    /// Rows with both a salesperson and a client count as assignments.
    pub fn is_counted_assignment(&self) -> bool {
        !self.sales_person.is_empty() && !self.client_name.is_empty()
    }
}

/// Detail of one assignment credited to a salesperson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssignment {
    pub name: String,
    pub code: String,
    pub date: String,
    pub plan: PlanKey,
    pub phone: String,
    pub email: String,
    pub source: Source,
}

/// Aggregate for one (normalized) salesperson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalespersonStats {
    pub name: String,
    pub total: usize,
    pub by_plan: PerPlan<usize>,
    pub clients: Vec<ClientAssignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
}

impl SalespersonStats {
    pub fn new(name: String) -> Self {
        SalespersonStats {
            name,
            total: 0,
            by_plan: PerPlan::default(),
            clients: Vec::new(),
            rank: None,
        }
    }
}

/// Status counts for one plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStats {
    pub total: usize,
    pub assigned: usize,
    pub available: usize,
    pub compromised: usize,
    pub other: usize,
}

impl PlanStats {
    pub fn from_rows(rows: &[VoucherRow]) -> Self {
        let mut stats = PlanStats {
            total: rows.len(),
            ..PlanStats::default()
        };
        for row in rows {
            match row.status() {
                VoucherStatus::Assigned => stats.assigned += 1,
                VoucherStatus::Available => stats.available += 1,
                VoucherStatus::Compromised => stats.compromised += 1,
                VoucherStatus::Other => {}
            }
        }
        stats.other = stats.total - stats.assigned - stats.available - stats.compromised;
        stats
    }
}

/// Totals across every plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_vouchers: usize,
    pub assigned: usize,
    pub available: usize,
    pub compromised: usize,
    pub other: usize,
    pub total_salespeople: usize,
    pub by_plan: PerPlan<PlanStats>,
}

impl Totals {
    pub fn from_plans(by_plan: PerPlan<PlanStats>, total_salespeople: usize) -> Self {
        let mut totals = Totals {
            total_salespeople,
            ..Totals::default()
        };
        for plan in PlanKey::ALL {
            let stats = by_plan.get(plan);
            totals.total_vouchers += stats.total;
            totals.assigned += stats.assigned;
            totals.available += stats.available;
            totals.compromised += stats.compromised;
            totals.other += stats.other;
        }
        totals.by_plan = by_plan;
        totals
    }
}

/// One entry of the activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentAssignment {
    pub name: String,
    pub client: String,
    pub plan: PlanKey,
    pub date: String,
    pub source: Source,
}

/// The published aggregate served to dashboard readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub leaderboard: Vec<SalespersonStats>,
    pub totals: Totals,
    pub recent_assignments: Vec<RecentAssignment>,
    pub last_updated: String,
}

/// Title-case every whitespace-separated token and join with single spaces.
///
/// `"john DOE"` and `"John  Doe"` both become `"John Doe"`; applying it twice
/// changes nothing.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            let Some(first) = chars.next() else {
                return String::new();
            };
            // A first letter whose capital spans several chars (`ß` -> `SS`)
            // stays lowercase so a second pass leaves the word unchanged.
            let mut upper = first.to_uppercase();
            let head = match (upper.next(), upper.next()) {
                (Some(single), None) => single,
                _ => first.to_lowercase().next().unwrap_or(first),
            };
            std::iter::once(head).chain(chars.flat_map(char::to_lowercase)).collect()
        })
        .collect::<Vec<String>>()
        .join(" ")
}

lazy_static! {
    static ref DATE_SEPARATORS: Regex = Regex::new(r"[/\-.]").unwrap();
}

const FALLBACK_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M:%S"];
const FALLBACK_DATE_FORMATS: [&str; 4] = ["%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y"];

/// Parse a free-form sheet date.
///
/// Strings that split on `/`, `-` or `.` into exactly three numeric segments
/// are read as `YYYY-M-D` when the first segment has four characters,
/// otherwise as `M-D-YYYY`. Anything else goes through a small set of generic
/// formats.
/// Returns `None` for empty or unparseable input.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parts: Vec<&str> = DATE_SEPARATORS.split(raw).collect();
    if parts.len() == 3 {
        let (year, month, day) = if parts[0].len() == 4 {
            (parts[0], parts[1], parts[2])
        } else {
            (parts[2], parts[0], parts[1])
        };
        if let (Ok(year), Ok(month), Ok(day)) = (
            year.trim().parse::<i32>(),
            month.trim().parse::<u32>(),
            day.trim().parse::<u32>(),
        ) {
            // Two-digit years land in the 1900s.
            let year = if (0..100).contains(&year) { 1900 + year } else { year };
            return NaiveDate::from_ymd_opt(year, month, day);
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    for fmt in FALLBACK_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in FALLBACK_DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    None
}

/// Sort key for a sheet date: seconds since the epoch, unparseable dates at 0.
pub fn date_sort_key(raw: &str) -> i64 {
    parse_flexible_date(raw)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

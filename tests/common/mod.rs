#![allow(dead_code)]

use async_trait::async_trait;
use leaderboard::config::{PlanSheets, SheetIds};
use leaderboard::error::{LeaderboardError, Result};
use leaderboard::gateway::{ChatMessage, CompletionProvider};
use leaderboard::sheets::MemorySheets;
use std::sync::{Arc, Mutex};

pub const HEADER: [&str; 7] = [
    "Voucher Code",
    "Status",
    "Client Name",
    "Client Phone",
    "Client Email",
    "Sales Person",
    "Date Assigned",
];

pub fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}

pub fn sheet_ids() -> SheetIds {
    let plan = |suffix: &str| PlanSheets {
        regular: Some(format!("reg-{}", suffix)),
        cash: Some(format!("cash-{}", suffix)),
    };
    SheetIds {
        twelve_month: plan("12"),
        three_month: plan("3"),
        six_month: plan("6"),
    }
}

/// Six tables: Ann Lee has one 12-month assignment, Bob Lee two 3-month ones
/// (one regular, one cash). Only the 12- and 3-month cash tables have an
/// available voucher.
pub fn seeded_sheets() -> Arc<MemorySheets> {
    let sheets = MemorySheets::new();
    sheets.insert(
        "reg-12",
        vec![
            row(&HEADER),
            row(&["V12-1", "assigned", "Acme Corp", "0501", "a@acme.test", "ann lee", "1/3/2024"]),
            row(&["V12-2", "available", "", "", "", "", ""]),
        ],
    );
    sheets.insert(
        "reg-3",
        vec![
            row(&HEADER),
            row(&["V3-1", "assigned", "Beta LLC", "0502", "b@beta.test", "Bob Lee", "1/5/2024"]),
        ],
    );
    sheets.insert(
        "reg-6",
        vec![row(&HEADER), row(&["V6-1", "compromised", "", "", "", "", ""])],
    );
    sheets.insert(
        "cash-12",
        vec![row(&HEADER), row(&["C12-1", "available", "", "", "", "", ""])],
    );
    sheets.insert(
        "cash-3",
        vec![
            row(&HEADER),
            row(&["C3-1", "assigned", "Old Client", "", "", "bob lee", "12/30/2023"]),
            row(&["C3-2", "available", "", "", "", "", ""]),
        ],
    );
    sheets.insert(
        "cash-6",
        vec![row(&HEADER), row(&["C6-1", "compromised", "", "", "", "", ""])],
    );
    Arc::new(sheets)
}

/// Completion provider with a fixed outcome that records every call.
pub struct ScriptedProvider {
    name: &'static str,
    reply: Option<String>,
    calls: Mutex<Vec<(Vec<ChatMessage>, Option<String>)>>,
}

impl ScriptedProvider {
    pub fn replying(name: &'static str, reply: &str) -> Arc<Self> {
        Arc::new(ScriptedProvider {
            name,
            reply: Some(reply.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(ScriptedProvider {
            name,
            reply: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn complete(&self, messages: &[ChatMessage], _max_tokens: u32, bearer: Option<&str>) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), bearer.map(str::to_string)));
        self.reply
            .clone()
            .ok_or_else(|| LeaderboardError::UpstreamFetch(format!("{} is down", self.name)))
    }
}

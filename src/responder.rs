use lazy_static::lazy_static;
use log::{debug, error};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::SheetIds;
use crate::error::Result;
use crate::gateway::{ChatMessage, CompletionGateway};
use crate::sheets::{SEARCH_RANGE, SheetSource};
use crate::voucher::PlanKey;

pub const CHAT_MAX_TOKENS: u32 = 1000;
pub const AGENT_MAX_TOKENS: u32 = 2000;
pub const CHAT_APOLOGY: &str = "Sorry, I'm having trouble right now. Please try again in a moment.";
const NO_MATCH_MARKER: &str = "No assigned voucher found";

// Sheets are searched in this order.
const SEARCH_ORDER: [PlanKey; 3] = [PlanKey::TwelveMonth, PlanKey::ThreeMonth, PlanKey::SixMonth];

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "find", "get", "me", "the", "code", "for", "voucher", "of", "a", "an", "is", "show", "search", "look",
        "up", "lookup", "what", "who", "check", "please", "can", "you", "i", "want", "need", "hi", "hello", "hey",
    ]
    .into_iter()
    .collect();
}

/// Strict lookup instructions shared by both reply modes.
pub const LOOKUP_PROMPT: &str = r#"You are a fast, precise voucher lookup assistant for SASA Worldwide sales agents.

## YOUR ROLE
Sales agents ask for the voucher details of specific clients. Search results from all three voucher sheets are provided; return the COMPLETE details of every matching row.

## RULES
- Only report ASSIGNED vouchers: the row has a Client Name and/or its Status is 'Used' or 'Assigned'.
- Never report rows whose Status is 'Available' with no Client Name.
- For every matching row, include every column that has data.

## RESPONSE FORMAT
For a match, reply exactly like this:

✅ *VOUCHER FOUND*

📋 *Subscription Type:* [12 Month / 6 Month / 3 Month]
🔑 *Voucher Code:* [the code]
📊 *Status:* [Used / Assigned / etc.]
👤 *Client Name:* [full name from the sheet]
👨‍💼 *Salesperson:* [name from the sheet]
📝 *Other Details:* [any other column data]

🔥 Amazing work! Keep crushing those sales! 💪🏆

## MULTIPLE MATCHES
Show each match as its own numbered block (#1, #2, ...).

## NO ASSIGNED MATCH
Reply exactly:
❌ No assigned voucher found for "[name]".
Please double-check the client's full name or spelling and try again.

## NON-LOOKUP MESSAGES
For greetings or anything that is not a lookup, reply:
👋 Hey! I'm your voucher lookup bot. Send me a client's name and I'll find their voucher details instantly!

## RESTRICTIONS
- Never reveal available or unassigned voucher codes.
- Never invent or guess data.
- Never share spreadsheet ids or internal details.
- Be concise but complete, and always answer in English."#;

const CHAT_PERSONA: &str = "You are SASA AI Assistant, a helpful assistant for SASA Worldwide's sales team. \
You help with voucher lookups, sales questions and general information about the leaderboard.

Use the search results provided to answer questions about vouchers or client names. \
Answer general questions in a friendly, concise way. \
Always respond in English and keep replies short and mobile-friendly.";

/// Lowercased search words of a query, stop words and single characters removed.
pub fn query_words(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.chars().count() > 1 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// One data row keyed by the sheet's own headers, in header order.
pub type HeaderedRow = Vec<(String, String)>;

/// Map data rows onto the header row. Rows with no non-blank cell are dropped;
/// a repeated header keeps its first position and its last value.
pub fn headered_rows(table: &[Vec<String>]) -> Vec<HeaderedRow> {
    let Some((headers, data)) = table.split_first() else {
        return Vec::new();
    };
    data.iter()
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|row| {
            let mut mapped: HeaderedRow = Vec::with_capacity(headers.len());
            for (i, header) in headers.iter().enumerate() {
                let value = row.get(i).map(|c| c.trim().to_string()).unwrap_or_default();
                match mapped.iter_mut().find(|(h, _)| h == header) {
                    Some(slot) => slot.1 = value,
                    None => mapped.push((header.clone(), value)),
                }
            }
            mapped
        })
        .collect()
}

fn field<'a>(row: &'a HeaderedRow, header: &str) -> &'a str {
    row.iter()
        .find(|(h, v)| h == header && !v.is_empty())
        .map(|(_, v)| v.as_str())
        .unwrap_or("")
}

/// Whether an assigned row mentions any of `words` in its client, code or salesperson.
pub fn row_matches(row: &HeaderedRow, words: &[String]) -> bool {
    let status = field(row, "Status").to_lowercase();
    let client = field(row, "Client Name").to_lowercase();
    if status == "available" && client.is_empty() {
        return false;
    }
    let salesperson = match field(row, "Sales Person") {
        "" => field(row, "Salesperson"),
        name => name,
    };
    let searchable = format!(
        "{} {} {}",
        client,
        field(row, "Voucher Code").to_lowercase(),
        salesperson.to_lowercase()
    );
    words.iter().any(|w| searchable.contains(w.as_str()))
}

/// Render one sheet's matches. Empty when nothing matched.
pub fn render_matches(label: &str, matches: &[&HeaderedRow]) -> Vec<String> {
    if matches.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![format!("\n--- {} Vouchers ---", label)];
    for (i, row) in matches.iter().enumerate() {
        let entries: Vec<String> = row
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(h, v)| format!("  {}: {}", h, v))
            .collect();
        lines.push(format!("Match #{}:\n{}", i + 1, entries.join("\n")));
    }
    lines
}

pub fn no_match_message(query: &str) -> String {
    format!(
        "{} matching \"{}\" in any of the 3 sheets (12 Month, 6 Month, 3 Month).",
        NO_MATCH_MARKER, query
    )
}

/// Answers natural-language voucher questions from the regular sheets.
pub struct QueryResponder {
    source: Arc<dyn SheetSource>,
    sheets: SheetIds,
    gateway: Arc<CompletionGateway>,
}

impl QueryResponder {
    pub fn new(source: Arc<dyn SheetSource>, sheets: SheetIds, gateway: Arc<CompletionGateway>) -> Self {
        QueryResponder {
            source,
            sheets,
            gateway,
        }
    }

    async fn read_sheet(&self, plan: PlanKey) -> Result<Vec<Vec<String>>> {
        let id = self.sheets.regular(plan)?;
        self.source.read_range(id, SEARCH_RANGE).await
    }

    /// Search every regular sheet and render the matching rows as plain text.
    ///
    /// A sheet that cannot be read is logged and skipped; the search itself
    /// never fails.
    pub async fn search(&self, query: &str) -> String {
        let words = query_words(query);
        let (twelve, three, six) = tokio::join!(
            self.read_sheet(SEARCH_ORDER[0]),
            self.read_sheet(SEARCH_ORDER[1]),
            self.read_sheet(SEARCH_ORDER[2]),
        );

        let mut lines = Vec::new();
        for (plan, table) in SEARCH_ORDER.into_iter().zip([twelve, three, six]) {
            let table = match table {
                Ok(table) => table,
                Err(e) => {
                    error!("error searching {} sheet: {}", plan.label(), e);
                    continue;
                }
            };
            let rows = headered_rows(&table);
            let matches: Vec<&HeaderedRow> = rows.iter().filter(|row| row_matches(row, &words)).collect();
            debug!("{} sheet: {} of {} rows match {:?}", plan.label(), matches.len(), rows.len(), words);
            lines.extend(render_matches(plan.label(), &matches));
        }

        if lines.is_empty() {
            no_match_message(query)
        } else {
            lines.join("\n")
        }
    }

    /// Conversational reply for the dashboard chat. Never fails.
    pub async fn chat_reply(&self, message: &str, credential: Option<&str>) -> String {
        let results = self.search(message).await;
        let system = format!("{}\n\n{}", CHAT_PERSONA, LOOKUP_PROMPT);
        let user = if results.contains(NO_MATCH_MARKER) {
            message.to_string()
        } else {
            format!(
                "User message: \"{}\"\n\nRelevant data from voucher sheets:\n{}",
                message, results
            )
        };

        match self
            .gateway
            .complete(&[ChatMessage::system(system), ChatMessage::user(user)], CHAT_MAX_TOKENS, credential)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!("chat processing error: {}", e);
                CHAT_APOLOGY.to_string()
            }
        }
    }

    /// Strict lookup reply for agent integrations.
    ///
    /// # Errors
    /// * `AllProvidersFailed` when no completion provider answered
    pub async fn agent_reply(&self, message: &str, credential: Option<&str>) -> Result<String> {
        let results = self.search(message).await;
        let user = format!(
            "The user asked: \"{}\"\n\nHere are the search results from ALL 3 voucher sheets:\n{}\n\n\
             Based on these results, provide the appropriate response following the format rules.",
            message, results
        );
        self.gateway
            .complete(
                &[ChatMessage::system(LOOKUP_PROMPT), ChatMessage::user(user)],
                AGENT_MAX_TOKENS,
                credential,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn words(q: &str) -> Vec<String> {
        query_words(q)
    }

    #[test]
    fn stop_words_and_short_tokens_are_dropped() {
        assert_eq!(query_words("Find the voucher for Acme please"), vec!["acme"]);
        assert_eq!(query_words("hi"), Vec::<String>::new());
        assert_eq!(query_words("  V-77   x  Lee "), vec!["v-77", "lee"]);
    }

    #[test]
    fn rows_map_onto_headers() {
        let t = table(&[
            &["Voucher Code", "Status", "Client Name"],
            &["V1", " assigned ", "Acme"],
            &["", " ", ""],
            &["V2"],
        ]);
        let rows = headered_rows(&t);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], ("Status".to_string(), "assigned".to_string()));
        assert_eq!(rows[1][2], ("Client Name".to_string(), String::new()));
        assert!(headered_rows(&[]).is_empty());
    }

    #[test]
    fn available_rows_without_client_never_match() {
        let t = table(&[
            &["Voucher Code", "Status", "Client Name", "Sales Person"],
            &["ACME-1", "available", "", ""],
            &["ACME-2", "assigned", "Acme Ltd", "Bob"],
        ]);
        let rows = headered_rows(&t);
        assert!(!row_matches(&rows[0], &words("acme")));
        assert!(row_matches(&rows[1], &words("acme")));
        assert!(row_matches(&rows[1], &words("BOB")));
        assert!(!row_matches(&rows[1], &[]));
    }

    #[test]
    fn salesperson_header_variants() {
        let t = table(&[&["Voucher Code", "Status", "Client Name", "Salesperson"], &["Z9", "used", "Kim", "Dana"]]);
        let rows = headered_rows(&t);
        assert!(row_matches(&rows[0], &words("dana")));
    }

    #[test]
    fn rendering_skips_empty_values() {
        let t = table(&[&["Voucher Code", "Status", "Client Name", "Phone"], &["V1", "assigned", "Acme", ""]]);
        let rows = headered_rows(&t);
        let lines = render_matches("3 Month", &[&rows[0]]);
        assert_eq!(
            lines,
            vec![
                "\n--- 3 Month Vouchers ---".to_string(),
                "Match #1:\n  Voucher Code: V1\n  Status: assigned\n  Client Name: Acme".to_string(),
            ]
        );
        assert!(render_matches("3 Month", &[]).is_empty());
    }

    #[test]
    fn no_match_text() {
        assert_eq!(
            no_match_message("zed"),
            "No assigned voucher found matching \"zed\" in any of the 3 sheets (12 Month, 6 Month, 3 Month)."
        );
    }
}

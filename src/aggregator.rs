use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use log::{debug, error, warn};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::SheetIds;
use crate::error::{LeaderboardError, Result};
use crate::sheets::{SheetSource, VOUCHER_RANGE};
use crate::voucher::{
    ClientAssignment, PerPlan, PlanKey, PlanStats, RecentAssignment, SalespersonStats, SheetSummary, Source, Totals,
    VoucherRow, date_sort_key, normalize_name, parse_flexible_date,
};

/// Length of the activity feed.
pub const RECENT_ASSIGNMENTS_LIMIT: usize = 20;

/// Rows of every plan, regular rows first then cash rows.
pub type PlanTables = PerPlan<Vec<VoucherRow>>;

/// Build the published summary from one snapshot of every table.
///
/// Plans are scanned 12-month, 3-month, 6-month; within a plan rows keep
/// fetch order. That scan order is the tie-break for equal totals and for
/// equal assignment dates (later rows first).
///
/// # Arguments
/// * `tables` - Rows per plan, regular and cash concatenated
/// * `now` - Capture time recorded as `lastUpdated`
///
/// # Returns
/// * `SheetSummary` - Ranked leaderboard, totals and the 20 most recent assignments
pub fn summarize(tables: &PlanTables, now: DateTime<Utc>) -> SheetSummary {
    let mut leaderboard: Vec<SalespersonStats> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut assignments: Vec<(RecentAssignment, usize)> = Vec::new();

    for plan in PlanKey::ALL {
        for row in tables.get(plan).iter().filter(|r| r.is_counted_assignment()) {
            let name = normalize_name(&row.sales_person);
            let slot = *index.entry(name.clone()).or_insert_with(|| {
                leaderboard.push(SalespersonStats::new(name.clone()));
                leaderboard.len() - 1
            });

            let stats = &mut leaderboard[slot];
            stats.total += 1;
            *stats.by_plan.get_mut(plan) += 1;
            stats.clients.push(ClientAssignment {
                name: row.client_name.clone(),
                code: row.code.clone(),
                date: row.date_assigned.clone(),
                plan,
                phone: row.client_phone.clone(),
                email: row.client_email.clone(),
                source: row.source,
            });

            let seq = assignments.len();
            assignments.push((
                RecentAssignment {
                    name,
                    client: row.client_name.clone(),
                    plan,
                    date: row.date_assigned.clone(),
                    source: row.source,
                },
                seq,
            ));
        }
    }

    // Vec::sort_by is stable, so equal totals keep first-encounter order.
    leaderboard.sort_by(|a, b| b.total.cmp(&a.total));
    for (i, person) in leaderboard.iter_mut().enumerate() {
        person.rank = Some(i + 1);
    }

    let by_plan = PerPlan {
        twelve_month: PlanStats::from_rows(tables.get(PlanKey::TwelveMonth)),
        three_month: PlanStats::from_rows(tables.get(PlanKey::ThreeMonth)),
        six_month: PlanStats::from_rows(tables.get(PlanKey::SixMonth)),
    };
    let totals = Totals::from_plans(by_plan, leaderboard.len());

    assignments.sort_by_cached_key(|(a, seq)| (Reverse(date_sort_key(&a.date)), Reverse(*seq)));
    let recent_assignments = assignments
        .into_iter()
        .take(RECENT_ASSIGNMENTS_LIMIT)
        .map(|(a, _)| a)
        .collect();

    SheetSummary {
        leaderboard,
        totals,
        recent_assignments,
        last_updated: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Leaderboard restricted to one plan.
///
/// Each person's `total` and `clients` only cover `plan`; people with no
/// assignments in it are dropped and ranks are recomputed.
pub fn leaderboard_for_plan(summary: &SheetSummary, plan: PlanKey) -> Vec<SalespersonStats> {
    let mut filtered: Vec<SalespersonStats> = summary
        .leaderboard
        .iter()
        .filter(|p| *p.by_plan.get(plan) > 0)
        .map(|p| {
            let mut person = p.clone();
            person.total = *p.by_plan.get(plan);
            person.clients.retain(|c| c.plan == plan);
            person
        })
        .collect();
    filtered.sort_by(|a, b| b.total.cmp(&a.total));
    for (i, person) in filtered.iter_mut().enumerate() {
        person.rank = Some(i + 1);
    }
    filtered
}

/// Assignments dated on or after `cutoff`. Undated entries never match.
pub fn assignments_since(assignments: &[RecentAssignment], cutoff: NaiveDate) -> Vec<RecentAssignment> {
    assignments
        .iter()
        .filter(|a| parse_flexible_date(&a.date).is_some_and(|d| d >= cutoff))
        .cloned()
        .collect()
}

struct CachedSummary {
    summary: Arc<SheetSummary>,
    computed_at: Instant,
    invalidated: bool,
}

/// Read-through cache in front of `summarize`.
///
/// A summary is reused until it is `ttl` old or has been invalidated by a
/// write. Concurrent readers queue on the cache lock, so one refresh serves
/// all of them.
pub struct Aggregator {
    source: Arc<dyn SheetSource>,
    sheets: SheetIds,
    ttl: Duration,
    cache: Mutex<Option<CachedSummary>>,
}

impl Aggregator {
    pub fn new(source: Arc<dyn SheetSource>, sheets: SheetIds, ttl: Duration) -> Self {
        Aggregator {
            source,
            sheets,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current summary, recomputed when stale.
    ///
    /// When the refresh fails, a summary still inside its freshness window
    /// (only possible after an invalidation) is served instead; otherwise the
    /// upstream error is returned.
    pub async fn get_summary(&self) -> Result<Arc<SheetSummary>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = &*cache {
            if !cached.invalidated && cached.computed_at.elapsed() < self.ttl {
                debug!("serving cached summary");
                return Ok(cached.summary.clone());
            }
        }

        match self.fetch_tables().await {
            Ok(tables) => {
                debug!("recomputing summary");
                let summary = Arc::new(summarize(&tables, Utc::now()));
                *cache = Some(CachedSummary {
                    summary: summary.clone(),
                    computed_at: Instant::now(),
                    invalidated: false,
                });
                Ok(summary)
            }
            Err(err) => match &*cache {
                Some(cached) if cached.computed_at.elapsed() < self.ttl => {
                    warn!("summary refresh failed, serving previous summary: {}", err);
                    Ok(cached.summary.clone())
                }
                _ => {
                    error!("summary refresh failed: {}", err);
                    Err(err)
                }
            },
        }
    }

    /// Force the next `get_summary` to recompute.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = &mut *cache {
            cached.invalidated = true;
        }
    }

    /// Read all six tables concurrently; the first failure aborts the pass.
    pub async fn fetch_tables(&self) -> Result<PlanTables> {
        let (r12, r3, r6, c12, c3, c6) = tokio::try_join!(
            self.read(PlanKey::TwelveMonth, Source::Regular),
            self.read(PlanKey::ThreeMonth, Source::Regular),
            self.read(PlanKey::SixMonth, Source::Regular),
            self.read(PlanKey::TwelveMonth, Source::Cash),
            self.read(PlanKey::ThreeMonth, Source::Cash),
            self.read(PlanKey::SixMonth, Source::Cash),
        )?;
        Ok(PerPlan {
            twelve_month: [r12, c12].concat(),
            three_month: [r3, c3].concat(),
            six_month: [r6, c6].concat(),
        })
    }

    // A table with no configured id fails the refresh like an unreadable one.
    async fn read(&self, plan: PlanKey, source: Source) -> Result<Vec<VoucherRow>> {
        let sheet_id = match source {
            Source::Regular => self.sheets.regular(plan).ok(),
            Source::Cash => self.sheets.cash(plan),
        }
        .ok_or_else(|| LeaderboardError::UpstreamFetch(format!("no {:?} sheet configured for {}", source, plan)))?;
        let values = self.source.read_range(sheet_id, VOUCHER_RANGE).await?;
        Ok(VoucherRow::from_table(&values, source))
    }
}

use chrono::{Datelike, Local, NaiveDate};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::aggregator::Aggregator;
use crate::config::SheetIds;
use crate::error::{LeaderboardError, Result};
use crate::sheets::SheetSource;
use crate::voucher::PlanKey;

/// Body of a cash assignment request. Every field is required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashAssignmentRequest {
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_phone: String,
    #[serde(default)]
    pub client_email: String,
    #[serde(default)]
    pub sales_person: String,
    #[serde(default)]
    pub plan: String,
}

/// A request whose fields are trimmed, non-empty and whose plan is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidAssignment {
    pub client_name: String,
    pub client_phone: String,
    pub client_email: String,
    pub sales_person: String,
    pub plan: PlanKey,
}

impl CashAssignmentRequest {
    pub fn validate(&self) -> Result<ValidAssignment> {
        let fields = [
            &self.client_name,
            &self.client_phone,
            &self.client_email,
            &self.sales_person,
            &self.plan,
        ];
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err(LeaderboardError::Validation("All fields are required".to_string()));
        }
        Ok(ValidAssignment {
            client_name: self.client_name.trim().to_string(),
            client_phone: self.client_phone.trim().to_string(),
            client_email: self.client_email.trim().to_string(),
            sales_person: self.sales_person.trim().to_string(),
            plan: self.plan.parse()?,
        })
    }
}

/// Response body of `/api/cash-process`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashAssignmentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CashAssignmentResult {
    pub fn assigned(code: String) -> Self {
        CashAssignmentResult {
            success: true,
            voucher_code: Some(code),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        CashAssignmentResult {
            success: false,
            voucher_code: None,
            error: Some(message.into()),
        }
    }
}

/// `M/D/YYYY` without zero padding, as the sheets store it.
pub fn format_sheet_date(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.month(), date.day(), date.year())
}

/// Cells B..G written over a claimed row.
pub fn assignment_cells(assignment: &ValidAssignment, date: NaiveDate) -> Vec<String> {
    vec![
        "assigned".to_string(),
        assignment.client_name.clone(),
        assignment.client_phone.clone(),
        assignment.client_email.clone(),
        assignment.sales_person.clone(),
        format_sheet_date(date),
    ]
}

/// Hands out cash vouchers from each plan's cash table.
pub struct CashAssigner {
    source: Arc<dyn SheetSource>,
    sheets: SheetIds,
    aggregator: Arc<Aggregator>,
}

impl CashAssigner {
    pub fn new(source: Arc<dyn SheetSource>, sheets: SheetIds, aggregator: Arc<Aggregator>) -> Self {
        CashAssigner {
            source,
            sheets,
            aggregator,
        }
    }

    /// Assign the first available cash voucher of the request's plan, dated today.
    ///
    /// # Returns
    /// * `Result<String>` - The voucher code
    ///
    /// # Errors
    /// * `Validation` when a field is empty
    /// * `InvalidPlan` when the plan is unknown or has no cash table
    /// * `NoAvailableVoucher` when every row is taken (nothing is written)
    /// * `UpstreamFetch` when the sheet cannot be read or written
    pub async fn assign(&self, request: &CashAssignmentRequest) -> Result<String> {
        self.assign_on(request, Local::now().date_naive()).await
    }

    pub async fn assign_on(&self, request: &CashAssignmentRequest, date: NaiveDate) -> Result<String> {
        let assignment = request.validate()?;
        let sheet_id = self
            .sheets
            .cash(assignment.plan)
            .ok_or_else(|| LeaderboardError::InvalidPlan(assignment.plan.to_string()))?;

        let cells = assignment_cells(&assignment, date);
        let Some(claimed) = self.source.claim_first_available(sheet_id, &cells).await? else {
            warn!("no available cash vouchers for {}", assignment.plan);
            return Err(LeaderboardError::NoAvailableVoucher);
        };

        self.aggregator.invalidate().await;
        info!(
            "assigned cash voucher row {} of {} to {} (sales: {})",
            claimed.row_number, assignment.plan, assignment.client_name, assignment.sales_person
        );
        Ok(claimed.code)
    }
}

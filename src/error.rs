use thiserror::Error;

/// Errors surfaced by the leaderboard library.
///
/// Every failure is scoped to a single request; nothing here is fatal to the
/// process.
#[derive(Debug, Error)]
pub enum LeaderboardError {
    /// A table read (or write) against the spreadsheet backend failed, or a
    /// table the summary needs has no configured sheet id.
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// The plan key is unknown or its table is not configured.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// A request field is missing or malformed.
    #[error("{0}")]
    Validation(String),

    /// The plan's cash table has no row with status `available`.
    #[error("No available vouchers for this plan")]
    NoAvailableVoucher,

    /// The OAuth provider refused the authorization-code exchange.
    #[error("OAuth exchange failed ({status}): {body}")]
    OAuthExchange { status: u16, body: String },

    /// Both completion providers failed (or no credential for the fallback).
    #[error("All AI providers failed")]
    AllProvidersFailed,

    /// Required configuration is absent or unreadable at startup, including
    /// service-account credentials.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LeaderboardError>;

impl From<reqwest::Error> for LeaderboardError {
    fn from(err: reqwest::Error) -> Self {
        LeaderboardError::UpstreamFetch(err.to_string())
    }
}

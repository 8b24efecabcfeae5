#![cfg(not(tarpaulin_include))]

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::NaiveDate;
use handlebars::Handlebars;
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

use crate::aggregator::{Aggregator, assignments_since, leaderboard_for_plan};
use crate::assigner::{CashAssigner, CashAssignmentRequest, CashAssignmentResult};
use crate::config::Config;
use crate::credentials::{CredentialStore, OAUTH_KEY_COOKIE, SESSION_COOKIE, VERIFIER_COOKIE, new_session_id};
use crate::error::{LeaderboardError, Result};
use crate::gateway::CompletionGateway;
use crate::oauth::{OAuthClient, Pkce};
use crate::responder::QueryResponder;
use crate::sheets::{GoogleSheets, SheetSource};
use crate::voucher::{PlanKey, SheetSummary};

pub const CALLBACK_PATH: &str = "/api/auth/openrouter/callback";
const SHEETS_TIMEOUT: Duration = Duration::from_secs(30);
const VERIFIER_MAX_AGE_SECS: i64 = 600;
const OAUTH_KEY_MAX_AGE_SECS: i64 = 60 * 60 * 24 * 365;
const OAUTH_PAGE: &str = "oauth_page";

const OAUTH_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html><head><title>{{title}}</title>
<meta name="viewport" content="width=device-width,initial-scale=1">
<style>
  body { font-family: system-ui, sans-serif; max-width: 480px; margin: 80px auto; padding: 24px; }
  .ok { color: #10b981; }
  .failed { color: #ef4444; }
  .detail { color: #6b7280; font-size: 14px; }
</style>
</head><body>
{{#if ok}}<h2 class="ok">{{heading}}</h2>{{else}}<h2 class="failed">{{heading}}</h2>{{/if}}
<p>{{message}}</p>
{{#if detail}}<p class="detail">{{detail}}</p>{{/if}}
<a href="/">Back to Dashboard</a>
</body></html>"#;

/// Shared state behind every handler.
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub assigner: CashAssigner,
    pub responder: QueryResponder,
    pub credentials: CredentialStore,
    pub oauth: OAuthClient,
    pub cookie_secure: bool,
    templates: Handlebars<'static>,
}

impl AppState {
    /// Wire every service onto one sheet source and completion gateway.
    pub fn new(config: &Config, source: Arc<dyn SheetSource>, gateway: CompletionGateway) -> Result<Self> {
        let aggregator = Arc::new(Aggregator::new(
            source.clone(),
            config.sheets.clone(),
            config.summary_ttl,
        ));
        let assigner = CashAssigner::new(source.clone(), config.sheets.clone(), aggregator.clone());
        let responder = QueryResponder::new(source, config.sheets.clone(), Arc::new(gateway));

        let mut templates = Handlebars::new();
        templates.set_strict_mode(false);
        templates
            .register_template_string(OAUTH_PAGE, OAUTH_PAGE_TEMPLATE)
            .map_err(|e| LeaderboardError::Config(format!("callback template: {}", e)))?;

        Ok(AppState {
            aggregator,
            assigner,
            responder,
            credentials: CredentialStore::new(config.secondary_ai.api_key.clone()),
            oauth: OAuthClient::new(&config.oauth_auth_url, &config.oauth_keys_url, config.ai_timeout)?,
            cookie_secure: config.cookie_secure,
            templates,
        })
    }

    fn long_lived_cookie(&self, name: &'static str, value: String) -> Cookie<'static> {
        Cookie::build((name, value))
            .http_only(true)
            .secure(self.cookie_secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(OAUTH_KEY_MAX_AGE_SECS))
            .build()
    }

    fn render_page(&self, page: &OAuthPage) -> Html<String> {
        match self.templates.render(OAUTH_PAGE, page) {
            Ok(body) => Html(body),
            Err(e) => {
                error!("cannot render callback page: {}", e);
                Html(format!("<p>{}</p>", page.heading))
            }
        }
    }
}

#[derive(Serialize)]
struct OAuthPage {
    title: &'static str,
    ok: bool,
    heading: &'static str,
    message: &'static str,
    detail: Option<String>,
}

#[derive(Deserialize)]
struct SheetsQuery {
    plan: Option<String>,
    since: Option<String>,
}

#[derive(Deserialize)]
struct ChatRequest {
    message: Option<String>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
}

/// Build the router over `state`; unknown paths fall through to `static_dir`.
pub fn router(state: Arc<AppState>, static_dir: &Path) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sheets", get(get_sheets))
        .route("/api/cash-process", post(cash_process))
        .route("/api/chat", post(chat))
        .route("/api/auth/openrouter", get(oauth_start))
        .route(CALLBACK_PATH, get(oauth_callback))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
}

/// Serve the dashboard against Google Sheets until the process is stopped.
pub async fn run(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let account = config.service_account.clone().ok_or_else(|| {
        LeaderboardError::Config(
            "set GOOGLE_SERVICE_ACCOUNT_JSON or GOOGLE_SERVICE_ACCOUNT_EMAIL and GOOGLE_PRIVATE_KEY".to_string(),
        )
    })?;
    let source: Arc<dyn SheetSource> = Arc::new(GoogleSheets::new(account, SHEETS_TIMEOUT)?);
    let gateway = CompletionGateway::from_config(&config)?;
    let state = Arc::new(AppState::new(&config, source, gateway)?);
    let app = router(state, &config.static_dir);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

fn no_store(response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store, max-age=0"));
    response
}

/// Leaderboard summary, optionally re-ranked for one plan.
///
/// # Arguments
/// * `plan` - Optional `?plan=` key (`12month`, `6month`, `3month`)
/// * `since` - Optional `?since=YYYY-MM-DD`; keeps only recent assignments dated on or after it
///
/// # Returns
/// * `Response` - The summary, `400` for an unknown plan or date, `500` when the sheets cannot be read
async fn get_sheets(State(state): State<Arc<AppState>>, Query(params): Query<SheetsQuery>) -> Response {
    let plan = match params.plan.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(raw) => match raw.parse::<PlanKey>() {
            Ok(plan) => Some(plan),
            Err(e) => {
                return no_store((StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))));
            }
        },
        None => None,
    };
    let since = match params.since.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                return no_store((StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid since date" }))));
            }
        },
        None => None,
    };

    match state.aggregator.get_summary().await {
        Ok(summary) => {
            let mut body: SheetSummary = (*summary).clone();
            if let Some(plan) = plan {
                body.leaderboard = leaderboard_for_plan(&summary, plan);
            }
            if let Some(cutoff) = since {
                body.recent_assignments = assignments_since(&summary.recent_assignments, cutoff);
            }
            no_store(Json(body))
        }
        Err(e) => {
            error!("sheets API error: {}", e);
            no_store((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch sheet data" })),
            ))
        }
    }
}

/// Assign a cash voucher.
///
/// # Returns
/// * `Response` - `{success, voucherCode}` or `{success: false, error}` with 400, 409 or 500
async fn cash_process(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<CashAssignmentRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(CashAssignmentResult::failed("All fields are required")),
        )
            .into_response();
    };

    match state.assigner.assign(&request).await {
        Ok(code) => Json(CashAssignmentResult::assigned(code)).into_response(),
        Err(e) => {
            let (status, message) = match &e {
                LeaderboardError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                LeaderboardError::InvalidPlan(_) => (StatusCode::BAD_REQUEST, "Invalid plan".to_string()),
                LeaderboardError::NoAvailableVoucher => (StatusCode::CONFLICT, e.to_string()),
                _ => {
                    error!("cash process error: {}", e);
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
                }
            };
            (status, Json(CashAssignmentResult::failed(message))).into_response()
        }
    }
}

/// Chat reply. Provider failures come back as an apology with status 200.
async fn chat(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    body: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let message = body
        .ok()
        .and_then(|Json(req)| req.message)
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());
    let Some(message) = message else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Message is required" }))).into_response();
    };

    let credential = state.credentials.resolve(
        jar.get(SESSION_COOKIE).map(|c| c.value()),
        jar.get(OAUTH_KEY_COOKIE).map(|c| c.value()),
    );
    let reply = state.responder.chat_reply(&message, credential.as_deref()).await;
    Json(json!({ "reply": reply })).into_response()
}

// Origin the browser used to reach us, for the OAuth callback URL.
fn request_origin(headers: &HeaderMap, secure: bool) -> String {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let scheme = header_str("x-forwarded-proto").unwrap_or(if secure { "https" } else { "http" });
    let host = header_str("x-forwarded-host")
        .or_else(|| header_str(header::HOST.as_str()))
        .unwrap_or("localhost");
    format!("{}://{}", scheme, host)
}

/// Start the OAuth flow: remember a fresh verifier and redirect to the provider.
///
/// # Arguments
/// * `jar` - Cookie jar receiving the verifier cookie
/// * `headers` - Request headers, used to build the callback URL
///
/// # Returns
/// * `(CookieJar, Redirect)` - Verifier cookie and a temporary redirect
async fn oauth_start(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> (CookieJar, Redirect) {
    let pkce = Pkce::generate();
    let callback_url = format!("{}{}", request_origin(&headers, state.cookie_secure), CALLBACK_PATH);
    let cookie = Cookie::build((VERIFIER_COOKIE, pkce.verifier))
        .http_only(true)
        .secure(state.cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(VERIFIER_MAX_AGE_SECS));

    let url = state.oauth.authorization_url(&callback_url, &pkce.challenge);
    (jar.add(cookie), Redirect::temporary(&url))
}

/// Finish the OAuth flow and keep the obtained key.
///
/// # Returns
/// * `Response` - HTML page; `400` without code or verifier, `500` when the exchange fails
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<CallbackQuery>,
) -> Response {
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        let page = OAuthPage {
            title: "OpenRouter OAuth Failed",
            ok: false,
            heading: "OpenRouter OAuth Failed",
            message: "No authorization code received from OpenRouter.",
            detail: None,
        };
        return (StatusCode::BAD_REQUEST, state.render_page(&page)).into_response();
    };

    let Some(verifier) = jar.get(VERIFIER_COOKIE).map(|c| c.value().to_string()) else {
        let page = OAuthPage {
            title: "OAuth Session Expired",
            ok: false,
            heading: "OAuth Session Expired",
            message: "Session expired. Please try connecting again.",
            detail: None,
        };
        return (StatusCode::BAD_REQUEST, state.render_page(&page)).into_response();
    };

    match state.oauth.exchange(&code, &verifier).await {
        Ok(exchanged) => {
            let session = jar
                .get(SESSION_COOKIE)
                .map(|c| c.value().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(new_session_id);
            state.credentials.set(&session, exchanged.key.clone());
            info!("OpenRouter connected (user {:?})", exchanged.user_id);

            let jar = jar
                .remove(Cookie::build((VERIFIER_COOKIE, "")).path("/"))
                .add(state.long_lived_cookie(SESSION_COOKIE, session))
                .add(state.long_lived_cookie(OAUTH_KEY_COOKIE, exchanged.key));

            let page = OAuthPage {
                title: "OpenRouter Connected!",
                ok: true,
                heading: "OpenRouter Connected Successfully",
                message: "OAuth2 authentication complete. OpenRouter is now available as a fallback AI provider.",
                detail: None,
            };
            (StatusCode::OK, jar, state.render_page(&page)).into_response()
        }
        Err(e) => {
            error!("OpenRouter OAuth exchange error: {}", e);
            let page = OAuthPage {
                title: "OAuth Exchange Failed",
                ok: false,
                heading: "OAuth Exchange Failed",
                message: "Failed to exchange code for API key.",
                detail: Some(e.to_string()),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, state.render_page(&page)).into_response()
        }
    }
}

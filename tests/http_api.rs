mod common;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use common::{ScriptedProvider, seeded_sheets, sheet_ids};
use leaderboard::app::{AppState, router};
use leaderboard::config::Config;
use leaderboard::gateway::CompletionGateway;
use leaderboard::sheets::MemorySheets;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;

struct Harness {
    app: Router,
    state: Arc<AppState>,
    sheets: Arc<MemorySheets>,
    primary: Arc<ScriptedProvider>,
    secondary: Arc<ScriptedProvider>,
}

fn harness_with(primary: Arc<ScriptedProvider>, keys_url: &str) -> Harness {
    let sheets = seeded_sheets();
    let secondary = ScriptedProvider::replying("secondary", "fallback reply");
    let config = Config {
        sheets: sheet_ids(),
        oauth_keys_url: keys_url.to_string(),
        ..Config::default()
    };
    let gateway = CompletionGateway::new(primary.clone(), None, secondary.clone());
    let state = Arc::new(AppState::new(&config, sheets.clone(), gateway).unwrap());
    Harness {
        app: router(state.clone(), Path::new("static")),
        state,
        sheets,
        primary,
        secondary,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedProvider::replying("primary", "primary reply"), "http://127.0.0.1:9/keys")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn chat_with_cookie(message: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder
        .body(Body::from(json!({ "message": message }).to_string()))
        .unwrap()
}

// `name=value` part of a Set-Cookie header.
fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap_or_default().to_string()
}

fn set_cookies(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

// Stand-in for the provider's key endpoint; only `verifier-123` is accepted.
async fn spawn_keys_endpoint() -> String {
    let app = Router::new().route(
        "/api/v1/auth/keys",
        post(|Json(body): Json<Value>| async move {
            if body["code_verifier"] != "verifier-123" || body["code_challenge_method"] != "S256" {
                return (StatusCode::FORBIDDEN, "invalid verifier").into_response();
            }
            let code = body["code"].as_str().unwrap_or_default();
            Json(json!({ "key": format!("sk-or-{}", code), "user_id": "user-1" })).into_response()
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api/v1/auth/keys", addr)
}

#[tokio::test]
async fn health_is_ok() {
    let h = harness();
    let response = send(&h.app, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

#[tokio::test]
async fn dashboard_shell_is_served() {
    let h = harness();
    let response = send(&h.app, get("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("SASA Leaderboard"));
}

#[tokio::test]
async fn sheets_returns_uncached_summary() {
    let h = harness();
    let response = send(&h.app, get("/api/sheets")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store, max-age=0");

    let body = body_json(response).await;
    assert_eq!(body["leaderboard"][0]["name"], "Bob Lee");
    assert_eq!(body["leaderboard"][0]["byPlan"]["3month"], 2);
    assert_eq!(body["leaderboard"][0]["rank"], 1);
    assert_eq!(body["totals"]["totalVouchers"], 8);
    assert_eq!(body["recentAssignments"].as_array().unwrap().len(), 3);
    assert!(body["lastUpdated"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn sheets_plan_filter() {
    let h = harness();
    let body = body_json(send(&h.app, get("/api/sheets?plan=12month")).await).await;
    let board = body["leaderboard"].as_array().unwrap();
    assert_eq!(board.len(), 1);
    assert_eq!(board[0]["name"], "Ann Lee");
    assert_eq!(board[0]["rank"], 1);

    let response = send(&h.app, get("/api/sheets?plan=24month")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sheets_since_filters_recent_assignments() {
    let h = harness();
    let body = body_json(send(&h.app, get("/api/sheets?since=2024-01-04")).await).await;
    let recent = body["recentAssignments"].as_array().unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0]["client"], "Beta LLC");
    // The leaderboard itself is not narrowed.
    assert_eq!(body["leaderboard"].as_array().unwrap().len(), 2);

    let body = body_json(send(&h.app, get("/api/sheets?plan=3month&since=2024-01-01")).await).await;
    assert_eq!(body["recentAssignments"].as_array().unwrap().len(), 2);
    assert_eq!(body["leaderboard"].as_array().unwrap().len(), 1);

    let response = send(&h.app, get("/api/sheets?since=01/04/2024")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid since date");
}

#[tokio::test]
async fn sheets_failure_is_a_server_error() {
    let h = harness();
    h.sheets.fail("reg-12");
    let response = send(&h.app, get("/api/sheets")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store, max-age=0");
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn cash_process_status_codes() {
    let h = harness();
    let valid = json!({
        "clientName": "Zeta",
        "clientPhone": "0503",
        "clientEmail": "z@zeta.test",
        "salesPerson": "Ann Lee",
        "plan": "12month"
    });

    let response = send(&h.app, post_json("/api/cash-process", valid.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "success": true, "voucherCode": "C12-1" }));

    let response = send(&h.app, post_json("/api/cash-process", valid.clone())).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["success"], false);

    let mut missing = valid.clone();
    missing["clientPhone"] = json!("");
    let response = send(&h.app, post_json("/api/cash-process", missing)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "All fields are required");

    let mut bad_plan = valid;
    bad_plan["plan"] = json!("1month");
    let response = send(&h.app, post_json("/api/cash-process", bad_plan)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid plan");

    // The assignment shows up in the next leaderboard read.
    let body = body_json(send(&h.app, get("/api/sheets?plan=12month")).await).await;
    assert_eq!(body["leaderboard"][0]["total"], 2);
}

#[tokio::test]
async fn chat_requires_a_message() {
    let h = harness();
    let response = send(&h.app, post_json("/api/chat", json!({}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Message is required");

    let response = send(&h.app, post_json("/api/chat", json!({ "message": "   " }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_sends_search_results_to_primary() {
    let h = harness();
    let response = send(&h.app, post_json("/api/chat", json!({ "message": "find Acme" }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["reply"], "primary reply");

    let calls = h.primary.calls();
    let user = &calls[0].0[1].content;
    assert!(user.starts_with("User message: \"find Acme\""));
    assert!(user.contains("Client Name: Acme Corp"));
    assert!(h.secondary.calls().is_empty());

    // Nothing matches a greeting, so it goes out bare.
    send(&h.app, post_json("/api/chat", json!({ "message": "hey there" }))).await;
    assert_eq!(h.primary.calls()[1].0[1].content, "hey there");
}

#[tokio::test]
async fn chat_soft_fails_without_fallback_credential() {
    let h = harness_with(ScriptedProvider::failing("primary"), "http://127.0.0.1:9/keys");
    let response = send(&h.app, post_json("/api/chat", json!({ "message": "Acme" }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["reply"],
        "Sorry, I'm having trouble right now. Please try again in a moment."
    );
    assert!(h.secondary.calls().is_empty());
}

#[tokio::test]
async fn chat_uses_persisted_key_for_fallback() {
    let h = harness_with(ScriptedProvider::failing("primary"), "http://127.0.0.1:9/keys");
    let request = chat_with_cookie(
        "Acme",
        Some("leaderboard_session=s-1; openrouter_oauth_key=sk-or-persisted"),
    );
    let response = send(&h.app, request).await;
    assert_eq!(body_json(response).await["reply"], "fallback reply");
    assert_eq!(h.secondary.calls()[0].1.as_deref(), Some("sk-or-persisted"));
    assert_eq!(h.state.credentials.get(Some("s-1")).as_deref(), Some("sk-or-persisted"));
}

#[tokio::test]
async fn persisted_key_is_not_shared_with_other_clients() {
    let h = harness_with(ScriptedProvider::failing("primary"), "http://127.0.0.1:9/keys");

    let response = send(
        &h.app,
        chat_with_cookie("Acme", Some("leaderboard_session=s-a; openrouter_oauth_key=sk-or-client-a")),
    )
    .await;
    assert_eq!(body_json(response).await["reply"], "fallback reply");

    // No cookies at all.
    let response = send(&h.app, chat_with_cookie("Acme", None)).await;
    assert_eq!(
        body_json(response).await["reply"],
        "Sorry, I'm having trouble right now. Please try again in a moment."
    );
    // A different session.
    send(&h.app, chat_with_cookie("Acme", Some("leaderboard_session=s-b"))).await;

    let calls = h.secondary.calls();
    assert_eq!(calls.len(), 1, "secondary bearers: {:?}", calls.iter().map(|c| &c.1).collect::<Vec<_>>());
    assert_eq!(calls[0].1.as_deref(), Some("sk-or-client-a"));
}

#[tokio::test]
async fn oauth_start_sets_verifier_and_redirects() {
    let h = harness();
    let request = Request::builder()
        .uri("/api/auth/openrouter")
        .header(header::HOST, "board.test")
        .body(Body::empty())
        .unwrap();
    let response = send(&h.app, request).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with(
        "https://openrouter.ai/auth?callback_url=http%3A%2F%2Fboard.test%2Fapi%2Fauth%2Fopenrouter%2Fcallback&code_challenge="
    ));
    assert!(location.ends_with("&code_challenge_method=S256"));

    let cookies = set_cookies(&response);
    let verifier = cookies
        .iter()
        .find(|c| c.starts_with("openrouter_code_verifier="))
        .expect("verifier cookie");
    for attribute in ["HttpOnly", "SameSite=Lax", "Path=/", "Max-Age=600"] {
        assert!(verifier.contains(attribute), "{} missing from {}", attribute, verifier);
    }
    assert!(!verifier.contains("Secure"));
}

#[tokio::test]
async fn oauth_callback_rejects_incomplete_requests() {
    let h = harness();
    let response = send(&h.app, get("/api/auth/openrouter/callback")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("No authorization code"));

    let response = send(&h.app, get("/api/auth/openrouter/callback?code=abc")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("Session expired"));
}

#[tokio::test]
async fn oauth_callback_exchanges_and_persists_key() {
    let keys_url = spawn_keys_endpoint().await;
    let h = harness_with(ScriptedProvider::failing("primary"), &keys_url);

    let request = Request::builder()
        .uri("/api/auth/openrouter/callback?code=abc")
        .header(header::COOKIE, "openrouter_code_verifier=verifier-123")
        .body(Body::empty())
        .unwrap();
    let response = send(&h.app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let cookies = set_cookies(&response);
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("openrouter_code_verifier=;") && c.contains("Max-Age=0")));
    let key_cookie = cookies
        .iter()
        .find(|c| c.starts_with("openrouter_oauth_key="))
        .expect("key cookie");
    assert!(key_cookie.starts_with("openrouter_oauth_key=sk-or-abc;"));
    assert!(key_cookie.contains("Max-Age=31536000"));
    let session_cookie = cookies
        .iter()
        .find(|c| c.starts_with("leaderboard_session="))
        .expect("session cookie");
    for attribute in ["HttpOnly", "SameSite=Lax", "Path=/", "Max-Age=31536000"] {
        assert!(session_cookie.contains(attribute), "{} missing from {}", attribute, session_cookie);
    }
    let session = cookie_pair(session_cookie);
    let session_id = session.trim_start_matches("leaderboard_session=").to_string();
    assert!(body_text(response).await.contains("Connected Successfully"));
    assert_eq!(h.state.credentials.get(Some(&session_id)).as_deref(), Some("sk-or-abc"));

    // A browser that never connected gets no fallback.
    let response = send(&h.app, post_json("/api/chat", json!({ "message": "Acme" }))).await;
    assert_eq!(
        body_json(response).await["reply"],
        "Sorry, I'm having trouble right now. Please try again in a moment."
    );
    assert!(h.secondary.calls().is_empty());

    // The connected browser is recognised by its session alone.
    let response = send(&h.app, chat_with_cookie("Acme", Some(session.as_str()))).await;
    assert_eq!(body_json(response).await["reply"], "fallback reply");
    assert_eq!(h.secondary.calls()[0].1.as_deref(), Some("sk-or-abc"));
}

#[tokio::test]
async fn oauth_callback_reports_refused_exchange() {
    let keys_url = spawn_keys_endpoint().await;
    let h = harness_with(ScriptedProvider::failing("primary"), &keys_url);

    let request = Request::builder()
        .uri("/api/auth/openrouter/callback?code=abc")
        .header(header::COOKIE, "openrouter_code_verifier=stale")
        .body(Body::empty())
        .unwrap();
    let response = send(&h.app, request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(set_cookies(&response).is_empty());
    let page = body_text(response).await;
    assert!(page.contains("OAuth Exchange Failed"));
    assert!(page.contains("403"));
    assert_eq!(h.state.credentials.get(None), None);
}

#![cfg(not(tarpaulin_include))]

use leaderboard::aggregator::{Aggregator, leaderboard_for_plan};
use leaderboard::config::Config;
use leaderboard::error::LeaderboardError;
use leaderboard::gateway::CompletionGateway;
use leaderboard::oauth::{OAuthClient, Pkce};
use leaderboard::responder::QueryResponder;
use leaderboard::sheets::{GoogleSheets, SheetSource};
use leaderboard::voucher::PlanKey;
use std::env;
use std::sync::Arc;
use std::time::Duration;

const SHEETS_TIMEOUT: Duration = Duration::from_secs(30);

fn usage(program: &str) {
    eprintln!("Usage:");
    eprintln!("  {} summary [12month|6month|3month]", program);
    eprintln!("  {} lookup <words...>", program);
    eprintln!("  {} pkce [callback_url]", program);
}

fn sheet_source(config: &Config) -> Result<Arc<dyn SheetSource>, LeaderboardError> {
    let account = config
        .service_account
        .clone()
        .ok_or_else(|| LeaderboardError::Config("no Google service account configured".to_string()))?;
    Ok(Arc::new(GoogleSheets::new(account, SHEETS_TIMEOUT)?))
}

async fn summary(config: &Config, plan: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let plan = plan.map(str::parse::<PlanKey>).transpose()?;
    let aggregator = Aggregator::new(sheet_source(config)?, config.sheets.clone(), config.summary_ttl);
    let summary = aggregator.get_summary().await?;
    let board = match plan {
        Some(plan) => leaderboard_for_plan(&summary, plan),
        None => summary.leaderboard.clone(),
    };

    println!("{:>4}  {:<28} {:>6} {:>6} {:>6} {:>6}", "#", "Salesperson", "Total", "12M", "6M", "3M");
    for entry in &board {
        println!(
            "{:>4}  {:<28} {:>6} {:>6} {:>6} {:>6}",
            entry.rank.unwrap_or_default(),
            entry.name,
            entry.total,
            entry.by_plan.twelve_month,
            entry.by_plan.six_month,
            entry.by_plan.three_month
        );
    }
    let totals = &summary.totals;
    println!(
        "\n{} vouchers: {} assigned, {} available, {} compromised, {} other ({} salespeople)",
        totals.total_vouchers,
        totals.assigned,
        totals.available,
        totals.compromised,
        totals.other,
        totals.total_salespeople
    );
    println!("Last updated: {}", summary.last_updated);
    Ok(())
}

async fn lookup(config: &Config, words: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let query = words.join(" ");
    let gateway = Arc::new(CompletionGateway::from_config(config)?);
    let responder = QueryResponder::new(sheet_source(config)?, config.sheets.clone(), gateway);
    let reply = responder
        .agent_reply(&query, config.secondary_ai.api_key.as_deref())
        .await?;
    println!("{}", reply);
    Ok(())
}

fn pkce(config: &Config, callback_url: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let pkce = Pkce::generate();
    let client = OAuthClient::new(&config.oauth_auth_url, &config.oauth_keys_url, config.ai_timeout)?;
    let callback = callback_url
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://{}/api/auth/openrouter/callback", config.bind_addr));
    println!("code_verifier:  {}", pkce.verifier);
    println!("code_challenge: {}", pkce.challenge);
    println!("authorize:      {}", client.authorization_url(&callback, &pkce.challenge));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("leaderboard-cli");
    let Some(command) = args.get(1) else {
        usage(program);
        return Ok(());
    };

    let config = Config::from_env()?;
    match command.as_str() {
        "summary" => summary(&config, args.get(2).map(String::as_str)).await,
        "lookup" if args.len() > 2 => lookup(&config, &args[2..]).await,
        "pkce" => pkce(&config, args.get(2).map(String::as_str)),
        _ => {
            usage(program);
            Ok(())
        }
    }
}

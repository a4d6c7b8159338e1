use crate::chart::history::merge_outcome_histories;
use crate::chart::types::{
    CombinedHistory, HistoryPoint, PriceHistoryWire, ReferencePrice, ReferencePriceWire,
    WatchedOutcomes,
};
use crate::error::AppError;
use reqwest::Client;
use tracing::warn;

fn trimmed_base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

fn reference_price_endpoint(rest_base_url: &str, symbol: &str, end_ms: i64) -> String {
    format!("{}/api/price-window", trimmed_base(rest_base_url))
        + &format!("?symbol={}&end_ms={end_ms}", symbol.to_ascii_uppercase())
}

fn price_history_endpoint(
    history_base_url: &str,
    token_id: &str,
    interval: &str,
    fidelity: u32,
) -> String {
    format!("{}/prices-history", trimmed_base(history_base_url))
        + &format!("?market={token_id}&interval={interval}&fidelity={fidelity}")
}

pub async fn fetch_reference_price(
    client: &Client,
    rest_base_url: &str,
    symbol: &str,
    now_ms: i64,
) -> Result<ReferencePrice, AppError> {
    let endpoint = reference_price_endpoint(rest_base_url, symbol, now_ms);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<ReferencePriceWire>().await?;
    payload.into_reference(now_ms)
}

pub async fn fetch_price_history(
    client: &Client,
    history_base_url: &str,
    token_id: &str,
    interval: &str,
    fidelity: u32,
) -> Result<Vec<HistoryPoint>, AppError> {
    let endpoint = price_history_endpoint(history_base_url, token_id, interval, fidelity);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<PriceHistoryWire>().await?;
    Ok(payload.into())
}

/// Fetches both outcome series concurrently. A side that fails is merged as
/// empty; only a double failure is an error.
pub async fn load_combined_history(
    client: &Client,
    history_base_url: &str,
    watched: &WatchedOutcomes,
    interval: &str,
    fidelity: u32,
) -> Result<CombinedHistory, AppError> {
    let (yes, no) = tokio::join!(
        fetch_price_history(
            client,
            history_base_url,
            &watched.yes_token_id,
            interval,
            fidelity
        ),
        fetch_price_history(
            client,
            history_base_url,
            &watched.no_token_id,
            interval,
            fidelity
        ),
    );

    let (yes, no) = match (yes, no) {
        (Err(yes_error), Err(_)) => return Err(yes_error),
        (yes, no) => (
            yes.unwrap_or_else(|error| {
                warn!(%error, token = %watched.yes_token_id, "yes history unavailable");
                Vec::new()
            }),
            no.unwrap_or_else(|error| {
                warn!(%error, token = %watched.no_token_id, "no history unavailable");
                Vec::new()
            }),
        ),
    };

    Ok(merge_outcome_histories(&yes, &no))
}

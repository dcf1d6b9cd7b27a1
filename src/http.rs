use reqwest::Client;
use std::time::Duration;

/// Review list/detail calls and completion calls.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Reply submission and status-check calls.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_client(timeout: Duration) -> Client {
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

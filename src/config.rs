use crate::ozon::retry::RetryPolicy;
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct Settings {
    pub fetch: FetchSettings,
    pub dispatch: DispatchSettings,
    pub scheduler: SchedulerSettings,
    pub lease_ttl: Duration,
    pub ops_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub queue_name: String,
    pub response_log_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub page_size: u32,
    pub web_pages_per_cycle: u32,
    pub web_page_delay: Duration,
    pub retry: RetryPolicy,
    pub generation_batch: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub submit_retry: RetryPolicy,
    pub receive_wait: Duration,
    pub ledger_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub processing_pause: Duration,
    pub fetch_pause: Duration,
    pub error_pause: Duration,
    pub consumer_refresh: Duration,
    pub resend_interval: Option<Duration>,
    pub dispatch_enabled: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            web_pages_per_cycle: 5,
            web_page_delay: Duration::from_secs(1),
            retry: RetryPolicy::FETCH,
            generation_batch: 100,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            submit_retry: RetryPolicy::SUBMIT,
            receive_wait: Duration::from_secs(1),
            ledger_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            processing_pause: Duration::from_secs(5),
            fetch_pause: Duration::from_secs(60),
            error_pause: Duration::from_secs(10),
            consumer_refresh: Duration::from_secs(30 * 60),
            resend_interval: None,
            dispatch_enabled: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch: FetchSettings::default(),
            dispatch: DispatchSettings::default(),
            scheduler: SchedulerSettings::default(),
            lease_ttl: Duration::from_secs(15 * 60),
            ops_addr: ([127, 0, 0, 1], 8002).into(),
            redis_url: None,
            queue_name: "reviews_ozon".into(),
            response_log_path: PathBuf::from("logs/server_responses.txt"),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let fetch = FetchSettings {
            page_size: env_u64("FETCH_PAGE_SIZE")
                .filter(|v| (1..=100).contains(v))
                .map(|v| v as u32)
                .unwrap_or(defaults.fetch.page_size),
            web_pages_per_cycle: env_u64("FETCH_WEB_PAGES_PER_CYCLE")
                .filter(|v| *v > 0)
                .map(|v| v as u32)
                .unwrap_or(defaults.fetch.web_pages_per_cycle),
            web_page_delay: env_secs("FETCH_WEB_PAGE_DELAY_SECS")
                .unwrap_or(defaults.fetch.web_page_delay),
            retry: defaults.fetch.retry,
            generation_batch: env_u64("GENERATION_BATCH_SIZE")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(defaults.fetch.generation_batch),
        };
        let dispatch = DispatchSettings {
            submit_retry: defaults.dispatch.submit_retry,
            receive_wait: defaults.dispatch.receive_wait,
            ledger_ttl: env_secs("DISPATCH_LEDGER_TTL_SECS")
                .filter(|v| !v.is_zero())
                .unwrap_or(defaults.dispatch.ledger_ttl),
        };
        let scheduler = SchedulerSettings {
            processing_pause: env_secs("SCHEDULER_PROCESSING_PAUSE_SECS")
                .unwrap_or(defaults.scheduler.processing_pause),
            fetch_pause: env_secs("SCHEDULER_FETCH_PAUSE_SECS")
                .unwrap_or(defaults.scheduler.fetch_pause),
            error_pause: defaults.scheduler.error_pause,
            consumer_refresh: env_secs("SCHEDULER_CONSUMER_REFRESH_SECS")
                .filter(|v| !v.is_zero())
                .unwrap_or(defaults.scheduler.consumer_refresh),
            resend_interval: env_secs("DISPATCH_RESEND_INTERVAL_SECS").filter(|v| !v.is_zero()),
            dispatch_enabled: env_bool("DISPATCH_ENABLED").unwrap_or(true),
        };
        Self {
            fetch,
            dispatch,
            scheduler,
            lease_ttl: env_secs("LEASE_TTL_SECS")
                .filter(|v| v.as_secs() >= 30)
                .unwrap_or(defaults.lease_ttl),
            ops_addr: env::var("OPS_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ops_addr),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            queue_name: env::var("QUEUE_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.queue_name),
            response_log_path: env::var("RESPONSE_LOG_PATH")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.response_log_path),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_secs)
}

pub fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

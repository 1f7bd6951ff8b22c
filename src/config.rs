use once_cell::sync::Lazy;
use std::env;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

pub static PORT: Lazy<u16> = Lazy::new(|| env_parse("PORT").unwrap_or(8000));

pub static REDIS_URL: Lazy<Option<String>> =
    Lazy::new(|| env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()));

pub static ADMIN_API_KEY: Lazy<Option<String>> =
    Lazy::new(|| env::var("ADMIN_API_KEY").ok().filter(|v| !v.trim().is_empty()));

/// Seconds between backfill invocations.
pub static BACKFILL_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    env_parse::<u64>("BACKFILL_INTERVAL_SECS")
        .filter(|v| *v > 0)
        .unwrap_or(60)
});

pub static BACKFILL_BATCH_SIZE: Lazy<usize> = Lazy::new(|| {
    env_parse::<usize>("BACKFILL_BATCH_SIZE")
        .filter(|v| *v > 0)
        .unwrap_or(crate::backfill::DEFAULT_BATCH_SIZE)
        .min(crate::shop::MAX_PAGE_SIZE)
});

pub static SETTINGS_FILE: Lazy<Option<String>> =
    Lazy::new(|| env::var("SYNC_MAUTIC_CONFIG").ok().filter(|v| !v.trim().is_empty()));

pub static WOO_BASE_URL: Lazy<String> =
    Lazy::new(|| env::var("WOO_BASE_URL").unwrap_or_default());

pub static WOO_CONSUMER_KEY: Lazy<String> =
    Lazy::new(|| env::var("WOO_CONSUMER_KEY").unwrap_or_default());

pub static WOO_CONSUMER_SECRET: Lazy<String> =
    Lazy::new(|| env::var("WOO_CONSUMER_SECRET").unwrap_or_default());

pub fn body_limit() -> usize {
    env_parse::<usize>("REQUEST_MAX_BYTES")
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024)
}

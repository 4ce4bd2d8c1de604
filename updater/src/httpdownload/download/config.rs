use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};

use crate::util::HALF_SECOND;

pub const DEFAULT_USER_AGENT: &str = "updater";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/**
Holds the http configuration for the Download
 */
#[derive(Debug, Clone)]
pub struct HttpDownloadConfig {
    /**
     * Timeout for the response to arrive and for every chunk of the body after it
     */
    pub timeout: Duration,
    /**
     * Request headers for the Download
     */
    pub headers: HeaderMap,
    /**
     * Retries after a transient network failure before the download fails
     */
    pub max_retries: u32,
    /**
     * Delay before the first retry, doubled for every retry after it
     */
    pub retry_backoff: Duration,
    /**
     * Minimum time between two progress updates of a download
     */
    pub progress_interval: Duration,
}

impl HttpDownloadConfig {
    /// Backoff before retry number `retry` (starting at 1), capped at 30s.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for HttpDownloadConfig {
    /**
    Creates a default set of settings:
    * headers: { user-agent: "updater" }
    * timeout: 60s
    * max_retries: 3, first backoff 1s
    * progress updates at most every 500ms
     */
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );
        HttpDownloadConfig {
            timeout: Duration::from_secs(60),
            headers,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            progress_interval: HALF_SECOND,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_doubles_and_is_capped() {
        let config = HttpDownloadConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(10), MAX_BACKOFF);
        assert_eq!(config.backoff(u32::MAX), MAX_BACKOFF);
    }
}

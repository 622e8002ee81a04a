// =============================================================================
// Sentiment Context Fetcher — best-effort external market mood inputs
// =============================================================================
//
// Fetched once per analysis cycle when the sentiment agent is enabled.
// Every fetch is best-effort: failures are logged and degrade to an empty
// context, never failing the cycle.
// =============================================================================

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::agents::graph::SentimentContext;

/// Pluggable headline provider (news scraping itself lives outside the
/// core; this is only the seam it plugs into).
#[async_trait]
pub trait HeadlineSource: Send + Sync {
    async fn headlines(&self, symbol: &str, limit: usize) -> Result<Vec<String>>;
}

/// Fetches the crowd fear & greed index and optional headlines.
pub struct SentimentContextFetcher {
    client: reqwest::Client,
    fear_greed_url: String,
    headlines: Option<Arc<dyn HeadlineSource>>,
}

impl SentimentContextFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            fear_greed_url: "https://api.alternative.me/fng/?limit=1".to_string(),
            headlines: None,
        }
    }

    pub fn with_headline_source(mut self, source: Arc<dyn HeadlineSource>) -> Self {
        self.headlines = Some(source);
        self
    }

    #[cfg(test)]
    fn with_fear_greed_url(mut self, url: impl Into<String>) -> Self {
        self.fear_greed_url = url.into();
        self
    }

    /// Gather the full context for one cycle. Never fails; missing pieces
    /// stay empty.
    pub async fn fetch(&self, symbol: &str) -> SentimentContext {
        let fear_greed = match self.fetch_fear_greed().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "fear & greed fetch failed — continuing without it");
                None
            }
        };

        let headlines = match &self.headlines {
            Some(source) => match source.headlines(symbol, 10).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "headline fetch failed — continuing without headlines");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        debug!(
            fear_greed = fear_greed.as_deref().unwrap_or("n/a"),
            headlines = headlines.len(),
            "sentiment context gathered"
        );

        SentimentContext {
            fear_greed,
            headlines,
        }
    }

    /// GET the alternative.me fear & greed index.
    ///
    /// Response shape: `{"data": [{"value": "52", "value_classification": "Neutral"}]}`
    async fn fetch_fear_greed(&self) -> Result<String> {
        let resp = self
            .client
            .get(&self.fear_greed_url)
            .send()
            .await
            .context("fear & greed request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse fear & greed response")?;

        if !status.is_success() {
            anyhow::bail!("fear & greed API returned {status}");
        }

        let entry = body["data"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("fear & greed response has no data entries")?;

        let value = entry["value"].as_str().unwrap_or("?");
        let label = entry["value_classification"].as_str().unwrap_or("Unknown");
        Ok(format!("{value} ({label})"))
    }
}

impl Default for SentimentContextFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SentimentContextFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentimentContextFetcher")
            .field("fear_greed_url", &self.fear_greed_url)
            .field("has_headline_source", &self.headlines.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedHeadlines;

    #[async_trait]
    impl HeadlineSource for CannedHeadlines {
        async fn headlines(&self, _symbol: &str, _limit: usize) -> Result<Vec<String>> {
            Ok(vec!["ETF inflows continue".to_string()])
        }
    }

    struct FailingHeadlines;

    #[async_trait]
    impl HeadlineSource for FailingHeadlines {
        async fn headlines(&self, _symbol: &str, _limit: usize) -> Result<Vec<String>> {
            anyhow::bail!("scraper offline")
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_to_empty_context() {
        // Nothing listens on this port; the fetch must not error out.
        let fetcher =
            SentimentContextFetcher::new().with_fear_greed_url("http://127.0.0.1:1/fng");
        let ctx = fetcher.fetch("BTCUSDT").await;
        assert!(ctx.fear_greed.is_none());
        assert!(ctx.headlines.is_empty());
    }

    #[tokio::test]
    async fn headline_source_feeds_context() {
        let fetcher = SentimentContextFetcher::new()
            .with_fear_greed_url("http://127.0.0.1:1/fng")
            .with_headline_source(Arc::new(CannedHeadlines));
        let ctx = fetcher.fetch("BTCUSDT").await;
        assert_eq!(ctx.headlines, vec!["ETF inflows continue"]);
    }

    #[tokio::test]
    async fn failing_headline_source_degrades_to_empty() {
        let fetcher = SentimentContextFetcher::new()
            .with_fear_greed_url("http://127.0.0.1:1/fng")
            .with_headline_source(Arc::new(FailingHeadlines));
        let ctx = fetcher.fetch("BTCUSDT").await;
        assert!(ctx.headlines.is_empty());
    }
}

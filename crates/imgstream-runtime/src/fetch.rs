use std::time::Duration;

use async_trait::async_trait;

use imgstream_core::error::FetchError;
use imgstream_core::types::{FetchResult, Image, RecordRef};

use crate::decode::decode_and_resize;

type HttpClient = reqwest::Client;

/// GET attempts per URL before a transient failure drops the item.
pub const HTTP_MAX_ATTEMPTS: usize = 3;
const HTTP_BASE_DELAY_MS: u64 = 50;
const HTTP_MAX_DELAY_MS: u64 = 1000;

/// Retrieves and decodes one record's image.
///
/// Implementations report every failure as [`FetchResult::Failed`] for that record; a fetch
/// never fails its siblings in the same task group.
#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    async fn fetch(&self, record: RecordRef) -> FetchResult;
}

/// HTTP(S) GET plus decode/resize to a fixed `height x width` RGB image.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: HttpClient,
    height: u32,
    width: u32,
}

impl HttpImageFetcher {
    pub fn new(height: u32, width: u32) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self::with_client(client, height, width))
    }

    pub fn with_client(client: HttpClient, height: u32, width: u32) -> Self {
        Self {
            client,
            height,
            width,
        }
    }

    async fn fetch_image(&self, record: &RecordRef) -> Result<Image, FetchError> {
        let bytes = http_get(&self.client, &record.url, record.record_id).await?;
        let (height, width) = (self.height, self.width);
        tokio::task::spawn_blocking(move || decode_and_resize(&bytes, height, width))
            .await
            .map_err(|e| FetchError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, record: RecordRef) -> FetchResult {
        match self.fetch_image(&record).await {
            Ok(image) => FetchResult::Fetched {
                image,
                original_id: record.original_id,
            },
            Err(error) => {
                tracing::debug!(
                    target: "imgstream_pipeline",
                    event = "fetch_failed",
                    original_id = %record.original_id,
                    url = %record.url,
                    error = %error,
                    "image fetch failed"
                );
                FetchResult::Failed {
                    original_id: record.original_id,
                    url: record.url,
                    error,
                }
            }
        }
    }
}

async fn http_get(client: &HttpClient, url: &str, record_id: u64) -> Result<Vec<u8>, FetchError> {
    let resp = http_with_retry(record_id, || async move { client.get(url).send().await })
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(FetchError::Status {
            status: resp.status().as_u16(),
            url: url.to_string(),
        });
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    Ok(bytes.to_vec())
}

fn backoff_delay(delay_ms: u64, record_id: u64) -> Duration {
    let jitter = imgstream_observe::time::unix_time_ms().wrapping_add(record_id) % 37;
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

fn is_transient(outcome: &Result<reqwest::Response, reqwest::Error>) -> bool {
    match outcome {
        Ok(resp) => is_transient_status(resp.status()),
        Err(err) => err.is_timeout() || err.is_connect(),
    }
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Re-issues `f` on transient outcomes, up to [`HTTP_MAX_ATTEMPTS`] attempts in total, and
/// returns the last outcome.
async fn http_with_retry<F, Fut>(
    record_id: u64,
    mut f: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut delay_ms: u64 = HTTP_BASE_DELAY_MS;
    for _ in 1..HTTP_MAX_ATTEMPTS {
        let outcome = f().await;
        if !is_transient(&outcome) {
            return outcome;
        }
        tokio::time::sleep(backoff_delay(delay_ms, record_id)).await;
        delay_ms = delay_ms.saturating_mul(2).min(HTTP_MAX_DELAY_MS);
    }
    f().await
}

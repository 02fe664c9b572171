use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::storage::{StorageKey, StoreResult};

/// A secondary backend on an HTTP server.
///
/// Blobs live at `<base>/<digest><suffix>`. `GET` answers `200` with the blob or `404`, `PUT`
/// stores a blob and `HEAD` checks for existence.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    bearer_token: Option<String>,
}

impl HttpBackend {
    pub fn new(
        mut base: Url,
        bearer_token: Option<String>,
        connect_timeout: Duration,
    ) -> CacheResult<Self> {
        if base.cannot_be_a_base() {
            return Err(CacheError::configuration(format!(
                "{base} cannot be used as a secondary storage URL"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| CacheError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            bearer_token,
        })
    }

    fn url_for(&self, key: &StorageKey) -> CacheResult<Url> {
        self.base
            .join(&key.to_string())
            .map_err(|e| CacheError::Remote(format!("URL construction failed: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn get(&self, key: &StorageKey) -> CacheResult<Option<Vec<u8>>> {
        let url = self.url_for(key)?;
        let response = self
            .authorize(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| CacheError::Remote(format!("GET {url} failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                tracing::trace!("Success hitting secondary storage {}", url);
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| CacheError::Remote(format!("reading {url} failed: {e}")))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CacheError::Remote(format!(
                "access to {url} denied ({})",
                response.status()
            ))),
            status => Err(CacheError::Remote(format!(
                "unexpected status {status} from GET {url}"
            ))),
        }
    }

    pub async fn put(&self, key: &StorageKey, data: &[u8]) -> CacheResult<StoreResult> {
        let url = self.url_for(key)?;
        let response = self
            .authorize(self.client.put(url.clone()))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| CacheError::Remote(format!("PUT {url} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(StoreResult::Written(data.len() as u64))
        } else {
            Err(CacheError::Remote(format!(
                "unexpected status {status} from PUT {url}"
            )))
        }
    }

    pub async fn contains(&self, key: &StorageKey) -> CacheResult<bool> {
        let url = self.url_for(key)?;
        let response = self
            .authorize(self.client.head(url.clone()))
            .send()
            .await
            .map_err(|e| CacheError::Remote(format!("HEAD {url} failed: {e}")))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(CacheError::Remote(format!(
                "unexpected status {status} from HEAD {url}"
            ))),
        }
    }
}

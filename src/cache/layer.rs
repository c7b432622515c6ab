//! Handle on a single named bucket.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestKey};
use crate::http::{Fetcher, Request};
#[cfg(test)]
use crate::http::Response;

/// An opened bucket.
///
/// Cloning is cheap; all clones share the same storage.
#[derive(Clone)]
pub struct Bucket {
  storage: Arc<dyn CacheStorage>,
  name: String,
}

impl Bucket {
  /// Open the bucket named `name`, creating it if absent.
  pub async fn open(storage: Arc<dyn CacheStorage>, name: &str) -> Result<Self> {
    storage.open(name).await?;
    Ok(Self {
      storage,
      name: name.to_string(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Store a snapshot under `key`, replacing whatever was there.
  pub async fn put(&self, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    self.storage.put(&self.name, key, response).await
  }

  /// Look up `key` in this bucket only.
  #[cfg(test)]
  pub async fn get(&self, key: &RequestKey) -> Result<Option<Response>> {
    Ok(
      self
        .storage
        .get(&self.name, key)
        .await?
        .map(|cached| cached.to_response()),
    )
  }

  #[cfg(test)]
  pub async fn keys(&self) -> Result<Vec<RequestKey>> {
    self.storage.entries(&self.name).await
  }

  /// Fetch every URL and store the results as one batch.
  ///
  /// The fetches run concurrently. A network error or a non-2xx status on any
  /// of them fails the whole call and nothing is written.
  pub async fn add_all(&self, fetcher: &dyn Fetcher, urls: &[Url]) -> Result<usize> {
    let fetches = urls.iter().map(|url| fetch_entry(fetcher, url));

    let batch = try_join_all(fetches).await?;
    self.storage.put_all(&self.name, &batch).await?;
    Ok(batch.len())
  }
}

/// Fetch one seed URL into a storable snapshot.
async fn fetch_entry(fetcher: &dyn Fetcher, url: &Url) -> Result<(RequestKey, CachedResponse)> {
  let request = Request::get(url.clone());
  let response = fetcher.fetch(&request).await?;
  if !response.ok() {
    return Err(eyre!(
      "Request for {} returned status {}",
      url,
      response.status
    ));
  }
  debug!(%url, status = response.status, "fetched seed entry");

  Ok((
    RequestKey::from_request(&request),
    CachedResponse::from_response(response)?,
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::testing::ScriptedNetwork;

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:8000/").unwrap().join(path).unwrap()
  }

  #[tokio::test]
  async fn test_add_all_stores_every_url() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let network = ScriptedNetwork::new()
      .route("http://localhost:8000/", 200, "root")
      .route("http://localhost:8000/index.html", 200, "index");

    let bucket = Bucket::open(storage, "monitor-iot-v1.0.0").await.unwrap();
    let stored = bucket
      .add_all(&network, &[url("/"), url("/index.html")])
      .await
      .unwrap();

    assert_eq!(stored, 2);
    assert_eq!(bucket.keys().await.unwrap().len(), 2);
    let mut index = bucket
      .get(&RequestKey::get(url("/index.html")))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(index.text().unwrap(), "index");
  }

  #[tokio::test]
  async fn test_add_all_is_all_or_nothing() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    // /missing.js is not routed, so the scripted network answers 404.
    let network = ScriptedNetwork::new().route("http://localhost:8000/", 200, "root");

    let bucket = Bucket::open(storage, "monitor-iot-v1.0.0").await.unwrap();
    let result = bucket.add_all(&network, &[url("/"), url("/missing.js")]).await;

    assert!(result.is_err());
    assert!(bucket.keys().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_add_all_fails_when_offline() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let network = ScriptedNetwork::new().route("http://localhost:8000/", 200, "root");
    network.set_online(false);

    let bucket = Bucket::open(storage, "monitor-iot-v1.0.0").await.unwrap();
    assert!(bucket.add_all(&network, &[url("/")]).await.is_err());
    assert!(bucket.keys().await.unwrap().is_empty());
  }
}

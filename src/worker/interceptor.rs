//! Network-first caching worker for the Monitor IoT dashboard.

use color_eyre::Result;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{Bucket, CacheStorage, CachedResponse, RequestKey};
use crate::config::Config;
use crate::http::{Fetcher, Method, Request, Response};

use super::event::{ActivateEvent, FetchEvent, InstallEvent, PushEvent};
use super::ServiceWorker;

/// Everything the interceptor needs to know about the deployment.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  /// Current bucket; any other bucket is stale
  pub cache_name: String,
  pub precache: Vec<Url>,
  /// URL substrings that make a response worth caching
  pub cache_patterns: Vec<String>,
  /// Shell document for offline navigations
  pub fallback: Url,
}

impl CacheSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      cache_name: config.cache_name.clone(),
      precache: config.precache_urls()?,
      cache_patterns: config.cache_patterns.clone(),
      fallback: config.fallback_url()?,
    })
  }

  /// Static assets are recognised by plain substring match on the full URL.
  pub fn is_cacheable(&self, url: &Url) -> bool {
    let url = url.as_str();
    self.cache_patterns.iter().any(|p| url.contains(p.as_str()))
  }
}

struct Inner {
  settings: CacheSettings,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Fetcher>,
}

/// Worker that seeds and prunes the versioned bucket and serves requests
/// network-first with a cache fallback.
///
/// Cloning is cheap; clones share settings, storage and network.
#[derive(Clone)]
pub struct CacheInterceptor {
  inner: Arc<Inner>,
}

impl CacheInterceptor {
  pub fn new(
    settings: CacheSettings,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Fetcher>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        settings,
        storage,
        network,
      }),
    }
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.inner.settings
  }

  async fn bucket(&self) -> Result<Bucket> {
    Bucket::open(self.inner.storage.clone(), &self.inner.settings.cache_name).await
  }

  /// Open the current bucket and seed it with the precache list.
  pub async fn precache(&self) -> Result<usize> {
    let bucket = self.bucket().await?;
    debug!(cache = bucket.name(), "cache opened");
    bucket
      .add_all(self.inner.network.as_ref(), &self.inner.settings.precache)
      .await
  }

  /// Delete every bucket except the current one, concurrently. Returns the
  /// names that were removed.
  pub async fn purge_stale(&self) -> Result<Vec<String>> {
    let current = &self.inner.settings.cache_name;
    let stale: Vec<String> = self
      .inner
      .storage
      .keys()
      .await?
      .into_iter()
      .filter(|name| name != current)
      .collect();

    try_join_all(stale.iter().map(|name| {
      info!(cache = %name, "deleting stale cache");
      self.inner.storage.delete(name)
    }))
    .await?;

    if !self.inner.storage.has(current).await? {
      warn!(cache = %current, "activating without an installed cache");
    }

    Ok(stale)
  }

  /// Network-first lookup with cache fallback.
  ///
  /// Never fails: a network error falls back to the cache, and a cache miss
  /// ends in either the shell document or a synthetic 504.
  pub async fn network_first(&self, request: Request) -> Response {
    match self.inner.network.fetch(&request).await {
      Ok(response) => {
        if self.inner.settings.is_cacheable(&request.url) {
          self.store_copy(&request, &response).await;
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, trying cache");
        self.cache_fallback(&request).await
      }
    }
  }

  /// Store a duplicate of `response`; the original stays unread for the
  /// caller. Failures are logged only.
  async fn store_copy(&self, request: &Request, response: &Response) {
    match self.try_store_copy(request, response).await {
      Ok(()) => debug!(url = %request.url, status = response.status, "cached response"),
      Err(e) => warn!(url = %request.url, error = %e, "failed to cache response"),
    }
  }

  async fn try_store_copy(&self, request: &Request, response: &Response) -> Result<()> {
    let snapshot = CachedResponse::from_response(response.try_clone()?)?;
    self
      .bucket()
      .await?
      .put(&RequestKey::from_request(request), &snapshot)
      .await
  }

  async fn cache_fallback(&self, request: &Request) -> Response {
    if let Some(cached) = self.lookup(&RequestKey::from_request(request)).await {
      debug!(url = %request.url, "served from cache");
      return cached;
    }

    if request.accepts_html() {
      let shell = RequestKey::get(self.inner.settings.fallback.clone());
      if let Some(cached) = self.lookup(&shell).await {
        debug!(url = %request.url, fallback = %shell.url, "served shell document");
        return cached;
      }
    }

    debug!(url = %request.url, "offline and not cached");
    Response::gateway_timeout()
  }

  async fn lookup(&self, key: &RequestKey) -> Option<Response> {
    match self.inner.storage.match_any(key).await {
      Ok(found) => found.map(|cached| cached.to_response()),
      Err(e) => {
        warn!(key = %key, error = %e, "cache lookup failed");
        None
      }
    }
  }
}

impl ServiceWorker for CacheInterceptor {
  fn version(&self) -> &str {
    &self.inner.settings.cache_name
  }

  fn on_install(&self, event: &mut InstallEvent) {
    info!(cache = %self.inner.settings.cache_name, "installing");

    let this = self.clone();
    event.wait_until(async move {
      match this.precache().await {
        Ok(count) => info!(entries = count, "precache complete"),
        Err(e) => error!(error = %e, "failed to precache"),
      }
      Ok(())
    });

    event.skip_waiting();
  }

  fn on_activate(&self, event: &mut ActivateEvent) {
    info!(cache = %self.inner.settings.cache_name, "activating");

    let this = self.clone();
    event.wait_until(async move { this.purge_stale().await.map(|_| ()) });

    event.claim_clients();
  }

  fn on_fetch(&self, event: &mut FetchEvent) {
    if event.request().method != Method::Get {
      return;
    }
    debug!(client = event.client_id(), url = %event.request().url, "intercepted fetch");

    let this = self.clone();
    let request = event.request().clone();
    let responded = event.respond_with(async move { Ok(this.network_first(request).await) });
    if let Err(e) = responded {
      error!(error = %e, "could not respond to fetch");
    }
  }

  fn on_push(&self, event: &mut PushEvent) {
    info!(
      bytes = event.data().map(<[u8]>::len).unwrap_or(0),
      text = event.text().unwrap_or_default(),
      "push received"
    );
  }
}

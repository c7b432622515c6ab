//! Lifecycle and functional events dispatched to a worker.
//!
//! Handlers run synchronously and hand any async work back to the host with
//! `wait_until` (or `respond_with` for fetches). The host awaits that work
//! before it moves the worker to the next state.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture};
use std::future::Future;

use crate::http::{Request, Response};

use super::host::ClientId;

/// Pending work registered by a handler.
#[derive(Default)]
pub struct ExtendableEvent {
  pending: Vec<BoxFuture<'static, Result<()>>>,
}

impl ExtendableEvent {
  /// Keep the event alive until `work` completes.
  pub fn wait_until<F>(&mut self, work: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.pending.push(Box::pin(work));
  }

  #[cfg(test)]
  pub fn pending(&self) -> usize {
    self.pending.len()
  }

  /// Run all registered work concurrently. Fails with the first error
  /// (in registration order) once everything has finished.
  pub async fn settle(&mut self) -> Result<()> {
    let work = std::mem::take(&mut self.pending);
    for result in join_all(work).await {
      result?;
    }
    Ok(())
  }
}

/// Dispatched once when a worker is installed.
#[derive(Default)]
pub struct InstallEvent {
  extendable: ExtendableEvent,
  skip_waiting: bool,
}

impl InstallEvent {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn wait_until<F>(&mut self, work: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.extendable.wait_until(work);
  }

  /// Activate as soon as installation finishes instead of waiting for the
  /// current worker's clients to go away.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  pub(crate) async fn settle(&mut self) -> Result<()> {
    self.extendable.settle().await
  }
}

/// Dispatched when a worker takes over.
#[derive(Default)]
pub struct ActivateEvent {
  extendable: ExtendableEvent,
  claim: bool,
}

impl ActivateEvent {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn wait_until<F>(&mut self, work: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.extendable.wait_until(work);
  }

  /// Take control of every open client, not just ones opened from now on.
  pub fn claim_clients(&mut self) {
    self.claim = true;
  }

  pub fn claim_requested(&self) -> bool {
    self.claim
  }

  pub(crate) async fn settle(&mut self) -> Result<()> {
    self.extendable.settle().await
  }
}

/// Dispatched for every request made by a controlled client.
pub struct FetchEvent {
  request: Request,
  client_id: ClientId,
  response: Option<BoxFuture<'static, Result<Response>>>,
}

impl FetchEvent {
  pub fn new(request: Request, client_id: ClientId) -> Self {
    Self {
      request,
      client_id,
      response: None,
    }
  }

  pub fn request(&self) -> &Request {
    &self.request
  }

  pub fn client_id(&self) -> ClientId {
    self.client_id
  }

  /// Answer the request with `response` instead of letting it go to the
  /// network. May only be called once.
  pub fn respond_with<F>(&mut self, response: F) -> Result<()>
  where
    F: Future<Output = Result<Response>> + Send + 'static,
  {
    if self.response.is_some() {
      return Err(eyre!(
        "respond_with already called for {}",
        self.request.url
      ));
    }
    self.response = Some(Box::pin(response));
    Ok(())
  }

  pub(crate) fn take_response(&mut self) -> Option<BoxFuture<'static, Result<Response>>> {
    self.response.take()
  }
}

/// Dispatched when a push message arrives.
#[derive(Default)]
pub struct PushEvent {
  data: Option<Vec<u8>>,
}

impl PushEvent {
  pub fn new(data: Option<Vec<u8>>) -> Self {
    Self { data }
  }

  pub fn data(&self) -> Option<&[u8]> {
    self.data.as_deref()
  }

  /// Payload as text, if there is one and it is UTF-8.
  pub fn text(&self) -> Option<&str> {
    self.data().and_then(|d| std::str::from_utf8(d).ok())
  }
}

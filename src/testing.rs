//! Test doubles for the network seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::http::{Fetcher, Headers, Method, Request, Response};

/// Fetcher that answers from a fixed routing table and can be switched
/// offline. Unrouted URLs answer 404.
pub struct ScriptedNetwork {
  online: AtomicBool,
  routes: Mutex<HashMap<String, (u16, Headers, Vec<u8>)>>,
  log: Mutex<Vec<(Method, String)>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      log: Mutex::new(Vec::new()),
    }
  }

  pub fn route(self, url: &str, status: u16, body: &str) -> Self {
    self.set_route(url, status, body);
    self
  }

  pub fn route_with_type(self, url: &str, status: u16, content_type: &str, body: &str) -> Self {
    let mut headers = Headers::new();
    headers.set("content-type", content_type);
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), (status, headers, body.as_bytes().to_vec()));
    self
  }

  pub fn set_route(&self, url: &str, status: u16, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), (status, Headers::new(), body.as_bytes().to_vec()));
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Requests that reached the network, as `(method, url)`.
  pub fn requests(&self) -> Vec<(Method, String)> {
    self.log.lock().unwrap().clone()
  }
}

#[async_trait]
impl Fetcher for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self
      .log
      .lock()
      .unwrap()
      .push((request.method.clone(), request.url.to_string()));

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("Network unavailable: {}", request.url));
    }

    let routes = self.routes.lock().unwrap();
    let response = match routes.get(request.url.as_str()) {
      Some((status, headers, body)) => {
        Response::new(*status, body.clone()).with_headers(headers.clone())
      }
      None => Response::new(404, Vec::new()),
    };
    Ok(response.with_url(request.url.clone()))
  }
}

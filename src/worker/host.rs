//! Registration host: drives worker lifecycles and routes client requests.

use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::http::{Fetcher, Request, Response};

use super::event::{ActivateEvent, FetchEvent, InstallEvent, PushEvent};
use super::state::WorkerState;
use super::ServiceWorker;

/// Identifier of an open client page.
pub type ClientId = u64;

struct WorkerSlot {
  id: u64,
  worker: Arc<dyn ServiceWorker>,
  state: WorkerState,
}

impl WorkerSlot {
  fn transition(&mut self, state: WorkerState) {
    debug!(
      worker = self.id,
      version = self.worker.version(),
      from = %self.state,
      to = %state,
      "worker state change"
    );
    self.state = state;
  }
}

/// A scope's registration: at most one waiting and one active worker, plus
/// the clients they control.
pub struct Registration {
  network: Arc<dyn Fetcher>,
  waiting: Option<WorkerSlot>,
  active: Option<WorkerSlot>,
  /// Open clients and the id of the worker controlling each, if any
  clients: BTreeMap<ClientId, Option<u64>>,
  next_client: ClientId,
  next_worker: u64,
}

impl Registration {
  /// `network` serves requests no worker answers.
  pub fn new(network: Arc<dyn Fetcher>) -> Self {
    Self {
      network,
      waiting: None,
      active: None,
      clients: BTreeMap::new(),
      next_client: 1,
      next_worker: 1,
    }
  }

  /// Install `worker` and activate it when allowed.
  ///
  /// Activation is immediate when there is no active worker, the active worker
  /// controls no clients, or the worker asked to skip waiting. Otherwise it
  /// stays `Installed` until the last controlled client closes.
  pub async fn register(&mut self, worker: Arc<dyn ServiceWorker>) -> Result<WorkerState> {
    let mut slot = WorkerSlot {
      id: self.next_worker,
      worker,
      state: WorkerState::Parsed,
    };
    self.next_worker += 1;

    info!(worker = slot.id, version = slot.worker.version(), "installing worker");
    slot.transition(WorkerState::Installing);

    let mut event = InstallEvent::new();
    slot.worker.on_install(&mut event);
    if let Err(e) = event.settle().await {
      warn!(worker = slot.id, error = %e, "install failed");
      slot.transition(WorkerState::Redundant);
      return Err(e.wrap_err(format!(
        "Failed to install worker {}",
        slot.worker.version()
      )));
    }
    slot.transition(WorkerState::Installed);

    if let Some(mut replaced) = self.waiting.replace(slot) {
      replaced.transition(WorkerState::Redundant);
    }

    if event.skip_waiting_requested() || !self.active_has_clients() {
      self.activate_waiting().await;
    }

    Ok(self.newest_state())
  }

  /// Promote the waiting worker, retiring the current active one.
  async fn activate_waiting(&mut self) {
    let Some(mut slot) = self.waiting.take() else {
      return;
    };

    if let Some(mut previous) = self.active.take() {
      previous.transition(WorkerState::Redundant);
      // Clients follow the registration's active worker.
      for controller in self.clients.values_mut() {
        if *controller == Some(previous.id) {
          *controller = Some(slot.id);
        }
      }
    }

    info!(worker = slot.id, version = slot.worker.version(), "activating worker");
    slot.transition(WorkerState::Activating);

    let mut event = ActivateEvent::new();
    slot.worker.on_activate(&mut event);
    if let Err(e) = event.settle().await {
      error!(worker = slot.id, error = %e, "activate work failed");
    }
    slot.transition(WorkerState::Activated);

    if event.claim_requested() {
      for controller in self.clients.values_mut() {
        *controller = Some(slot.id);
      }
      debug!(worker = slot.id, clients = self.clients.len(), "claimed clients");
    }

    self.active = Some(slot);
  }

  fn active_has_clients(&self) -> bool {
    match &self.active {
      Some(active) => self.clients.values().any(|c| *c == Some(active.id)),
      None => false,
    }
  }

  fn newest_state(&self) -> WorkerState {
    self
      .waiting
      .as_ref()
      .or(self.active.as_ref())
      .map(|slot| slot.state)
      .unwrap_or(WorkerState::Redundant)
  }

  pub fn active_version(&self) -> Option<&str> {
    self.active.as_ref().map(|slot| slot.worker.version())
  }

  #[cfg(test)]
  pub fn waiting_version(&self) -> Option<&str> {
    self.waiting.as_ref().map(|slot| slot.worker.version())
  }

  /// Open a client page. It is controlled by the active worker, if any.
  pub fn open_client(&mut self) -> ClientId {
    let id = self.next_client;
    self.next_client += 1;
    let controller = self.active.as_ref().map(|slot| slot.id);
    self.clients.insert(id, controller);
    id
  }

  /// Close a client page. If that releases the active worker, a waiting
  /// worker takes over.
  pub async fn close_client(&mut self, client: ClientId) {
    self.clients.remove(&client);
    if self.waiting.is_some() && !self.active_has_clients() {
      self.activate_waiting().await;
    }
  }

  /// Version of the worker controlling `client`.
  #[cfg(test)]
  pub fn controller(&self, client: ClientId) -> Option<&str> {
    let id = (*self.clients.get(&client)?)?;
    self
      .active
      .as_ref()
      .filter(|slot| slot.id == id)
      .map(|slot| slot.worker.version())
  }

  /// Route a request made by `client`.
  ///
  /// Controlled clients go through the active worker's fetch handler; if the
  /// handler does not respond, or the client is uncontrolled, the request
  /// goes straight to the network.
  pub async fn fetch(&self, client: ClientId, request: Request) -> Result<Response> {
    let controller = self.clients.get(&client).copied().flatten();
    let active = self
      .active
      .as_ref()
      .filter(|slot| Some(slot.id) == controller && slot.state.can_intercept_fetch());

    let Some(active) = active else {
      return self.network.fetch(&request).await;
    };

    let mut event = FetchEvent::new(request, client);
    active.worker.on_fetch(&mut event);

    match event.take_response() {
      Some(response) => response.await,
      None => self.network.fetch(event.request()).await,
    }
  }

  /// Deliver a push message to the active worker.
  pub fn push(&self, data: Option<Vec<u8>>) {
    let Some(active) = &self.active else {
      debug!("push dropped, no active worker");
      return;
    };

    let mut event = PushEvent::new(data);
    active.worker.on_push(&mut event);
  }

  /// Drop every worker and release all clients.
  #[cfg(test)]
  pub fn unregister(&mut self) {
    for mut slot in [self.waiting.take(), self.active.take()]
      .into_iter()
      .flatten()
    {
      slot.transition(WorkerState::Redundant);
    }
    for controller in self.clients.values_mut() {
      *controller = None;
    }
    info!("registration removed");
  }
}

//! Worker lifecycle model and the caching worker for the dashboard.
//!
//! A [`Registration`] plays the part of the hosting platform: it installs and
//! activates workers, keeps track of which clients each one controls, and
//! routes requests. Workers implement [`ServiceWorker`] and react to the
//! events it dispatches.

mod event;
mod host;
mod interceptor;
mod state;

pub use event::{ActivateEvent, FetchEvent, InstallEvent, PushEvent};
pub use host::Registration;
pub use interceptor::{CacheInterceptor, CacheSettings};

/// Event handlers of a worker.
///
/// Handlers run synchronously; async work must be handed to the event with
/// `wait_until` or `respond_with`, or the host will not wait for it.
pub trait ServiceWorker: Send + Sync {
  /// Version tag used in logs and for client bookkeeping.
  fn version(&self) -> &str;

  fn on_install(&self, event: &mut InstallEvent);

  fn on_activate(&self, event: &mut ActivateEvent);

  /// Leaving the event without a response lets the request through to the
  /// network untouched.
  fn on_fetch(&self, _event: &mut FetchEvent) {}

  fn on_push(&self, _event: &mut PushEvent) {}
}

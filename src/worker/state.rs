use std::fmt;

/// Worker lifecycle states.
///
/// `Parsed -> Installing -> Installed -> Activating -> Activated`, with
/// `Redundant` reachable from any state once the worker is replaced, fails to
/// install, or is unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Registered, nothing dispatched yet
  Parsed,
  /// Install event dispatched, work pending
  Installing,
  /// Installed and waiting to take over
  Installed,
  /// Activate event dispatched, work pending
  Activating,
  /// Controlling clients and intercepting fetches
  Activated,
  /// Replaced or unregistered
  Redundant,
}

impl WorkerState {
  /// Fetch events are only dispatched to activated workers.
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, WorkerState::Activated)
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

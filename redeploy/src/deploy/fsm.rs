//! Finite State Machine for the update sequence

use serde::{Deserialize, Serialize};

/// Sequencer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    /// Nothing done yet
    Idle,

    /// Checking the deployment is installed and taking the lock
    Validating,

    /// Writing the backup
    BackingUp,

    /// Service stopped, nothing changed yet
    Stopped,

    /// Fetching the remote revision
    Fetching,

    /// Moving the working tree to the fetched revision
    Applying,

    /// Refreshing the dependency environment
    Installing,

    /// Replacing the code directory with the backup copy
    RollingBack,

    /// Service started again
    Started,

    /// Service confirmed live
    Verified,

    /// Terminal failure
    Failed,
}

/// Sequencer event
#[derive(Debug, Clone)]
pub enum SequencerEvent {
    /// Begin validation
    Validate,

    /// Preconditions hold
    Validated,

    /// Backup written and service stopped
    ServiceStopped,

    /// Begin fetching
    Fetch,

    /// Remote differs from local, apply it
    Apply,

    /// Revision applied, refresh dependencies
    Install,

    /// Something failed after mutation started, restore the backup
    RollBack,

    /// Start the service, whatever state the code is in
    Restart,

    /// Liveness check passed
    Verify,

    /// Terminal error
    Fail(String),
}

/// Sequencer FSM
#[derive(Debug, Clone)]
pub struct SequencerFsm {
    state: SequencerState,
    error: Option<String>,
    history: Vec<SequencerState>,
    restore_mode: bool,
}

impl SequencerFsm {
    /// FSM for an update attempt
    pub fn new() -> Self {
        Self {
            state: SequencerState::Idle,
            error: None,
            history: vec![SequencerState::Idle],
            restore_mode: false,
        }
    }

    /// FSM for a manual restore: no backup, no fetch; stop, restore, restart
    pub fn for_restore() -> Self {
        Self {
            restore_mode: true,
            ..Self::new()
        }
    }

    /// Get current state
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every state entered so far, starting with `Idle`
    pub fn history(&self) -> &[SequencerState] {
        &self.history
    }

    /// Whether `state` was entered at any point
    pub fn visited(&self, state: SequencerState) -> bool {
        self.history.contains(&state)
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: SequencerEvent) -> Result<SequencerState, String> {
        use SequencerEvent as E;
        use SequencerState as S;

        let new_state = match (self.state, &event) {
            (S::Idle, E::Validate) => S::Validating,

            (S::Validating, E::Validated) if !self.restore_mode => S::BackingUp,
            (S::Validating, E::ServiceStopped) if self.restore_mode => S::Stopped,
            // Restore could not stop the service: leave the code alone, start it again
            (S::Validating, E::Restart) if self.restore_mode => S::Started,

            (S::BackingUp, E::ServiceStopped) => S::Stopped,
            // Stop failed: nothing was changed, bring the service back
            (S::BackingUp, E::Restart) => S::Started,

            (S::Stopped, E::Fetch) if !self.restore_mode => S::Fetching,
            (S::Stopped, E::RollBack) if self.restore_mode => S::RollingBack,
            (S::Stopped, E::Restart) if self.restore_mode => S::Started,

            (S::Fetching, E::Apply) => S::Applying,
            // Up to date, or fetch failed
            (S::Fetching, E::Restart) => S::Started,

            (S::Applying, E::Install) => S::Installing,
            (S::Applying, E::RollBack) => S::RollingBack,

            (S::Installing, E::Restart) => S::Started,
            (S::Installing, E::RollBack) => S::RollingBack,

            (S::RollingBack, E::Restart) => S::Started,

            (S::Started, E::Verify) => S::Verified,

            (S::Validating | S::BackingUp | S::Started, E::Fail(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        self.history.push(new_state);
        Ok(new_state)
    }

    /// Whether the run has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SequencerState::Verified | SequencerState::Failed)
    }
}

impl Default for SequencerFsm {
    fn default() -> Self {
        Self::new()
    }
}

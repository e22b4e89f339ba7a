//! Engine operating states.

/// Operating states of the build/execute engine.
///
/// `Idle` is the initial state. There is no terminal state in normal
/// operation; a forced shutdown drives the engine back to `Idle` behind
/// the one-way shutdown latch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    /// Nothing bound, nothing running.
    Idle,
    /// A build is wanted but the generator is owned elsewhere.
    WaitingToBuild,
    /// The generator is translating on our behalf.
    Building,
    /// A fresh artifact is bound and loadable.
    BuildReady,
    /// The model is executing.
    Running,
    /// Termination was requested; waiting for the runtime to confirm.
    Aborting,
    /// A pause was requested; waiting for the runtime to confirm.
    Pausing,
    /// The model is halted at a safe point.
    Paused,
}

impl ExecState {
    /// A loaded model is live exactly in these states.
    pub fn has_model(&self) -> bool {
        matches!(
            self,
            ExecState::Running | ExecState::Pausing | ExecState::Paused | ExecState::Aborting
        )
    }

    /// States in which a build or run is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, ExecState::Idle | ExecState::BuildReady)
    }

    /// States from which a new run request can be taken directly.
    pub fn accepts_run(&self) -> bool {
        matches!(self, ExecState::Idle | ExecState::BuildReady)
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecState::Idle => "idle",
            ExecState::WaitingToBuild => "waiting-to-build",
            ExecState::Building => "building",
            ExecState::BuildReady => "build-ready",
            ExecState::Running => "running",
            ExecState::Aborting => "aborting",
            ExecState::Pausing => "pausing",
            ExecState::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_states_match_activity() {
        for state in [
            ExecState::Idle,
            ExecState::WaitingToBuild,
            ExecState::Building,
            ExecState::BuildReady,
            ExecState::Running,
            ExecState::Aborting,
            ExecState::Pausing,
            ExecState::Paused,
        ] {
            if state.has_model() {
                assert!(state.is_active(), "{} has a model but is not active", state);
            }
            assert_eq!(state.accepts_run(), !state.is_active());
        }
    }
}

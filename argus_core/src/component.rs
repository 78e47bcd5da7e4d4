//! Uniform component lifecycle.
//!
//! Every vision component moves through the same three states and gates
//! its operations identically: a failed validation leaves the state where
//! it was, and nothing advances the state as a side effect.

use log::debug;

use crate::error::{ArgusError, ArgusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Constructed; no backend resources held.
    Initial,
    /// Configured, session acquired, kernel handles live.
    Ready,
    /// Accepting execute calls.
    Running,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ComponentState::Initial => "Initial",
            ComponentState::Ready => "Ready",
            ComponentState::Running => "Running",
        };
        f.write_str(name)
    }
}

/// State holder embedded in each component instance.
#[derive(Debug)]
pub struct ComponentCore {
    name: &'static str,
    state: ComponentState,
}

impl ComponentCore {
    pub fn new(name: &'static str) -> Self {
        ComponentCore {
            name,
            state: ComponentState::Initial,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    /// Gate an operation on the current state.
    pub fn ensure(&self, allowed: &[ComponentState]) -> ArgusResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ArgusError::bad_state(format!(
                "{}: operation requires {:?}, component is {}",
                self.name, allowed, self.state
            )))
        }
    }

    pub fn set_state(&mut self, next: ComponentState) {
        debug!("{}: {} -> {next}", self.name, self.state);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gating_reports_state_in_error() {
        let mut core = ComponentCore::new("demo");
        assert_eq!(core.state(), ComponentState::Initial);
        assert!(core.ensure(&[ComponentState::Initial]).is_ok());

        let err = core.ensure(&[ComponentState::Running]).unwrap_err();
        assert!(matches!(err, ArgusError::BadState(_)));
        // Failed gate leaves the state alone.
        assert_eq!(core.state(), ComponentState::Initial);

        core.set_state(ComponentState::Ready);
        assert!(core
            .ensure(&[ComponentState::Ready, ComponentState::Running])
            .is_ok());
    }
}

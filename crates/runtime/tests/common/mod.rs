//! Shared test doubles: a scripted command runner and a scripted prober.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use vaulthost_runtime::types::ExternalToolError;
use vaulthost_runtime::{CapabilityProber, CommandRunner, ExecOutput, SystemState};

fn render(program: &str, args: &[&str]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Records every command and replays queued responses per command line,
/// sticking to the last response once a queue drains. Unscripted commands
/// succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    pub probes: Mutex<Vec<String>>,
    pub applied: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, (VecDeque<ExecOutput>, Option<ExecOutput>)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, command: &str, output: ExecOutput) {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .0
            .push_back(output);
    }

    pub fn applied_commands(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn clear_applied(&self) {
        self.applied.lock().unwrap().clear();
    }

    fn next_response(&self, rendered: &str) -> ExecOutput {
        let mut responses = self.responses.lock().unwrap();
        if let Some((queue, last)) = responses.get_mut(rendered) {
            if let Some(out) = queue.pop_front() {
                *last = Some(out.clone());
                return out;
            }
            if let Some(out) = last {
                return out.clone();
            }
        }
        ExecOutput::success("")
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        let rendered = render(program, args);
        self.probes.lock().unwrap().push(rendered.clone());
        Ok(self.next_response(&rendered))
    }

    async fn apply(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        let rendered = render(program, args);
        self.applied.lock().unwrap().push(rendered.clone());
        Ok(self.next_response(&rendered))
    }
}

/// Replays a queue of snapshots, sticking to the last once drained.
pub struct FakeProber {
    states: Mutex<VecDeque<SystemState>>,
    last: Mutex<SystemState>,
}

impl FakeProber {
    pub fn new(states: Vec<SystemState>) -> Self {
        let last = states.last().cloned().unwrap_or_default();
        Self {
            states: Mutex::new(states.into()),
            last: Mutex::new(last),
        }
    }
}

#[async_trait]
impl CapabilityProber for FakeProber {
    async fn probe(&self) -> SystemState {
        let mut states = self.states.lock().unwrap();
        match states.pop_front() {
            Some(state) => {
                *self.last.lock().unwrap() = state.clone();
                state
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

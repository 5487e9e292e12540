use std::collections::VecDeque;
use std::time::Duration;

use crate::error::ToolError;
use crate::process::{ToolOutput, ToolSession};

/// Session with canned responses, so classification and repair flows can be
/// exercised without the external tool installed. Executed commands are
/// recorded for assertions.
pub(crate) struct ScriptedSession {
    responses: VecDeque<ToolOutput>,
    pub commands: Vec<Vec<String>>,
}

impl ScriptedSession {
    pub fn new(responses: impl IntoIterator<Item = ToolOutput>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
            commands: Vec::new(),
        }
    }

    pub fn stdout(text: &str) -> ToolOutput {
        ToolOutput {
            stdout: text.to_string(),
            stderr: String::new(),
        }
    }

    pub fn stderr(text: &str) -> ToolOutput {
        ToolOutput {
            stdout: String::new(),
            stderr: text.to_string(),
        }
    }

    pub fn output(stdout: &str, stderr: &str) -> ToolOutput {
        ToolOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

impl ToolSession for ScriptedSession {
    fn execute(&mut self, args: &[String], _timeout: Duration) -> Result<ToolOutput, ToolError> {
        self.commands.push(args.to_vec());
        self.responses.pop_front().ok_or(ToolError::ProcessDead {
            detail: "scripted session has no responses left".to_string(),
        })
    }
}

//! Scorer that runs an external program per request.
//!
//! The request JSON is passed as the last argument and the response JSON is
//! read from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RiskError, RiskResult};
use crate::scorer::RiskScorer;
use crate::wire::{RiskRequest, RiskResponse};

/// External-process risk scorer.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    program: String,
    args: Vec<String>,
}

impl CommandScorer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line such as
    /// `python3 fraud_detector.py`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl RiskScorer for CommandScorer {
    fn name(&self) -> &str {
        &self.program
    }

    async fn score(&self, request: &RiskRequest) -> RiskResult<RiskResponse> {
        let payload = serde_json::to_string(request)
            .map_err(|e| RiskError::Transport(format!("encode request: {}", e)))?;

        // kill_on_drop reaps the child when the gate's timeout drops this future.
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RiskError::Transport(format!("spawn {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RiskError::Transport(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(program = %self.program, bytes = output.stdout.len(), "Scorer responded");
        serde_json::from_str(stdout.trim())
            .map_err(|e| RiskError::Malformed(format!("unparsable scorer output: {}", e)))
    }
}

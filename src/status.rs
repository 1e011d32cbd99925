//! Run results: one [`CaseResult`] per case, folded into a [`TestStatus`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::orchestrator::CaseOutcome;

/// Message attached to cases that failed because a shim exited with an error.
pub const FAILED_MESSAGE: &str = "Failed";
/// Message attached to cases that hit the case timeout.
pub const TIMED_OUT_MESSAGE: &str = "timed out";

/// The result of running one test case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub name: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CaseOutcome,
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        self.outcome.passed()
    }

    /// The failure report for this case, or `None` if it passed.
    pub fn failure(&self) -> Option<FailureReport> {
        if self.passed() {
            return None;
        }
        let message = if self.outcome.timed_out {
            TIMED_OUT_MESSAGE
        } else {
            FAILED_MESSAGE
        };
        Some(FailureReport {
            test_case: self.name.clone(),
            client_error: self.outcome.client_error().map(str::to_string),
            server_error: self.outcome.server_error().map(str::to_string),
            message: message.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub test_case: String,
    pub client_error: Option<String>,
    pub server_error: Option<String>,
    pub message: String,
}

/// Totals across a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestStatus {
    pub ran: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<FailureReport>,
}

impl TestStatus {
    pub fn record(&mut self, result: &CaseResult) {
        self.ran += 1;
        match result.failure() {
            None => self.succeeded += 1,
            Some(report) => {
                self.failed += 1;
                self.failures.push(report);
            }
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

//! Human-readable run output.

use crate::status::{FailureReport, TestStatus};

/// One line per failed case, printed as the case finishes.
pub fn format_failure(report: &FailureReport) -> String {
    let mut line = format!("FAILED: {}", report.test_case);

    let mut details = Vec::new();
    if let Some(e) = &report.client_error {
        details.push(format!("client: {}", e));
    }
    if let Some(e) = &report.server_error {
        details.push(format!("server: {}", e));
    }
    if details.is_empty() {
        details.push(report.message.clone());
    }
    line.push_str(&format!(" ({})", details.join(", ")));

    line
}

/// Final summary line.
pub fn format_summary(status: &TestStatus) -> String {
    format!(
        "Ran={} Success={} Failure={}",
        status.ran, status.succeeded, status.failed
    )
}

//! Test case runner: runs cases one at a time and folds their results.

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{HarnessOptions, ShimConfig, TestCase};
use crate::endpoint::{Endpoint, HarnessError};
use crate::orchestrator;
use crate::status::{CaseResult, TestStatus};

/// Runs test cases against one pair of shims.
pub struct Harness {
    shims: ShimConfig,
    options: HarnessOptions,
}

impl Harness {
    pub fn new(shims: ShimConfig, options: HarnessOptions) -> Self {
        Self { shims, options }
    }

    /// Run one case to a verdict.
    ///
    /// Returns `Err` only when the harness could not run the case at all
    /// (socket, spawn, or server announcement problems). A shim that exits
    /// with an error is a failed case, not an error.
    pub async fn run_case(&self, case: &TestCase) -> Result<CaseResult, HarnessError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("case", name = case.name.as_str(), %run_id);
        self.run_case_inner(case, run_id).instrument(span).await
    }

    async fn run_case_inner(&self, case: &TestCase, run_id: Uuid) -> Result<CaseResult, HarnessError> {
        info!("running test case");
        let started_at = Utc::now();

        let client = Endpoint::client(&self.shims.client, &case.client_args, &self.options).await?;
        let server = match Endpoint::server(&self.shims.server, &case.server_args, &self.options).await
        {
            Ok(server) => server,
            Err(e) => {
                client.shutdown().await;
                return Err(e);
            }
        };

        let outcome = orchestrator::run(client, server, &self.options).await;
        let result = CaseResult {
            name: case.name.clone(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
        };

        if result.passed() {
            info!("test case passed");
        } else {
            warn!(
                client_error = result.outcome.client_error(),
                server_error = result.outcome.server_error(),
                timed_out = result.outcome.timed_out,
                "test case failed"
            );
        }
        Ok(result)
    }

    /// Run `cases` in order, calling `on_result` after each one.
    ///
    /// Stops at the first harness error without running the remaining cases.
    pub async fn run_all<F>(&self, cases: &[TestCase], mut on_result: F) -> Result<TestStatus, HarnessError>
    where
        F: FnMut(&CaseResult),
    {
        let mut status = TestStatus::default();
        for case in cases {
            let result = self.run_case(case).await?;
            status.record(&result);
            on_result(&result);
        }
        info!(
            ran = status.ran,
            succeeded = status.succeeded,
            failed = status.failed,
            "test run complete"
        );
        Ok(status)
    }
}

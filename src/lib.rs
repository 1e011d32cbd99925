//! shimrunner -- interop test harness for datagram protocol implementations.
//!
//! Runs a client shim and a server shim as subprocesses, relays UDP
//! datagrams between them, and judges each test case by the shims' exit
//! status alone.

pub mod config;
pub mod endpoint;
pub mod events;
pub mod orchestrator;
pub mod relay;
pub mod report;
pub mod runner;
pub mod status;

pub use config::{HarnessOptions, Implementation, ShimConfig, TestCase, TestCases};
pub use endpoint::HarnessError;
pub use runner::Harness;
pub use status::{CaseResult, FailureReport, TestStatus};

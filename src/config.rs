//! Shim and test-case configuration for the interop harness.
//!
//! Two files drive a run: the shim file names the client and server
//! implementations, and the cases file lists the scenarios to run against
//! them. Both are accepted as JSON or TOML, chosen by file extension.
//! [`HarnessOptions`] carries the knobs that are not part of either file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ---------------------------------------------------------------------------
// Shims
// ---------------------------------------------------------------------------

/// One implementation under test: an executable plus the arguments it is
/// always invoked with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    #[serde(alias = "Path")]
    pub path: PathBuf,
    #[serde(default, alias = "Args")]
    pub args: Vec<String>,
}

/// The client and server implementations shared by every test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimConfig {
    #[serde(alias = "Client")]
    pub client: Implementation,
    #[serde(alias = "Server")]
    pub server: Implementation,
}

impl ShimConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_file(path)?;
        info!(
            path = %path.display(),
            client = %config.client.path.display(),
            server = %config.server.path.display(),
            "loaded shim configuration"
        );
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Test cases
// ---------------------------------------------------------------------------

/// A named scenario: extra arguments for each side on top of the shim's own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "ClientArgs")]
    pub client_args: Vec<String>,
    #[serde(default, alias = "ServerArgs")]
    pub server_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCases {
    #[serde(default, alias = "Cases")]
    pub cases: Vec<TestCase>,
}

impl TestCases {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cases: Self = load_file(path)?;
        info!(path = %path.display(), count = cases.cases.len(), "loaded test cases");
        Ok(cases)
    }

    /// Keep only the cases whose name contains `pattern`.
    pub fn filtered(self, pattern: Option<&str>) -> Self {
        match pattern {
            None => self,
            Some(p) => Self {
                cases: self
                    .cases
                    .into_iter()
                    .filter(|c| c.name.contains(p))
                    .collect(),
            },
        }
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    if is_toml {
        debug!(path = %path.display(), "decoding as TOML");
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    } else {
        debug!(path = %path.display(), "decoding as JSON");
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness options
// ---------------------------------------------------------------------------

/// Runtime knobs for endpoint setup, relaying, and case supervision.
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Host the relay sockets bind to (port is always OS-assigned). `::`
    /// binds dual-stack so `localhost` works whichever family it resolves
    /// to.
    pub bind_host: String,
    /// Host written into the `-addr` argument and used to resolve the
    /// server's announced port.
    pub advertise_host: String,
    /// How long to wait for the server's port announcement.
    pub startup_timeout: Duration,
    /// Upper bound on a single case. `None` waits indefinitely.
    pub case_timeout: Option<Duration>,
    /// Pause after a failed socket read before retrying.
    pub read_error_backoff: Duration,
    /// Consecutive read failures after which a relay direction gives up.
    pub max_consecutive_read_errors: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            bind_host: "::".to_string(),
            advertise_host: "localhost".to_string(),
            startup_timeout: Duration::from_secs(10),
            case_timeout: Some(Duration::from_secs(60)),
            read_error_backoff: Duration::from_millis(10),
            max_consecutive_read_errors: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("create temp file");
        file.write_all(content.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn test_shims_json_capitalised_keys() {
        let file = write_temp(
            ".json",
            r#"{
                "Client": {"Path": "/usr/bin/client", "Args": ["-v"]},
                "Server": {"Path": "/usr/bin/server"}
            }"#,
        );
        let shims = ShimConfig::load(file.path()).expect("load shims");
        assert_eq!(shims.client.path, PathBuf::from("/usr/bin/client"));
        assert_eq!(shims.client.args, vec!["-v".to_string()]);
        assert!(shims.server.args.is_empty());
    }

    #[test]
    fn test_cases_json_snake_case_keys() {
        let file = write_temp(
            ".json",
            r#"{"cases": [
                {"name": "basic", "client_args": ["-x"], "server_args": []},
                {"name": "resume"}
            ]}"#,
        );
        let cases = TestCases::load(file.path()).expect("load cases");
        assert_eq!(cases.cases.len(), 2);
        assert_eq!(cases.cases[0].client_args, vec!["-x".to_string()]);
        assert!(cases.cases[1].server_args.is_empty());
    }

    #[test]
    fn test_cases_toml() {
        let file = write_temp(
            ".toml",
            r#"
            [[cases]]
            name = "handshake"
            client_args = ["-mode", "handshake"]

            [[cases]]
            name = "zero-rtt"
            server_args = ["-0rtt"]
            "#,
        );
        let cases = TestCases::load(file.path()).expect("load cases");
        assert_eq!(cases.cases[0].name, "handshake");
        assert_eq!(cases.cases[1].server_args, vec!["-0rtt".to_string()]);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = ShimConfig::load(Path::new("/nonexistent/shims.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        let file = write_temp(".json", "{ not json");
        let err = TestCases::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));
    }

    #[test]
    fn test_filter_by_name() {
        let cases = TestCases {
            cases: vec![
                TestCase {
                    name: "loss-10".into(),
                    client_args: vec![],
                    server_args: vec![],
                },
                TestCase {
                    name: "basic".into(),
                    client_args: vec![],
                    server_args: vec![],
                },
            ],
        };
        let kept = cases.clone().filtered(Some("loss"));
        assert_eq!(kept.cases.len(), 1);
        assert_eq!(kept.cases[0].name, "loss-10");
        assert_eq!(cases.clone().filtered(None), cases);
    }
}

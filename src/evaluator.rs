//! # Evaluator
//!
//! ## Responsibility
//! Score one candidate for one cascade stage. [`Evaluator`] is the capability
//! interface; [`CommandEvaluator`] runs an external program per call.
//!
//! ## Guarantees
//! - Timeout-safe: a [`CommandEvaluator`] child is killed when its timeout
//!   expires (the child is spawned with `kill_on_drop`)
//! - Output-captured: stderr is returned as the `stderr` artifact
//! - Typed failures: timeouts, crashes, non-zero exits and malformed output
//!   each map to their own [`EvaluationError`] variant
//!
//! ## NOT Responsible For
//! - Sandboxing untrusted code (the configured program's concern)
//! - Stage ordering and thresholds (see: `cascade`)

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::config::StageConfig;

/// Failure of one evaluator invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// The call did not return within the stage timeout.
    #[error("timeout")]
    Timeout,

    /// The evaluator could not run or died abnormally.
    #[error("crashed: {0}")]
    Crashed(String),

    /// The evaluator exited unsuccessfully.
    #[error("non-zero exit ({code}): {stderr}")]
    NonZeroExit {
        /// Exit status code.
        code: i32,
        /// Trailing stderr output.
        stderr: String,
    },

    /// The evaluator's output could not be parsed.
    #[error("malformed output: {0}")]
    MalformedOutput(String),
}

/// What an evaluator reports for one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationOutput {
    /// Metric name to value. Must contain `score` when `valid`.
    pub metrics: BTreeMap<String, f64>,
    /// Named byte payloads (logs, traces).
    pub artifacts: BTreeMap<String, Vec<u8>>,
    /// Whether the candidate is acceptable at this stage.
    pub valid: bool,
    /// Why the candidate is invalid, if it is.
    pub failure_reason: Option<String>,
}

impl EvaluationOutput {
    /// A valid result carrying `metrics`.
    pub fn valid(metrics: BTreeMap<String, f64>) -> Self {
        Self {
            metrics,
            valid: true,
            ..Self::default()
        }
    }

    /// An invalid result with a reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Capability interface for scoring candidates.
///
/// Implementations must be thread-safe (Send + Sync); the controller holds
/// them as `Arc<dyn Evaluator>` and calls them from several workers at once.
/// The cascade driver enforces `timeout` independently, so an implementation
/// that ignores it still cannot stall the loop.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate `source` for stage `stage` (0-based) configured by `config`.
    async fn evaluate(
        &self,
        source: &str,
        stage: usize,
        config: &StageConfig,
        timeout: Duration,
    ) -> Result<EvaluationOutput, EvaluationError>;
}

// ============================================================================
// Command Evaluator
// ============================================================================

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Deserialize)]
struct StructuredReport {
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    artifacts: BTreeMap<String, String>,
    #[serde(default = "default_valid")]
    valid: bool,
    #[serde(default)]
    failure_reason: Option<String>,
}

fn default_valid() -> bool {
    true
}

/// Runs an external program once per stage.
///
/// The candidate is written to a temporary file whose path is appended as
/// the last argument. The child sees:
///
/// - `EVOLVE_STAGE_INDEX`: 0-based stage index
/// - `EVOLVE_STAGE_NAME`: stage name
/// - `EVOLVE_PARAM_<KEY>`: each stage param, key upper-cased
///
/// It must print either a flat JSON object of metrics or
/// `{"metrics": {...}, "artifacts": {...}, "valid": bool, "failure_reason": str}`
/// on stdout. If the whole of stdout is not JSON, the last non-empty line is
/// tried, so evaluators may log before reporting.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: PathBuf,
    args: Vec<String>,
    suffix: String,
}

impl CommandEvaluator {
    /// Run `program` with no extra arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            suffix: ".txt".to_string(),
        }
    }

    /// Arguments placed before the candidate path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// File suffix for the candidate file (e.g. `.py`).
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    fn write_candidate(&self, source: &str) -> Result<tempfile::NamedTempFile, EvaluationError> {
        let mut file = tempfile::Builder::new()
            .prefix("candidate-")
            .suffix(&self.suffix)
            .tempfile()
            .map_err(|e| EvaluationError::Crashed(format!("temp file: {e}")))?;
        file.write_all(source.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| EvaluationError::Crashed(format!("temp file: {e}")))?;
        Ok(file)
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(
        &self,
        source: &str,
        stage: usize,
        config: &StageConfig,
        timeout: Duration,
    ) -> Result<EvaluationOutput, EvaluationError> {
        let file = self.write_candidate(source)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(file.path())
            .env("EVOLVE_STAGE_INDEX", stage.to_string())
            .env("EVOLVE_STAGE_NAME", &config.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.params {
            command.env(format!("EVOLVE_PARAM_{}", key.to_uppercase()), value);
        }

        let child = command.spawn().map_err(|e| {
            EvaluationError::Crashed(format!("failed to spawn {}: {e}", self.program.display()))
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(EvaluationError::Crashed(format!("process error: {e}"))),
            Err(_) => return Err(EvaluationError::Timeout),
        };

        if !output.status.success() {
            let stderr = tail(&output.stderr, STDERR_TAIL_BYTES);
            return Err(match output.status.code() {
                Some(code) => EvaluationError::NonZeroExit { code, stderr },
                None => EvaluationError::Crashed(format!("terminated by signal: {stderr}")),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut result = parse_report(&stdout)?;
        if !output.stderr.is_empty() {
            result.artifacts.insert("stderr".to_string(), output.stderr);
        }
        Ok(result)
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

/// Parse evaluator stdout in either the structured or the flat format.
///
/// # Errors
///
/// Returns [`EvaluationError::MalformedOutput`] if neither the whole text nor
/// its last non-empty line is a JSON object in a supported format.
pub fn parse_report(stdout: &str) -> Result<EvaluationOutput, EvaluationError> {
    let whole = stdout.trim();
    let last_line = whole.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    let value: serde_json::Value = serde_json::from_str(whole)
        .or_else(|_| serde_json::from_str(last_line.trim()))
        .map_err(|e| EvaluationError::MalformedOutput(format!("not JSON: {e}")))?;

    if value.get("metrics").is_some() {
        let report: StructuredReport = serde_json::from_value(value)
            .map_err(|e| EvaluationError::MalformedOutput(e.to_string()))?;
        return Ok(EvaluationOutput {
            metrics: report.metrics,
            artifacts: report
                .artifacts
                .into_iter()
                .map(|(k, v)| (k, v.into_bytes()))
                .collect(),
            valid: report.valid,
            failure_reason: report.failure_reason,
        });
    }

    let metrics: BTreeMap<String, f64> = serde_json::from_value(value)
        .map_err(|e| EvaluationError::MalformedOutput(e.to_string()))?;
    Ok(EvaluationOutput::valid(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> StageConfig {
        StageConfig::new(name, None)
    }

    fn shell(script: &str) -> CommandEvaluator {
        CommandEvaluator::new("sh").with_args(["-c", script, "sh"])
    }

    #[test]
    fn test_parse_flat_metrics() {
        let out = parse_report(r#"{"score": 0.5, "speed": 2.0}"#).unwrap();
        assert!(out.valid);
        assert_eq!(out.metrics.get("speed"), Some(&2.0));
    }

    #[test]
    fn test_parse_structured_report() {
        let out = parse_report(
            r#"{"metrics": {"score": 0.1}, "artifacts": {"log": "hi"}, "valid": false, "failure_reason": "wrong answer"}"#,
        )
        .unwrap();
        assert!(!out.valid);
        assert_eq!(out.failure_reason.as_deref(), Some("wrong answer"));
        assert_eq!(out.artifacts.get("log"), Some(&b"hi".to_vec()));
    }

    #[test]
    fn test_parse_uses_last_line_after_logs() {
        let out = parse_report("compiling...\nrunning...\n{\"score\": 0.9}\n").unwrap();
        assert_eq!(out.metrics.get("score"), Some(&0.9));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_report("hello"), Err(EvaluationError::MalformedOutput(_))));
        assert!(matches!(parse_report("[1, 2]"), Err(EvaluationError::MalformedOutput(_))));
    }

    #[test]
    fn test_timeout_displays_as_reason() {
        assert_eq!(EvaluationError::Timeout.to_string(), "timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reads_candidate_file() {
        let eval = shell(r#"printf '{"score": %s}' "$(cat "$1")""#);
        let out = eval
            .evaluate("0.25", 0, &stage("full"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.metrics.get("score"), Some(&0.25));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_sees_stage_env() {
        let eval = shell(
            r#"printf '{"metrics": {"score": %s}, "failure_reason": "%s-%s"}' "$EVOLVE_STAGE_INDEX" "$EVOLVE_STAGE_NAME" "$EVOLVE_PARAM_MODE""#,
        );
        let mut config = stage("quick");
        config.params.insert("mode".to_string(), "fast".to_string());
        let out = eval
            .evaluate("x", 2, &config, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.metrics.get("score"), Some(&2.0));
        assert_eq!(out.failure_reason.as_deref(), Some("quick-fast"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_captures_stderr_artifact() {
        let eval = shell(r#"echo warn >&2; echo '{"score": 1}'"#);
        let out = eval
            .evaluate("x", 0, &stage("full"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.artifacts.get("stderr"), Some(&b"warn\n".to_vec()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_non_zero_exit() {
        let eval = shell("echo oops >&2; exit 3");
        let err = eval
            .evaluate("x", 0, &stage("full"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EvaluationError::NonZeroExit {
                code: 3,
                stderr: "oops".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_malformed_output() {
        let eval = shell("echo hello");
        let err = eval
            .evaluate("x", 0, &stage("full"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::MalformedOutput(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout_kills_child() {
        let eval = shell("sleep 5");
        let started = std::time::Instant::now();
        let err = eval
            .evaluate("x", 0, &stage("full"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, EvaluationError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_command_missing_binary_is_crash() {
        let eval = CommandEvaluator::new("nonexistent-evaluator-12345");
        let err = eval
            .evaluate("x", 0, &stage("full"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::Crashed(ref m) if m.contains("nonexistent-evaluator-12345")));
    }
}

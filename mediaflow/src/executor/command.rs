//! Stage units backed by external commands.
//!
//! The request is written to the child's stdin as JSON; the child prints its
//! output document on stdout and diagnostics on stderr. Stderr lines of the
//! form `progress: <fraction>` are forwarded to the progress sink.

use super::unit::{AsyncStageUnit, StageUnit, UnitProgress, UnitRequest};
use crate::config::EngineSettings;
use crate::core::{StageId, StageMap};
use crate::errors::UnitFailure;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Stderr lines starting with this prefix report a completion fraction
/// (`progress: 0.4`) instead of being captured as diagnostics.
pub const PROGRESS_PREFIX: &str = "progress:";

/// How long a timed-out command's stderr reader may keep draining.
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// How to run one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-stage timeout; overrides the unit's default.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

impl CommandSpec {
    /// A spec running `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_seconds: None,
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// Which command runs which stage.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    specs: StageMap<Option<CommandSpec>>,
}

impl CommandTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `spec` to `stage`.
    #[must_use]
    pub fn with(mut self, stage: StageId, spec: CommandSpec) -> Self {
        self.specs[stage] = Some(spec);
        self
    }

    /// The command configured for `stage`.
    #[must_use]
    pub fn get(&self, stage: StageId) -> Option<&CommandSpec> {
        self.specs[stage].as_ref()
    }
}

/// Runs stages as child processes, blocking or async.
#[derive(Debug, Clone, Default)]
pub struct CommandUnit {
    table: CommandTable,
    default_timeout: Option<Duration>,
}

impl CommandUnit {
    /// A unit dispatching through `table`.
    #[must_use]
    pub fn new(table: CommandTable) -> Self {
        Self {
            table,
            default_timeout: None,
        }
    }

    /// A unit whose default timeout comes from `settings.stage_timeout_seconds`.
    #[must_use]
    pub fn from_settings(table: CommandTable, settings: &EngineSettings) -> Self {
        Self::new(table).with_default_timeout(settings.stage_timeout())
    }

    /// Timeout for stages whose spec sets none.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn prepare(
        &self,
        request: &UnitRequest,
    ) -> Result<(&CommandSpec, Vec<u8>, Option<Duration>), UnitFailure> {
        let spec = self.table.get(request.stage).ok_or_else(|| {
            let message = format!("no command configured for stage '{}'", request.stage);
            UnitFailure::exited(None, message)
        })?;
        let payload = serde_json::to_vec(request)
            .map_err(|e| UnitFailure::exited(None, format!("cannot encode request: {e}")))?;
        let timeout = spec
            .timeout_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
            .or(self.default_timeout);
        Ok((spec, payload, timeout))
    }
}

fn parse_stdout(stdout: &[u8], stderr: String) -> Result<Value, UnitFailure> {
    serde_json::from_slice(stdout).map_err(|e| {
        let mut message = format!("stdout is not a JSON document: {e}");
        if !stderr.trim().is_empty() {
            message.push('\n');
            message.push_str(stderr.trim());
        }
        UnitFailure::exited(Some(0), message)
    })
}

/// Parses a `progress: <fraction>` stderr line.
fn progress_fraction(line: &str) -> Option<f64> {
    line.trim()
        .strip_prefix(PROGRESS_PREFIX)?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|fraction| fraction.is_finite())
}

/// Routes one stderr line to the progress sink or the diagnostics log.
fn record_stderr_line(line: &[u8], log: &mut String, progress: &dyn Fn(f64)) {
    let text = String::from_utf8_lossy(line);
    match progress_fraction(&text) {
        Some(fraction) => progress(fraction),
        None => log.push_str(&text),
    }
}

impl StageUnit for CommandUnit {
    fn invoke(
        &self,
        request: &UnitRequest,
        progress: &UnitProgress<'_>,
    ) -> Result<Value, UnitFailure> {
        let (spec, payload, timeout) = self.prepare(request)?;
        debug!(stage = %request.stage, program = %spec.program, "Spawning stage command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if request.workdir.is_dir() {
            command.current_dir(&request.workdir);
        }

        let mut child = command.spawn().map_err(|e| {
            UnitFailure::exited(None, format!("failed to start '{}': {e}", spec.program))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&payload);
            }
        });
        let stdout_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_end(&mut buf);
            }
            buf
        });
        let log = Arc::new(Mutex::new(String::new()));
        let (fractions_tx, fractions) = mpsc::channel::<f64>();
        let stderr_reader = {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                let Some(err) = stderr else { return };
                let mut reader = BufReader::new(err);
                let mut line = Vec::new();
                while matches!(reader.read_until(b'\n', &mut line), Ok(n) if n > 0) {
                    let send = |fraction: f64| {
                        let _ = fractions_tx.send(fraction);
                    };
                    record_stderr_line(&line, &mut log.lock(), &send);
                    line.clear();
                }
            })
        };

        let start = Instant::now();
        let status = loop {
            fractions.try_iter().for_each(progress);
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if timeout.is_some_and(|limit| start.elapsed() > limit) {
                        warn!(stage = %request.stage, "Stage command timed out, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        // Readers stay detached: a grandchild may still hold the pipes.
                        let grace = Instant::now();
                        while !stderr_reader.is_finished() && grace.elapsed() < STDERR_GRACE {
                            thread::sleep(Duration::from_millis(5));
                        }
                        fractions.try_iter().for_each(progress);
                        let captured = log.lock().clone();
                        return Err(UnitFailure::timeout(captured));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    let _ = child.kill();
                    let message = format!("failed to wait for child: {e}");
                    return Err(UnitFailure::exited(None, message));
                }
            }
        };

        let _ = writer.join();
        let stdout = stdout_reader.join().unwrap_or_default();
        let _ = stderr_reader.join();
        fractions.try_iter().for_each(progress);
        let stderr = std::mem::take(&mut *log.lock());

        if !status.success() {
            return Err(UnitFailure::exited(status.code(), stderr));
        }
        parse_stdout(&stdout, stderr)
    }
}

#[async_trait]
impl AsyncStageUnit for CommandUnit {
    async fn invoke(
        &self,
        request: &UnitRequest,
        progress: &UnitProgress<'_>,
    ) -> Result<Value, UnitFailure> {
        let (spec, payload, timeout) = self.prepare(request)?;
        debug!(stage = %request.stage, program = %spec.program, "Spawning stage command");

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if request.workdir.is_dir() {
            command.current_dir(&request.workdir);
        }

        let mut child = command.spawn().map_err(|e| {
            UnitFailure::exited(None, format!("failed to start '{}': {e}", spec.program))
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut out = Vec::new();
        let mut log = String::new();
        let run = async {
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    let _ = stdin.write_all(&payload).await;
                }
            };
            let read_out = async {
                if let Some(mut stdout) = stdout {
                    let _ = stdout.read_to_end(&mut out).await;
                }
            };
            let read_err = async {
                let Some(stderr) = stderr else { return };
                let mut reader = tokio::io::BufReader::new(stderr);
                let mut line = Vec::new();
                while matches!(reader.read_until(b'\n', &mut line).await, Ok(n) if n > 0) {
                    record_stderr_line(&line, &mut log, progress);
                    line.clear();
                }
            };
            let ((), (), (), status) = tokio::join!(feed, read_out, read_err, child.wait());
            status
        };

        let status = match timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, run).await;
                match waited {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(stage = %request.stage, "Stage command timed out, killing");
                        let _ = child.start_kill();
                        return Err(UnitFailure::timeout(log));
                    }
                }
            }
            None => run.await,
        }
        .map_err(|e| UnitFailure::exited(None, format!("failed to wait for child: {e}")))?;

        if !status.success() {
            return Err(UnitFailure::exited(status.code(), log));
        }
        parse_stdout(&out, log)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    fn ignore(_: f64) {}

    fn request(dir: &TempDir, stage: StageId) -> UnitRequest {
        UnitRequest {
            stage,
            workdir: dir.path().to_path_buf(),
            input: Value::Null,
            params: json!({"model": "base"}),
        }
    }

    #[test]
    fn test_echoes_request_through_stdin() {
        let dir = TempDir::new().unwrap();
        let unit = CommandUnit::new(CommandTable::new().with(StageId::Fetch, sh("cat")));

        let output = StageUnit::invoke(&unit, &request(&dir, StageId::Fetch), &ignore).unwrap();
        assert_eq!(output["stage"], "fetch");
        assert_eq!(output["params"]["model"], "base");
    }

    #[test]
    fn test_nonzero_exit_captures_stderr() {
        let dir = TempDir::new().unwrap();
        let unit = CommandUnit::new(
            CommandTable::new().with(StageId::Transcribe, sh("echo 'no audio' >&2; exit 3")),
        );

        let failure =
            StageUnit::invoke(&unit, &request(&dir, StageId::Transcribe), &ignore).unwrap_err();
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(failure.stderr.trim(), "no audio");
        assert!(!failure.timed_out);
    }

    #[test]
    fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let unit = CommandUnit::new(
            CommandTable::new().with(StageId::Align, sh("exec sleep 5").with_timeout(0.2)),
        );

        let start = Instant::now();
        let failure =
            StageUnit::invoke(&unit, &request(&dir, StageId::Align), &ignore).unwrap_err();
        assert!(failure.timed_out);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_keeps_stderr_captured_before_kill() {
        let dir = TempDir::new().unwrap();
        let script = "echo 'loading model' >&2; echo 'progress: 0.5' >&2; exec sleep 5";
        let unit = CommandUnit::new(
            CommandTable::new().with(StageId::Transcribe, sh(script).with_timeout(0.5)),
        );
        let seen = Mutex::new(Vec::new());
        let sink = |fraction: f64| seen.lock().push(fraction);

        let failure = StageUnit::invoke(&unit, &request(&dir, StageId::Transcribe), &sink)
            .unwrap_err();
        assert!(failure.timed_out);
        assert!(failure.stderr.contains("loading model"));
        assert!(!failure.stderr.contains(PROGRESS_PREFIX));
        assert_eq!(*seen.lock(), vec![0.5]);
    }

    #[test]
    fn test_progress_lines_reach_the_sink() {
        let dir = TempDir::new().unwrap();
        let script = "cat; echo 'progress: 0.25' >&2; echo warming >&2; echo 'progress: 1' >&2";
        let unit = CommandUnit::new(CommandTable::new().with(StageId::Align, sh(script)));
        let seen = Mutex::new(Vec::new());
        let sink = |fraction: f64| seen.lock().push(fraction);

        let output = StageUnit::invoke(&unit, &request(&dir, StageId::Align), &sink).unwrap();
        assert_eq!(output["stage"], "align");
        assert_eq!(*seen.lock(), vec![0.25, 1.0]);
    }

    #[test]
    fn test_progress_fraction_parsing() {
        assert_eq!(progress_fraction("progress: 0.4\n"), Some(0.4));
        assert_eq!(progress_fraction("progress:1"), Some(1.0));
        assert_eq!(progress_fraction("progress: NaN"), None);
        assert_eq!(progress_fraction("progress: half"), None);
        assert_eq!(progress_fraction("made progress: 0.4"), None);
    }

    #[test]
    fn test_from_settings_applies_stage_timeout() {
        let dir = TempDir::new().unwrap();
        let settings = EngineSettings::default().with_stage_timeout(0.2);
        let unit = CommandUnit::from_settings(
            CommandTable::new().with(StageId::Restore, sh("exec sleep 5")),
            &settings,
        );

        let start = Instant::now();
        let failure = StageUnit::invoke(&unit, &request(&dir, StageId::Restore), &ignore)
            .unwrap_err();
        assert!(failure.timed_out);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_command_and_bad_json() {
        let dir = TempDir::new().unwrap();
        let unit = CommandUnit::new(CommandTable::new().with(StageId::Export, sh("echo not-json")));

        let missing =
            StageUnit::invoke(&unit, &request(&dir, StageId::Publish), &ignore).unwrap_err();
        assert!(missing.stderr.contains("no command configured"));

        let bad =
            StageUnit::invoke(&unit, &request(&dir, StageId::Export), &ignore).unwrap_err();
        assert!(bad.stderr.contains("not a JSON document"));
    }

    #[tokio::test]
    async fn test_async_invoke_and_timeout() {
        let dir = TempDir::new().unwrap();
        let unit = CommandUnit::new(
            CommandTable::new()
                .with(StageId::Analyze, sh("cat"))
                .with(StageId::Export, sh("exec sleep 5")),
        )
        .with_default_timeout(Some(Duration::from_millis(200)));

        let output = AsyncStageUnit::invoke(&unit, &request(&dir, StageId::Analyze), &ignore)
            .await
            .unwrap();
        assert_eq!(output["stage"], "analyze");

        let failure = AsyncStageUnit::invoke(&unit, &request(&dir, StageId::Export), &ignore)
            .await
            .unwrap_err();
        assert!(failure.timed_out);
    }

    #[tokio::test]
    async fn test_async_progress_and_partial_stderr() {
        let dir = TempDir::new().unwrap();
        let unit = CommandUnit::new(
            CommandTable::new()
                .with(StageId::Diarize, sh("cat; echo 'progress: 0.5' >&2"))
                .with(
                    StageId::Restore,
                    sh("echo 'denoising' >&2; exec sleep 5").with_timeout(0.5),
                ),
        );
        let seen = Mutex::new(Vec::new());
        let sink = |fraction: f64| seen.lock().push(fraction);

        let output = AsyncStageUnit::invoke(&unit, &request(&dir, StageId::Diarize), &sink)
            .await
            .unwrap();
        assert_eq!(output["stage"], "diarize");
        assert_eq!(*seen.lock(), vec![0.5]);

        let failure = AsyncStageUnit::invoke(&unit, &request(&dir, StageId::Restore), &ignore)
            .await
            .unwrap_err();
        assert!(failure.timed_out);
        assert_eq!(failure.stderr.trim(), "denoising");
    }

    #[tokio::test]
    async fn test_async_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let unit = CommandUnit::new(CommandTable::new().with(StageId::Publish, sh("exit 7")));

        let failure = AsyncStageUnit::invoke(&unit, &request(&dir, StageId::Publish), &ignore)
            .await
            .unwrap_err();
        assert_eq!(failure.exit_code, Some(7));
    }
}

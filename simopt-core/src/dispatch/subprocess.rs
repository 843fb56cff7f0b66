use super::output::{OutputFormat, parse_output};
use super::{DispatchError, Dispatcher, RunContext};
use crate::result::SimulationResult;
use crate::space::ParameterVector;
use std::io::Read;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How often the wait loop polls the child for exit, cancellation and the
/// deadline.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The executable invocation of a subprocess model.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandSpec {
    /// A shell-interpreted command string, run via `sh -c`.
    Shell(String),
    /// An argv list run directly; formatted parameter fragments are appended
    /// as additional arguments.
    Argv(Vec<String>),
}

/// Configuration for the subprocess dispatch backend.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub command: CommandSpec,
    /// Template expanded once per parameter with `{name}` and `{value}`
    /// placeholders; fragments are joined with single spaces.
    pub param_format: String,
    pub output_format: OutputFormat,
    /// When set, the subprocess is expected to write its result here; the
    /// file is read and then deleted. When unset, stdout is parsed.
    pub output_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables layered over the current environment.
    pub env: Vec<(String, String)>,
}

impl SubprocessConfig {
    pub fn new(command: CommandSpec, output_format: OutputFormat) -> Self {
        Self {
            command,
            param_format: "--{name} {value}".to_string(),
            output_format,
            output_file: None,
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_param_format(mut self, template: &str) -> Self {
        self.param_format = template.to_string();
        self
    }

    pub fn with_output_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_working_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.working_dir = Some(path.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

/// Dispatch backend that runs the simulation as a child process and parses
/// its stdout or a named output file.
pub struct SubprocessDispatcher {
    config: SubprocessConfig,
}

impl SubprocessDispatcher {
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    /// Expand the parameter template for every parameter, in lexicographic
    /// name order.
    fn format_parameters(&self, parameters: &ParameterVector) -> Vec<String> {
        parameters
            .iter()
            .map(|(name, value)| {
                self.config
                    .param_format
                    .replace("{name}", name)
                    .replace("{value}", &value.to_string())
            })
            .collect()
    }

    fn build_command(&self, parameters: &ParameterVector) -> Command {
        let fragments = self.format_parameters(parameters);

        let mut command = match &self.config.command {
            CommandSpec::Shell(line) => {
                let mut full = line.clone();
                for fragment in &fragments {
                    full.push(' ');
                    full.push_str(fragment);
                }
                let mut command = Command::new("sh");
                command.arg("-c").arg(full);
                command
            }
            CommandSpec::Argv(argv) => {
                let mut command = Command::new(&argv[0]);
                command.args(&argv[1..]);
                for fragment in &fragments {
                    command.args(fragment.split_whitespace());
                }
                command
            }
        };

        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        // The child leads its own process group so a deadline or cancel can
        // terminate every descendant of a shell command, not just the shell.
        #[cfg(unix)]
        command.process_group(0);

        command
    }

    /// Wait for the child subject to the context's deadline and cancellation,
    /// killing it when either fires.
    fn wait(&self, child: &mut Child, ctx: &RunContext) -> Result<std::process::ExitStatus, DispatchError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    kill_child(child);
                    return Err(DispatchError::SpawnFailed(e.to_string()));
                }
            }

            if ctx.cancel.is_cancelled() {
                debug!("cancelling subprocess {}", child.id());
                kill_child(child);
                return Err(DispatchError::Cancelled);
            }
            if ctx.expired() {
                debug!("subprocess {} exceeded its deadline", child.id());
                kill_child(child);
                return Err(DispatchError::Timeout);
            }

            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

/// Terminate the child's whole process group, then reap the child so it does
/// not linger as a zombie.
fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child was spawned as its own group leader, so its pid is also
        // the pgid. Signalling the negated pgid reaches every descendant.
        let group = -(child.id() as i32);
        if unsafe { libc::kill(group, libc::SIGKILL) } != 0 {
            // Group already gone, or the signal failed: fall back to the
            // direct child.
            if let Err(e) = child.kill() {
                warn!("failed to kill subprocess {}: {e}", child.id());
            }
        }
    }
    #[cfg(not(unix))]
    if let Err(e) = child.kill() {
        warn!("failed to kill subprocess {}: {e}", child.id());
    }

    let _ = child.wait();
}

/// Drain a pipe on a dedicated thread so a chatty child cannot dead-lock
/// against a full pipe buffer while the parent polls for exit.
fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buffer);
        }
        buffer
    })
}

impl Dispatcher for SubprocessDispatcher {
    fn run(
        &self,
        parameters: &ParameterVector,
        ctx: &RunContext,
    ) -> Result<SimulationResult, DispatchError> {
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        if matches!(&self.config.command, CommandSpec::Argv(argv) if argv.is_empty()) {
            return Err(DispatchError::SpawnFailed("empty argv".to_string()));
        }

        let mut command = self.build_command(parameters);
        debug!("spawning simulation: {command:?}");

        let mut child = command
            .spawn()
            .map_err(|e| DispatchError::SpawnFailed(e.to_string()))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait(&mut child, ctx)?;

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(DispatchError::ExitNonZero {
                status: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        let raw = match &self.config.output_file {
            None => stdout,
            Some(path) => {
                let contents = std::fs::read(path).map_err(|e| {
                    DispatchError::ParseFailed(format!(
                        "could not read output file `{}`: {e}",
                        path.display()
                    ))
                })?;
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("could not remove output file `{}`: {e}", path.display());
                }
                contents
            }
        };

        let (table, kpis) = parse_output(self.config.output_format, &raw)
            .map_err(DispatchError::ParseFailed)?;

        let mut result = SimulationResult::new(table, parameters.clone());
        result.kpis = kpis;
        result
            .metadata
            .insert("exit_status".to_string(), status.code().unwrap_or(0).to_string());

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CancelToken;
    use crate::space::ParameterValue;
    use float_cmp::assert_approx_eq;
    use std::time::Instant;

    fn params() -> ParameterVector {
        let mut v = ParameterVector::new();
        v.insert("beta".to_string(), ParameterValue::F64(0.25));
        v.insert("steps".to_string(), ParameterValue::Int(3));
        v.insert("verbose".to_string(), ParameterValue::Bool(false));
        v.insert("mode".to_string(), ParameterValue::Str("fast".to_string()));
        v
    }

    #[test]
    fn test_parameter_formatting() {
        let config = SubprocessConfig::new(CommandSpec::Shell("true".to_string()), OutputFormat::Csv)
            .with_param_format("{name}={value}");
        let dispatcher = SubprocessDispatcher::new(config);

        let fragments = dispatcher.format_parameters(&params());
        assert_eq!(
            fragments,
            vec!["beta=0.25", "mode=fast", "steps=3", "verbose=false"]
        );
    }

    #[test]
    fn test_stdout_csv_round_trip() {
        // Ignore the parameter fragments; emit a fixed CSV document.
        let config = SubprocessConfig::new(
            CommandSpec::Shell("printf 't,I\\n0,10\\n1,50\\n' #".to_string()),
            OutputFormat::Csv,
        );
        let dispatcher = SubprocessDispatcher::new(config);

        let result = dispatcher.run(&params(), &RunContext::default()).unwrap();
        assert_eq!(result.parameters, params());
        assert_approx_eq!(f64, result.time_series.column("I").unwrap()[1], 50.0);
    }

    #[test]
    fn test_argv_receives_parameter_fragments() {
        // `printf '%s\n'` echoes each argument on its own line; with a
        // header-only template the output is a one-column CSV of values.
        let config = SubprocessConfig::new(
            CommandSpec::Argv(vec!["printf".to_string(), "%s\\n".to_string(), "value".to_string()]),
            OutputFormat::Csv,
        )
        .with_param_format("{value}");
        let dispatcher = SubprocessDispatcher::new(config);

        let mut v = ParameterVector::new();
        v.insert("x".to_string(), ParameterValue::Int(7));

        let result = dispatcher.run(&v, &RunContext::default()).unwrap();
        assert_eq!(result.time_series.column_names(), &["value"]);
        assert_approx_eq!(f64, result.time_series.column("value").unwrap()[0], 7.0);
    }

    #[test]
    fn test_exit_nonzero_captures_stderr() {
        let config = SubprocessConfig::new(
            CommandSpec::Shell("echo boom >&2; exit 3 #".to_string()),
            OutputFormat::Csv,
        );
        let dispatcher = SubprocessDispatcher::new(config);

        let err = dispatcher.run(&params(), &RunContext::default()).unwrap_err();
        assert_eq!(
            err,
            DispatchError::ExitNonZero {
                status: 3,
                stderr: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_timeout_kills_the_child() {
        let config =
            SubprocessConfig::new(CommandSpec::Shell("sleep 10 #".to_string()), OutputFormat::Csv);
        let dispatcher = SubprocessDispatcher::new(config);

        let start = Instant::now();
        let ctx = RunContext::new(Some(Duration::from_millis(100)), CancelToken::new(), 1);
        let err = dispatcher.run(&params(), &ctx).unwrap_err();

        assert_eq!(err, DispatchError::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");

        // The shell backgrounds a subshell and waits on it; killing only the
        // shell would leave the subshell alive to create the marker.
        let config = SubprocessConfig::new(
            CommandSpec::Shell(format!("(sleep 1; touch {}) & wait #", marker.display())),
            OutputFormat::Csv,
        );
        let dispatcher = SubprocessDispatcher::new(config);

        let ctx = RunContext::new(Some(Duration::from_millis(100)), CancelToken::new(), 1);
        let err = dispatcher.run(&params(), &ctx).unwrap_err();
        assert_eq!(err, DispatchError::Timeout);

        thread::sleep(Duration::from_millis(1400));
        assert!(!marker.exists());
    }

    #[test]
    fn test_cancellation_kills_the_child() {
        let config =
            SubprocessConfig::new(CommandSpec::Shell("sleep 10 #".to_string()), OutputFormat::Csv);
        let dispatcher = SubprocessDispatcher::new(config);

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let ctx = RunContext::new(None, cancel, 1);
        let err = dispatcher.run(&params(), &ctx).unwrap_err();
        handle.join().unwrap();

        assert_eq!(err, DispatchError::Cancelled);
    }

    #[test]
    fn test_spawn_failure() {
        let config = SubprocessConfig::new(
            CommandSpec::Argv(vec!["/nonexistent/simulator".to_string()]),
            OutputFormat::Csv,
        );
        let dispatcher = SubprocessDispatcher::new(config);

        let err = dispatcher.run(&params(), &RunContext::default()).unwrap_err();
        assert!(matches!(err, DispatchError::SpawnFailed(_)));
    }

    #[test]
    fn test_output_file_is_read_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");

        let config = SubprocessConfig::new(
            CommandSpec::Shell(format!(
                "printf '{{\"time_series\": [{{\"I\": 42.0}}]}}' > {} #",
                path.display()
            )),
            OutputFormat::Json,
        )
        .with_output_file(&path);
        let dispatcher = SubprocessDispatcher::new(config);

        let result = dispatcher.run(&params(), &RunContext::default()).unwrap();
        assert_approx_eq!(f64, result.time_series.column("I").unwrap()[0], 42.0);
        assert!(!path.exists());
    }

    #[test]
    fn test_unparseable_output_is_parse_failed() {
        let config = SubprocessConfig::new(
            CommandSpec::Shell("printf 'not json' #".to_string()),
            OutputFormat::Json,
        );
        let dispatcher = SubprocessDispatcher::new(config);

        let err = dispatcher.run(&params(), &RunContext::default()).unwrap_err();
        assert!(matches!(err, DispatchError::ParseFailed(_)));
    }
}

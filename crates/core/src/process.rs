use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::ToolError;

const PROGRAM: &str = "exiftool";

/// Install locations probed when the tool is not on PATH.
const WELL_KNOWN_LOCATIONS: &[&str] = &[
    "/usr/bin/exiftool",
    "/usr/local/bin/exiftool",
    "/opt/homebrew/bin/exiftool",
    "/opt/local/bin/exiftool",
];

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_PAUSE: Duration = Duration::from_millis(200);
const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Dead,
}

/// Captured streams of one completed command.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// One command round-trip against a metadata tool session.
///
/// The probe, repair, and metadata layers depend on this seam rather than on
/// the concrete process so tests can script sessions with canned output.
pub trait ToolSession {
    fn execute(&mut self, args: &[String], timeout: Duration) -> Result<ToolOutput, ToolError>;
}

/// One long-lived tool process driven over stdin/stdout in its
/// persistent-session mode (`-stay_open True -@ -`).
///
/// Exclusive ownership is the in-flight lock: the pool hands the process to
/// exactly one caller at a time and `execute` takes `&mut self`, so a second
/// command cannot start while one is outstanding.
pub struct ExifToolProcess {
    executable: PathBuf,
    state: ProcessState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout_lines: Option<Receiver<String>>,
    stderr_lines: Option<Receiver<String>>,
    readers: Vec<JoinHandle<()>>,
    commands_issued: u64,
    stop_wait: Duration,
}

impl ExifToolProcess {
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            state: ProcessState::Stopped,
            child: None,
            stdin: None,
            stdout_lines: None,
            stderr_lines: None,
            readers: Vec::new(),
            commands_issued: 0,
            stop_wait: DEFAULT_STOP_WAIT,
        }
    }

    /// Bounds the graceful wait in `stop` before the process is killed.
    pub fn with_stop_wait(mut self, stop_wait: Duration) -> Self {
        self.stop_wait = stop_wait;
        self
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Total commands issued over the life of this instance, restarts included.
    pub fn commands_issued(&self) -> u64 {
        self.commands_issued
    }

    /// Spawns the tool in persistent-session mode and confirms it answers a
    /// version query. Fatal for this instance if the executable cannot be
    /// launched.
    pub fn start(&mut self) -> Result<(), ToolError> {
        if self.state == ProcessState::Running {
            return Ok(());
        }
        self.state = ProcessState::Starting;

        let mut child = Command::new(&self.executable)
            .args(["-stay_open", "True", "-@", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                self.state = ProcessState::Stopped;
                ToolError::Spawn {
                    program: self.executable.display().to_string(),
                    source,
                }
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            self.state = ProcessState::Stopped;
            return Err(ToolError::Spawn {
                program: self.executable.display().to_string(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "stdio pipes were not captured"),
            });
        };

        let (stdout_tx, stdout_rx) = crossbeam_channel::unbounded();
        let (stderr_tx, stderr_rx) = crossbeam_channel::unbounded();
        self.readers
            .push(thread::spawn(move || forward_lines(stdout, stdout_tx)));
        self.readers
            .push(thread::spawn(move || forward_lines(stderr, stderr_tx)));

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.stdout_lines = Some(stdout_rx);
        self.stderr_lines = Some(stderr_rx);
        self.state = ProcessState::Running;

        // A session that launches but never answers is as dead as one that
        // failed to spawn.
        match self.execute(&["-ver".to_string()], STARTUP_TIMEOUT) {
            Ok(output) => {
                debug!(version = %output.stdout.trim(), "tool session started");
                Ok(())
            }
            Err(error) => {
                self.stop();
                Err(error)
            }
        }
    }

    /// Session-close, bounded wait, then forced kill. Always clears the
    /// process handle so a stale one can never be reused.
    pub fn stop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"-stay_open\nFalse\n");
            let _ = stdin.flush();
            // Dropping stdin closes the pipe, a second exit nudge.
        }
        if let Some(mut child) = self.child.take() {
            if !wait_with_deadline(&mut child, self.stop_wait) {
                warn!("tool session ignored close request; killing");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        self.stdout_lines = None;
        self.stderr_lines = None;
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        self.state = ProcessState::Stopped;
    }

    pub fn restart(&mut self) -> Result<(), ToolError> {
        info!(commands = self.commands_issued, "restarting tool session");
        self.stop();
        thread::sleep(RESTART_PAUSE);
        self.start()
    }
}

impl ToolSession for ExifToolProcess {
    /// Writes `args` plus a numbered execute marker, then reads stdout until
    /// the matching ready sentinel. On timeout or a vanished process the
    /// session is marked Dead and is restarted before its next use.
    fn execute(&mut self, args: &[String], timeout: Duration) -> Result<ToolOutput, ToolError> {
        match self.state {
            ProcessState::Running | ProcessState::Starting => {}
            ProcessState::Dead => self.restart()?,
            ProcessState::Stopped => self.start()?,
        }

        self.commands_issued += 1;
        let sequence = self.commands_issued;
        let ready_marker = format!("{{ready{sequence}}}");
        let stderr_marker = format!("{{stderr{sequence}}}");

        let mut payload = String::new();
        for arg in args {
            payload.push_str(arg);
            payload.push('\n');
        }
        // -echo4 emits its text to stderr once the command has run, giving
        // the stderr stream its own end-of-command sentinel.
        payload.push_str("-echo4\n");
        payload.push_str(&stderr_marker);
        payload.push('\n');
        payload.push_str(&format!("-execute{sequence}\n"));

        debug!(sequence, args = args.len(), "dispatching tool command");
        let stdin = self.stdin.as_mut().ok_or_else(|| ToolError::ProcessDead {
            detail: "input pipe is gone".to_string(),
        })?;
        if let Err(source) = stdin
            .write_all(payload.as_bytes())
            .and_then(|_| stdin.flush())
        {
            self.state = ProcessState::Dead;
            return Err(ToolError::ProcessDead {
                detail: format!("could not write command: {source}"),
            });
        }

        let stdout_rx = self.stdout_lines.clone().ok_or_else(|| ToolError::ProcessDead {
            detail: "output pipe is gone".to_string(),
        })?;
        let stderr_rx = self.stderr_lines.clone().ok_or_else(|| ToolError::ProcessDead {
            detail: "error pipe is gone".to_string(),
        })?;

        let deadline = Instant::now() + timeout;
        let mut stdout = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.state = ProcessState::Dead;
                return Err(ToolError::Timeout { timeout });
            }
            match stdout_rx.recv_timeout(remaining) {
                Ok(line) if line.contains(&ready_marker) => break,
                Ok(line) => {
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.state = ProcessState::Dead;
                    return Err(ToolError::Timeout { timeout });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.state = ProcessState::Dead;
                    return Err(ToolError::ProcessDead {
                        detail: "output stream closed mid-command".to_string(),
                    });
                }
            }
        }

        let mut stderr = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // stdout completed; a lost stderr sentinel degrades the
                // diagnostics, not the command.
                warn!(sequence, "stderr sentinel did not arrive in time");
                break;
            }
            match stderr_rx.recv_timeout(remaining) {
                Ok(line) if line.contains(&stderr_marker) => break,
                Ok(line) => {
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
                Err(_) => break,
            }
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

impl Drop for ExifToolProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop();
        }
    }
}

fn forward_lines<R: Read>(stream: R, lines: Sender<String>) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if lines.send(line).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn wait_with_deadline(child: &mut Child, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(_) => return false,
        }
    }
}

/// Resolves the tool executable: explicit override, then PATH, then
/// well-known install locations.
pub fn locate_executable(explicit: Option<&Path>) -> Result<PathBuf, ToolError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ToolError::Spawn {
            program: path.display().to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "explicit tool path does not exist"),
        });
    }

    if let Some(path_var) = env::var_os("PATH") {
        for dir in env::split_paths(&path_var) {
            for name in [PROGRAM, "exiftool.exe"] {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }

    for location in WELL_KNOWN_LOCATIONS {
        let candidate = PathBuf::from(location);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(ToolError::Spawn {
        program: PROGRAM.to_string(),
        source: io::Error::new(
            io::ErrorKind::NotFound,
            "not found on PATH or in well-known install locations",
        ),
    })
}

/// Writes one path per line to a temp file the tool reads via `-@`. Paths go
/// through a file rather than the command line to dodge argument-length
/// limits and keep the encoding UTF-8 regardless of platform. The file is
/// removed when the returned handle drops, on every exit path.
pub(crate) fn write_arg_file(paths: &[PathBuf]) -> Result<NamedTempFile, ToolError> {
    let mut file = tempfile::Builder::new()
        .prefix("capture-aligner-args-")
        .suffix(".txt")
        .tempfile()?;
    for path in paths {
        writeln!(file, "{}", path.display())?;
    }
    file.flush()?;
    Ok(file)
}

/// Standard trailer for commands that target paths through an arg file.
pub(crate) fn path_list_args(arg_file: &NamedTempFile) -> Vec<String> {
    vec![
        "-charset".to_string(),
        "filename=utf8".to_string(),
        "-@".to_string(),
        arg_file.path().display().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{locate_executable, path_list_args, write_arg_file};
    use crate::error::ToolError;

    #[test]
    fn locates_explicit_executable() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let tool = dir.path().join("exiftool");
        fs::write(&tool, "#!/bin/sh\n").expect("write stub");

        let located = locate_executable(Some(&tool)).expect("explicit path accepted");
        assert_eq!(located, tool);
    }

    #[test]
    fn missing_explicit_executable_is_a_spawn_error() {
        let error = locate_executable(Some(&PathBuf::from("/nonexistent/exiftool")))
            .expect_err("missing path rejected");
        assert!(matches!(error, ToolError::Spawn { .. }));
    }

    #[test]
    fn arg_file_lists_one_path_per_line_and_cleans_up() {
        let paths = vec![PathBuf::from("/photos/å.jpg"), PathBuf::from("/photos/b.jpg")];
        let file = write_arg_file(&paths).expect("arg file");
        let on_disk = file.path().to_path_buf();

        let contents = fs::read_to_string(&on_disk).expect("read back");
        assert_eq!(contents, "/photos/å.jpg\n/photos/b.jpg\n");

        let trailer = path_list_args(&file);
        assert_eq!(trailer[0], "-charset");
        assert_eq!(trailer[3], on_disk.display().to_string());

        drop(file);
        assert!(!on_disk.exists(), "temp arg file removed on drop");
    }
}

//! Evaluator that runs an external interpreter once per expression.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use schmeep::{EvalError, Evaluator};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs `program args...` with the expression on stdin; stdout is the result.
///
/// A non-zero exit is an evaluation error carrying stderr. Interrupt sends
/// SIGINT to the running child on unix and kills it elsewhere.
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
    /// The child is reaped only while this lock is held.
    running: Mutex<Option<Child>>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Child>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Poll the running child until it exits, then release it.
    fn wait_running(&self) -> io::Result<ExitStatus> {
        loop {
            {
                let mut running = self.running();
                let Some(child) = running.as_mut() else {
                    return Err(io::Error::other("interpreter handle lost"));
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *running = None;
                        return Ok(status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        *running = None;
                        return Err(e);
                    }
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> io::Result<Vec<u8>> {
    match reader {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("pipe reader panicked"))),
        None => Ok(Vec::new()),
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, expression: &str) -> Result<String, EvalError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EvalError::failed(format!("failed to run {}: {e}", self.program)))?;

        // Feed stdin and drain the pipes on their own threads so a chatty
        // child can't deadlock us.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = expression.as_bytes().to_vec();
            std::thread::spawn(move || stdin.write_all(&input))
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let pid = child.id();
        *self.running() = Some(child);
        tracing::debug!(pid, program = %self.program, "Interpreter started");

        let status = self.wait_running();

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
                    tracing::warn!(error = %e, "Failed to write expression to interpreter");
                }
                Err(_) => tracing::warn!("Interpreter stdin writer panicked"),
                _ => {}
            }
        }

        let status = status.map_err(|e| EvalError::failed(format!("interpreter failed: {e}")))?;
        let stdout = collect(stdout)
            .map_err(|e| EvalError::failed(format!("failed to read interpreter output: {e}")))?;
        let stderr = collect(stderr).unwrap_or_default();

        let stdout = String::from_utf8_lossy(&stdout);
        let result = stdout.strip_suffix('\n').unwrap_or(&stdout).to_string();

        if status.success() {
            Ok(result)
        } else {
            let stderr = String::from_utf8_lossy(&stderr);
            let detail = stderr.trim();
            let message = match (detail.is_empty(), result.is_empty()) {
                (false, _) => format!("{detail} ({status})"),
                (true, false) => format!("{result} ({status})"),
                (true, true) => format!("interpreter {status}"),
            };
            Err(EvalError::failed(message))
        }
    }

    fn interrupt(&self) -> Result<Option<String>, EvalError> {
        let mut running = self.running();
        let Some(child) = running.as_mut() else {
            tracing::debug!("Interrupt with no evaluation running");
            return Ok(None);
        };

        // An exited child has either been reaped here or is a zombie whose
        // pid is still reserved, so the signal can't reach another process.
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "Interrupt after interpreter exited");
                return Ok(None);
            }
            Ok(None) => {}
            Err(e) => {
                return Err(EvalError::failed(format!("failed to check interpreter: {e}")));
            }
        }

        send_interrupt(child)?;
        tracing::info!(pid = child.id(), "Sent interrupt to interpreter");
        Ok(None)
    }
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) -> Result<(), EvalError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = child.id();
    let pid = i32::try_from(pid).map_err(|_| EvalError::failed(format!("invalid pid {pid}")))?;
    kill(Pid::from_raw(pid), Signal::SIGINT)
        .map_err(|e| EvalError::failed(format!("failed to interrupt interpreter: {e}")))
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) -> Result<(), EvalError> {
    child
        .kill()
        .map_err(|e| EvalError::failed(format!("failed to interrupt interpreter: {e}")))
}

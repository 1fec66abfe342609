//! Isolated-worker backend.
//!
//! Each trial executes inside a worker drawn from a fixed-size pool of
//! separate OS processes. The wire protocol is line-delimited JSON over the
//! worker's stdin/stdout, and it carries only plain data: a registry key, a
//! parameter map, and the storage root. Code never crosses the boundary.
//!
//! The host binary opts into worker mode by calling [`worker_main`] when
//! [`WORKER_ENV`] is set, typically first thing in `main`:
//!
//! ```no_run
//! use trialtrack::runner::process::{self, worker_main};
//! use trialtrack::ComputationRegistry;
//!
//! let registry = ComputationRegistry::new();
//! // registry.register(...);
//! if std::env::var_os(process::WORKER_ENV).is_some() {
//!     worker_main(&registry).unwrap();
//!     return;
//! }
//! ```
//!
//! A worker process dying outright, or a garbled frame, surfaces as
//! [`Error::WorkerFailure`], a transport-level failure class, never folded
//! into a recorded computation failure (those are persisted in the trial
//! manifest and reported as successful worker responses).

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::resumable::ComputationRegistry;
use crate::runner::{InplaceRunner, Runner};
use crate::storage::FsStore;
use crate::trial::{ParamMap, Trial};
use crate::{Error, Result};

/// Environment variable marking a spawned process as a pool worker.
pub const WORKER_ENV: &str = "TRIALTRACK_WORKER";

/// One frame from the pool to a worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Execute a registry-resolved computation as a trial.
    Run {
        /// Trial id.
        tid: String,
        /// Registry key of the computation.
        computation: String,
        /// Plain parameter map.
        params: ParamMap,
        /// Storage root the worker should write under.
        root: PathBuf,
    },
    /// Drain and exit the worker loop.
    Shutdown,
}

/// One frame from a worker back to the pool.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// The trial reached a terminal status (including a recorded failure).
    Done {
        /// Trial id, echoed back.
        tid: String,
    },
    /// The run raised an execution-level error (config mismatch, hook
    /// failure, storage failure, unknown computation).
    Failed {
        /// Error text to re-raise on the caller's side.
        message: String,
    },
}

/// Serve the worker side of the protocol until a `Shutdown` frame or EOF.
///
/// Generic over the streams so the loop is testable in-memory; production
/// callers use [`worker_main`].
///
/// # Errors
/// Returns [`Error::Io`] only for faults on the transport itself; per-request
/// errors are answered as `Failed` frames and the loop continues.
pub fn worker_loop(
    registry: &ComputationRegistry,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Err(e) => WorkerResponse::Failed {
                message: format!("bad request frame: {e}"),
            },
            Ok(WorkerRequest::Shutdown) => {
                debug!("worker shutting down");
                return Ok(());
            }
            Ok(WorkerRequest::Run {
                tid,
                computation,
                params,
                root,
            }) => {
                debug!(%tid, computation, "worker executing trial");
                let runner = InplaceRunner::new(root);
                match registry.create(&computation).and_then(|mut c| {
                    runner.run_computation(&tid, c.as_mut(), params).map(|_| ())
                }) {
                    Ok(()) => WorkerResponse::Done { tid },
                    Err(e) => WorkerResponse::Failed {
                        message: e.to_string(),
                    },
                }
            }
        };
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(())
}

/// Run the worker loop over this process's stdin/stdout.
///
/// # Errors
/// Returns [`Error::Io`] on transport faults.
pub fn worker_main(registry: &ComputationRegistry) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    worker_loop(registry, stdin.lock(), stdout.lock())
}

struct Worker {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl Worker {
    fn spawn(program: &PathBuf, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = Some(
            child
                .stdin
                .take()
                .ok_or_else(|| Error::WorkerFailure("worker stdin unavailable".to_string()))?,
        );
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| Error::WorkerFailure("worker stdout unavailable".to_string()))?;
        debug!(pid = child.id(), "spawned worker");
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    fn dispatch(&mut self, request: &WorkerRequest) -> Result<WorkerResponse> {
        let frame = serde_json::to_string(request)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::WorkerFailure("worker stdin already closed".to_string()))?;
        stdin
            .write_all(frame.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .map_err(|e| Error::WorkerFailure(format!("worker pipe closed: {e}")))?;

        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| Error::WorkerFailure(format!("worker read failed: {e}")))?;
        if read == 0 {
            return Err(Error::WorkerFailure(
                "worker process died before responding".to_string(),
            ));
        }
        serde_json::from_str(&line)
            .map_err(|e| Error::WorkerFailure(format!("bad response frame: {e}")))
    }

    fn shutdown(mut self) {
        if let (Ok(frame), Some(stdin)) = (
            serde_json::to_string(&WorkerRequest::Shutdown),
            self.stdin.as_mut(),
        ) {
            let _ = stdin.write_all(frame.as_bytes());
            let _ = stdin.write_all(b"\n");
            let _ = stdin.flush();
        }
        // Dropping stdin delivers EOF so even a worker stuck before the
        // shutdown frame can exit.
        self.stdin.take();
        let _ = self.child.wait();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Execution backend running each trial inside a pooled worker process.
///
/// The caller blocks until a worker is free and again until that worker
/// finishes the trial. There is no per-trial timeout; a stuck computation
/// occupies its worker indefinitely.
pub struct ProcessRunner {
    root: PathBuf,
    program: PathBuf,
    args: Vec<String>,
    idle: Mutex<Vec<Worker>>,
    available: Condvar,
    closed: AtomicBool,
}

impl ProcessRunner {
    /// Spawn a pool of `processes` workers running the current executable
    /// in worker mode, storing trials under `root`.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the executable path cannot be resolved or a
    /// worker fails to spawn.
    pub fn new(root: impl Into<PathBuf>, processes: usize) -> Result<Self> {
        let program = std::env::current_exe()?;
        Self::with_program(root, processes, program, Vec::new())
    }

    /// Spawn a pool running an explicit program with arguments. The program
    /// must serve the worker protocol on stdin/stdout (see [`worker_main`]).
    ///
    /// # Errors
    /// Returns [`Error::Io`] if a worker fails to spawn.
    pub fn with_program(
        root: impl Into<PathBuf>,
        processes: usize,
        program: PathBuf,
        args: Vec<String>,
    ) -> Result<Self> {
        let processes = processes.max(1);
        let mut workers = Vec::with_capacity(processes);
        for _ in 0..processes {
            workers.push(Worker::spawn(&program, &args)?);
        }

        Ok(Self {
            root: root.into(),
            program,
            args,
            idle: Mutex::new(workers),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn checkout(&self) -> Result<Worker> {
        let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::WorkerFailure("runner is closed".to_string()));
            }
            if let Some(worker) = idle.pop() {
                return Ok(worker);
            }
            idle = self
                .available
                .wait(idle)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn checkin(&self, worker: Worker) {
        if self.closed.load(Ordering::SeqCst) {
            worker.shutdown();
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        idle.push(worker);
        self.available.notify_one();
    }
}

impl Runner for ProcessRunner {
    fn run(&self, tid: &str, computation: &str, params: ParamMap) -> Result<Trial> {
        let request = WorkerRequest::Run {
            tid: tid.to_string(),
            computation: computation.to_string(),
            params,
            root: self.root.clone(),
        };

        let mut worker = self.checkout()?;
        let response = worker.dispatch(&request);
        match response {
            Ok(response) => {
                self.checkin(worker);
                match response {
                    WorkerResponse::Done { tid } => {
                        Ok(Trial::open(FsStore::new(self.root.clone()), tid))
                    }
                    WorkerResponse::Failed { message } => Err(Error::Other(message)),
                }
            }
            Err(e) => {
                // Transport fault: retire the dead worker and keep the pool
                // at its fixed size so later callers are not starved. A
                // failed respawn shrinks the pool, so it must surface too.
                warn!("retiring failed worker: {e}");
                drop(worker);
                match Worker::spawn(&self.program, &self.args) {
                    Ok(replacement) => {
                        self.checkin(replacement);
                        Err(e)
                    }
                    Err(spawn_err) => {
                        error!("worker respawn failed: {spawn_err}");
                        Err(Error::WorkerFailure(format!(
                            "{e}; worker respawn failed: {spawn_err}"
                        )))
                    }
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let workers = {
            let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *idle)
        };
        // Wake blocked checkouts so they observe the closed flag.
        self.available.notify_all();
        for worker in workers {
            worker.shutdown();
        }
        Ok(())
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resumable::FnComputation;
    use crate::trial::TrialStatus;
    use serde_json::{json, Value};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn registry_with_double() -> ComputationRegistry {
        let registry = ComputationRegistry::new();
        registry.register("double", || {
            FnComputation::new(|_t, params: &ParamMap| {
                Ok(Value::from(params["x"].as_i64().unwrap_or(0) * 2))
            })
        });
        registry
    }

    fn frame(request: &WorkerRequest) -> String {
        format!("{}\n", serde_json::to_string(request).unwrap())
    }

    #[test]
    fn test_worker_loop_runs_trial() {
        let dir = tempdir().unwrap();
        let registry = registry_with_double();

        let request = frame(&WorkerRequest::Run {
            tid: "t1".to_string(),
            computation: "double".to_string(),
            params: [("x".to_string(), json!(4))].into_iter().collect(),
            root: dir.path().to_path_buf(),
        });
        let mut output = Vec::new();
        worker_loop(&registry, Cursor::new(request), &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        let response: WorkerResponse = serde_json::from_str(text.trim()).unwrap();
        assert!(matches!(response, WorkerResponse::Done { ref tid } if tid == "t1"));

        let trial = Trial::open(FsStore::new(dir.path()), "t1");
        assert_eq!(trial.result().unwrap(), Some(json!(8)));
    }

    #[test]
    fn test_worker_loop_recorded_failure_is_done() {
        let dir = tempdir().unwrap();
        let registry = ComputationRegistry::new();
        registry.register("explodes", || {
            FnComputation::new(|_t, _p: &ParamMap| Err(Error::other("boom")))
        });

        let request = frame(&WorkerRequest::Run {
            tid: "t1".to_string(),
            computation: "explodes".to_string(),
            params: ParamMap::new(),
            root: dir.path().to_path_buf(),
        });
        let mut output = Vec::new();
        worker_loop(&registry, Cursor::new(request), &mut output).unwrap();

        // A recorded computation failure is a successful worker response;
        // the failure lives in the manifest.
        let text = String::from_utf8(output).unwrap();
        let response: WorkerResponse = serde_json::from_str(text.trim()).unwrap();
        assert!(matches!(response, WorkerResponse::Done { .. }));

        let trial = Trial::open(FsStore::new(dir.path()), "t1");
        assert_eq!(trial.record().unwrap().status, TrialStatus::Failed);
    }

    #[test]
    fn test_worker_loop_unknown_computation_fails_frame() {
        let dir = tempdir().unwrap();
        let registry = ComputationRegistry::new();

        let request = frame(&WorkerRequest::Run {
            tid: "t1".to_string(),
            computation: "missing".to_string(),
            params: ParamMap::new(),
            root: dir.path().to_path_buf(),
        });
        let mut output = Vec::new();
        worker_loop(&registry, Cursor::new(request), &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        let response: WorkerResponse = serde_json::from_str(text.trim()).unwrap();
        assert!(matches!(response, WorkerResponse::Failed { ref message }
            if message.contains("missing")));
    }

    #[test]
    fn test_worker_loop_shutdown_stops() {
        let registry = ComputationRegistry::new();
        let mut output = Vec::new();
        worker_loop(
            &registry,
            Cursor::new(frame(&WorkerRequest::Shutdown)),
            &mut output,
        )
        .unwrap();
        assert!(output.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_worker_is_transport_failure() {
        let dir = tempdir().unwrap();
        // `true` exits immediately: the pool sees EOF instead of a frame.
        let runner = ProcessRunner::with_program(
            dir.path(),
            1,
            PathBuf::from("/bin/true"),
            Vec::new(),
        )
        .unwrap();

        let err = runner.run("t1", "double", ParamMap::new()).unwrap_err();
        assert!(matches!(err, Error::WorkerFailure(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_garbled_frame_is_transport_failure() {
        let dir = tempdir().unwrap();
        // `cat` echoes the request back: a syntactically valid line that is
        // not a WorkerResponse.
        let runner = ProcessRunner::with_program(
            dir.path(),
            1,
            PathBuf::from("/bin/cat"),
            Vec::new(),
        )
        .unwrap();

        let err = runner.run("t1", "double", ParamMap::new()).unwrap_err();
        assert!(matches!(err, Error::WorkerFailure(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_after_close_errors_instead_of_blocking() {
        let dir = tempdir().unwrap();
        let mut runner = ProcessRunner::with_program(
            dir.path(),
            1,
            PathBuf::from("/bin/cat"),
            Vec::new(),
        )
        .unwrap();
        runner.close().unwrap();

        let err = runner.run("t1", "double", ParamMap::new()).unwrap_err();
        assert!(matches!(err, Error::WorkerFailure(ref msg) if msg.contains("closed")));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_respawn_surfaces_to_caller() {
        let dir = tempdir().unwrap();
        // Pool a short-lived program, then delete it so the respawn after
        // its EOF cannot succeed.
        let program = dir.path().join("worker-bin");
        std::fs::copy("/bin/true", &program).unwrap();
        let runner =
            ProcessRunner::with_program(dir.path(), 1, program.clone(), Vec::new()).unwrap();
        std::fs::remove_file(&program).unwrap();

        let err = runner.run("t1", "double", ParamMap::new()).unwrap_err();
        assert!(matches!(err, Error::WorkerFailure(ref msg) if msg.contains("respawn failed")));
    }

    #[test]
    fn test_close_idempotent() {
        let dir = tempdir().unwrap();
        let mut runner = ProcessRunner::with_program(
            dir.path(),
            1,
            PathBuf::from(if cfg!(unix) { "/bin/cat" } else { "cmd" }),
            Vec::new(),
        )
        .unwrap();
        runner.close().unwrap();
        runner.close().unwrap();
    }
}

use crate::shell::{kill_tree, spawn_command};
use anyhow::{Result, bail};
use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

const LOG_TAIL_LINES: usize = 200;

type LogTail = Arc<Mutex<VecDeque<String>>>;

struct Job {
    child: Child,
    command: String,
    log: LogTail,
}

/// Named long-running processes started by `bash_bg`. Every job is killed
/// when the registry is dropped.
#[derive(Default)]
pub struct BackgroundJobs {
    jobs: Mutex<BTreeMap<String, Job>>,
    counter: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackgroundJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, command: &str, cwd: &Path, name: Option<&str>) -> Result<String> {
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("bg_{}", self.counter.fetch_add(1, Ordering::SeqCst)),
        };
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs.get_mut(&name)
            && matches!(existing.child.try_wait(), Ok(None))
        {
            bail!("a background process named '{name}' is already running");
        }
        let mut child = spawn_command(command, cwd, Stdio::null())?;
        let log: LogTail = Arc::default();
        capture(child.stdout.take(), Arc::clone(&log));
        capture(child.stderr.take(), Arc::clone(&log));
        let pid = child.id();
        jobs.insert(
            name.clone(),
            Job {
                child,
                command: command.to_string(),
                log,
            },
        );
        Ok(format!(
            "Started background process '{name}' (PID {pid}). Use /stop {name} to kill it."
        ))
    }

    pub fn list(&self) -> String {
        let mut jobs = lock(&self.jobs);
        if jobs.is_empty() {
            return "No background processes running".to_string();
        }
        let mut lines = vec!["Background processes:".to_string()];
        for (name, job) in jobs.iter_mut() {
            let status = match job.child.try_wait() {
                Ok(None) => "running".to_string(),
                Ok(Some(status)) => match status.code() {
                    Some(code) => format!("exited ({code})"),
                    None => "stopped".to_string(),
                },
                Err(_) => "unknown".to_string(),
            };
            lines.push(format!(
                "  {name} (PID {}) - {status}: {}",
                job.child.id(),
                job.command
            ));
        }
        lines.join("\n")
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.jobs).keys().cloned().collect()
    }

    pub fn stop(&self, name: &str) -> String {
        match lock(&self.jobs).remove(name) {
            Some(mut job) => {
                kill_tree(&mut job.child);
                let _ = job.child.wait();
                format!("Stopped: {name}")
            }
            None => format!("No process named: {name}"),
        }
    }

    pub fn stop_all(&self) -> String {
        let jobs = std::mem::take(&mut *lock(&self.jobs));
        if jobs.is_empty() {
            return "No background processes".to_string();
        }
        let mut stopped = Vec::new();
        for (name, mut job) in jobs {
            kill_tree(&mut job.child);
            let _ = job.child.wait();
            stopped.push(name);
        }
        format!("Stopped all: {}", stopped.join(", "))
    }

    /// The last `lines` lines of a job's combined output.
    pub fn logs(&self, name: &str, lines: usize) -> Option<String> {
        let jobs = lock(&self.jobs);
        let job = jobs.get(name)?;
        let log = lock(&job.log);
        let skip = log.len().saturating_sub(lines);
        Some(log.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n"))
    }
}

impl Drop for BackgroundJobs {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>, log: LogTail) {
    let Some(pipe) = pipe else { return };
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            let mut log = lock(&log);
            if log.len() == LOG_TAIL_LINES {
                log.pop_front();
            }
            log.push_back(line);
        }
    });
}

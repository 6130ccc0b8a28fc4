use crate::McpError;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest};
use quill_core::McpServerConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

type Pending = Arc<Mutex<HashMap<u64, SyncSender<JsonRpcMessage>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running provider process speaking newline-delimited JSON-RPC on stdio.
///
/// Each request registers a one-shot receptacle under its id before it is
/// written. A reader thread owns stdout and hands every response to the
/// receptacle with the matching id, so concurrent callers never see each
/// other's replies and unmatched messages are dropped.
pub(crate) struct Connection {
    server: String,
    child: Child,
    stdin: Mutex<Option<ChildStdin>>,
    next_id: AtomicU64,
    pending: Pending,
}

impl Connection {
    pub(crate) fn launch(server: &str, config: &McpServerConfig) -> Result<Self, McpError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| McpError::Spawn {
                server: server.to_string(),
                source,
            })?;
        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(McpError::Closed(server.to_string()));
        };
        let pending: Pending = Arc::default();
        spawn_reader(stdout, Arc::clone(&pending));
        Ok(Self {
            server: server.to_string(),
            child,
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(1),
            pending,
        })
    }

    /// Send a request and block until its response arrives or `timeout` passes.
    pub(crate) fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.pending).insert(id, tx);
        if let Err(err) = self.write(&JsonRpcRequest::call(id, method, params)) {
            lock(&self.pending).remove(&id);
            return Err(err);
        }
        match rx.recv_timeout(timeout) {
            Ok(message) => {
                if let Some(error) = message.rpc_error() {
                    return Err(McpError::Rpc {
                        code: error.code,
                        message: error.message,
                    });
                }
                Ok(message.result.unwrap_or(Value::Null))
            }
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).remove(&id);
                Err(McpError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(McpError::Closed(self.server.clone())),
        }
    }

    pub(crate) fn notify(&self, method: &str) -> Result<(), McpError> {
        self.write(&JsonRpcRequest::notification(method))
    }

    fn write(&self, message: &JsonRpcRequest) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut guard = lock(&self.stdin);
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::Closed(self.server.clone()))?;
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    /// Close stdin, ask the process to exit, and kill it if it is still
    /// running after `grace`. Outstanding requests fail with `Closed`.
    pub(crate) fn shutdown(mut self, grace: Duration) {
        drop(lock(&self.stdin).take());
        terminate(&self.child);
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(25)),
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        lock(&self.pending).clear();
    }
}

fn spawn_reader(stdout: ChildStdout, pending: Pending) {
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<JsonRpcMessage>(line) else {
                continue;
            };
            let Some(id) = message.response_id() else {
                continue;
            };
            if let Some(slot) = lock(&pending).remove(&id) {
                let _ = slot.send(message);
            }
        }
        // Dropping the senders wakes every waiter with `Disconnected`.
        lock(&pending).clear();
    });
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: signalling a child we spawned and have not yet reaped.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

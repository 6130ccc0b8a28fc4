use anyhow::{Result, anyhow};
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_POLL: Duration = Duration::from_millis(20);
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub interrupted: bool,
}

pub trait ShellRunner: Send + Sync {
    fn run(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        interrupt: &AtomicBool,
    ) -> Result<ShellRunResult>;
}

#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        interrupt: &AtomicBool,
    ) -> Result<ShellRunResult> {
        let mut child = spawn_command(cmd, cwd, Stdio::null())?;
        let stdout = PipeDrain::spawn(child.stdout.take());
        let stderr = PipeDrain::spawn(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let mut interrupted = false;
        let status = loop {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                break status;
            }
            if interrupt.load(Ordering::SeqCst) {
                interrupted = true;
            } else if Instant::now() >= deadline {
                timed_out = true;
            } else {
                continue;
            }
            kill_tree(&mut child);
            break child.wait()?;
        };

        // Background children can keep the pipes open after the shell exits.
        if !timed_out && !interrupted {
            loop {
                if stdout.is_finished() && stderr.is_finished() {
                    break;
                }
                if interrupt.load(Ordering::SeqCst) {
                    interrupted = true;
                } else if Instant::now() >= deadline {
                    timed_out = true;
                } else {
                    thread::sleep(DRAIN_POLL);
                    continue;
                }
                kill_group(&child);
                break;
            }
        }
        wait_drains(&[&stdout, &stderr], Instant::now() + KILL_GRACE);

        Ok(ShellRunResult {
            status: status.code(),
            stdout: stdout.collected(),
            stderr: stderr.collected(),
            timed_out,
            interrupted,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads a child pipe on its own thread. What has been read stays available
/// while another process still holds the pipe open.
pub(crate) struct PipeDrain {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl PipeDrain {
    pub(crate) fn spawn<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let handle = pipe.map(|mut pipe| {
            let sink = Arc::clone(&buf);
            thread::spawn(move || {
                let mut chunk = [0_u8; 8192];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(read) => lock(&sink).extend_from_slice(&chunk[..read]),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => break,
                    }
                }
            })
        });
        Self { buf, handle }
    }

    /// True once the pipe reached EOF.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub(crate) fn collected(mut self) -> String {
        if self.is_finished()
            && let Some(handle) = self.handle.take()
        {
            let _ = handle.join();
        }
        String::from_utf8_lossy(&lock(&self.buf)).to_string()
    }
}

/// Waits for every drain to reach EOF. False when `deadline` passes first.
pub(crate) fn wait_drains(drains: &[&PipeDrain], deadline: Instant) -> bool {
    loop {
        if drains.iter().all(|drain| drain.is_finished()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(DRAIN_POLL);
    }
}

/// Spawn `cmd` through the platform shell in its own process group, with
/// piped stdout/stderr.
pub(crate) fn spawn_command(cmd: &str, cwd: &Path, stdin: Stdio) -> Result<Child> {
    let cwd = if cwd.exists() {
        std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf())
    } else {
        return Err(anyhow!("working directory not found: {}", cwd.display()));
    };
    let mut stdin = Some(stdin);
    let mut errors = Vec::new();
    for mut command in candidate_commands(cmd) {
        command.current_dir(&cwd);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(stdin.take().unwrap_or_else(Stdio::null));
        isolate_process_group(&mut command);
        let program = command.get_program().to_string_lossy().to_string();
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{program}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn command '{cmd}' in '{}': {}",
        cwd.display(),
        errors.join(" | ")
    ))
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_command: &mut Command) {}

/// Terminate the child and everything it started.
pub(crate) fn kill_tree(child: &mut Child) {
    kill_group(child);
    let _ = child.kill();
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: the child leads its own process group, so -pid only
        // reaches processes it spawned.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
fn kill_group(child: &Child) {
    let _ = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &child.id().to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(any(unix, windows)))]
fn kill_group(_child: &Child) {}

#[cfg(target_os = "windows")]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut cmd_shell = Command::new("cmd");
    cmd_shell.arg("/C").arg(cmd);
    commands.push(cmd_shell);

    let mut ps_shell = Command::new("powershell");
    ps_shell
        .arg("-NoLogo")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(cmd);
    commands.push(ps_shell);

    commands
}

#[cfg(not(target_os = "windows"))]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut sh_shell = Command::new("sh");
    sh_shell.arg("-c").arg(cmd);
    commands.push(sh_shell);

    let mut bash_shell = Command::new("bash");
    bash_shell.arg("-c").arg(cmd);
    commands.push(bash_shell);

    commands
}

/// Render a run for the model: the last `max_lines` lines of combined output
/// followed by timeout, interrupt, and exit-code markers.
pub fn format_run_output(result: &ShellRunResult, timeout: Duration, max_lines: usize) -> String {
    let mut combined = result.stdout.clone();
    if !result.stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&result.stderr);
    }
    let lines: Vec<&str> = combined.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let mut output = lines[start..].join("\n");
    if result.timed_out {
        output.push_str(&format!("\n(timed out after {}s)", timeout.as_secs()));
    } else if result.interrupted {
        output.push_str("\n(interrupted)");
    } else if let Some(code) = result.status
        && code != 0
    {
        output.push_str(&format!("\n(exit code: {code})"));
    }
    let output = output.trim();
    if output.is_empty() {
        "(no output)".to_string()
    } else {
        output.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(cmd: &str, timeout: Duration) -> ShellRunResult {
        PlatformShellRunner
            .run(cmd, Path::new("."), timeout, &AtomicBool::new(false))
            .expect("run command")
    }

    #[test]
    fn shell_runner_executes_command() {
        let out = run("echo quill", Duration::from_secs(5));
        assert!(!out.timed_out);
        assert_eq!(out.status, Some(0));
        assert!(out.stdout.contains("quill"));
    }

    #[cfg(unix)]
    #[test]
    fn long_running_command_times_out() {
        let started = Instant::now();
        let out = run("sleep 5", Duration::from_millis(300));
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(
            format_run_output(&out, Duration::from_secs(1), 500),
            "(timed out after 1s)"
        );
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_flag_stops_the_command() {
        let flag = AtomicBool::new(true);
        let out = PlatformShellRunner
            .run("sleep 5", Path::new("."), Duration::from_secs(10), &flag)
            .expect("run");
        assert!(out.interrupted);
        assert!(!out.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn large_output_does_not_block_the_child() {
        let out = run("seq 1 100000", Duration::from_secs(20));
        assert!(!out.timed_out);
        let formatted = format_run_output(&out, Duration::from_secs(20), 3);
        assert_eq!(formatted, "99998\n99999\n100000");
    }

    #[cfg(unix)]
    #[test]
    fn backgrounded_child_does_not_outlive_the_timeout() {
        let started = Instant::now();
        let out = run("sleep 8 & echo hi", Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(out.timed_out);
        assert_eq!(out.status, Some(0));
        assert!(out.stdout.contains("hi"));
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_reaches_a_backgrounded_child() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            setter.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        let out = PlatformShellRunner
            .run("sleep 8 & echo hi", Path::new("."), Duration::from_secs(30), &flag)
            .expect("run");
        trigger.join().expect("trigger");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(out.interrupted);
        assert!(!out.timed_out);
    }

    #[test]
    fn output_formatting_markers() {
        let failed = ShellRunResult {
            status: Some(2),
            stdout: "partial\n".to_string(),
            stderr: "boom\n".to_string(),
            ..Default::default()
        };
        assert_eq!(
            format_run_output(&failed, Duration::from_secs(60), 500),
            "partial\nboom\n(exit code: 2)"
        );
        let silent = ShellRunResult {
            status: Some(0),
            ..Default::default()
        };
        assert_eq!(format_run_output(&silent, Duration::from_secs(60), 500), "(no output)");
    }
}

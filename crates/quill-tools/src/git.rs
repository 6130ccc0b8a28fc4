use crate::shell::{PipeDrain, kill_tree, wait_drains};
use crate::{ToolContext, opt_bool, opt_str, opt_u64, req_str};
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

const DIFF_MAX_CHARS: usize = 8000;

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

fn git(cwd: &Path, args: &[&str], timeout: Duration) -> Result<GitOutput> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to execute git")?;
    let deadline = Instant::now() + timeout;
    let stdout = PipeDrain::spawn(child.stdout.take());
    let stderr = PipeDrain::spawn(child.stderr.take());
    let Some(status) = child.wait_timeout(timeout)? else {
        kill_tree(&mut child);
        let _ = child.wait();
        bail!("git {} timed out after {}s", args.join(" "), timeout.as_secs());
    };
    if !wait_drains(&[&stdout, &stderr], deadline) {
        bail!("git {} timed out after {}s", args.join(" "), timeout.as_secs());
    }
    Ok(GitOutput {
        success: status.success(),
        stdout: stdout.collected(),
        stderr: stderr.collected(),
    })
}

fn checked(output: GitOutput) -> Result<String> {
    if !output.success {
        bail!("{}", output.stderr.trim());
    }
    Ok(output.stdout.trim().to_string())
}

pub(crate) fn status(ctx: &ToolContext, args: &Value) -> Result<String> {
    let cwd = ctx.resolve(opt_str(args, "path").unwrap_or("."));
    let out = checked(git(&cwd, &["status", "--porcelain", "-b"], Duration::from_secs(10))?)?;
    if out.is_empty() {
        return Ok("clean working tree".to_string());
    }
    Ok(out)
}

pub(crate) fn diff(ctx: &ToolContext, args: &Value) -> Result<String> {
    let mut cmd = vec!["diff"];
    if opt_bool(args, "staged") {
        cmd.push("--staged");
    }
    if let Some(file) = opt_str(args, "file") {
        cmd.push("--");
        cmd.push(file);
    }
    let out = checked(git(&ctx.workspace, &cmd, Duration::from_secs(30))?)?;
    if out.is_empty() {
        return Ok("no changes".to_string());
    }
    Ok(out.chars().take(DIFF_MAX_CHARS).collect())
}

pub(crate) fn log(ctx: &ToolContext, args: &Value) -> Result<String> {
    let count = format!("-{}", opt_u64(args, "count").unwrap_or(10));
    let mut cmd = vec!["log", count.as_str()];
    // One-line output unless explicitly turned off.
    if args.get("oneline").is_none() || opt_bool(args, "oneline") {
        cmd.push("--oneline");
    }
    let out = git(&ctx.workspace, &cmd, Duration::from_secs(10))?;
    let text = out.stdout.trim();
    if text.is_empty() {
        return Ok("no commits".to_string());
    }
    Ok(text.to_string())
}

pub(crate) fn commit(ctx: &ToolContext, args: &Value) -> Result<String> {
    let message = req_str(args, "message")?;
    let mut cmd = vec!["commit"];
    if opt_bool(args, "all") {
        cmd.push("-a");
    }
    cmd.extend(["-m", message]);
    let out = checked(git(&ctx.workspace, &cmd, Duration::from_secs(30))?)?;
    if out.is_empty() {
        return Ok("committed".to_string());
    }
    Ok(out)
}

pub(crate) fn add(ctx: &ToolContext, args: &Value) -> Result<String> {
    let files = shell_words::split(req_str(args, "files")?)
        .context("could not parse file list")?;
    if files.is_empty() {
        bail!("no files given");
    }
    let mut cmd = vec!["add", "--"];
    cmd.extend(files.iter().map(String::as_str));
    checked(git(&ctx.workspace, &cmd, Duration::from_secs(10))?)?;
    Ok(format!("staged: {}", files.join(" ")))
}

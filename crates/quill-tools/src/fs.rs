use crate::shell::{PipeDrain, kill_tree, wait_drains};
use crate::{ToolContext, opt_bool, opt_str, opt_u64, req_str};
use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

const PATCH_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn read(ctx: &ToolContext, args: &Value) -> Result<String> {
    let raw = req_str(args, "path")?;
    let path = ctx.resolve(raw);
    if !path.exists() {
        bail!("file not found: {raw}");
    }
    if path.is_dir() {
        bail!("path is a directory: {raw}");
    }
    let bytes = fs::read(&path)?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let offset = opt_u64(args, "offset").unwrap_or(0) as usize;
    let limit = opt_u64(args, "limit").map_or(lines.len(), |l| l as usize);
    Ok(lines
        .iter()
        .enumerate()
        .skip(offset)
        .take(limit)
        .map(|(idx, line)| format!("{:4}│ {line}\n", idx + 1))
        .collect())
}

pub(crate) fn write(ctx: &ToolContext, args: &Value) -> Result<String> {
    let raw = req_str(args, "path")?;
    let content = req_str(args, "content")?;
    let path = ctx.resolve(raw);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content)?;
    Ok(format!("ok: wrote {} bytes to {}", content.len(), path.display()))
}

pub(crate) fn edit(ctx: &ToolContext, args: &Value) -> Result<String> {
    let raw = req_str(args, "path")?;
    let old = req_str(args, "old")?;
    let new = req_str(args, "new")?;
    let path = ctx.resolve(raw);
    if !path.exists() {
        bail!("file not found: {raw}");
    }
    if old.is_empty() {
        bail!("old string must not be empty");
    }
    let text = fs::read_to_string(&path)?;
    let count = text.matches(old).count();
    if count == 0 {
        bail!("old string not found in file");
    }
    let replace_all = opt_bool(args, "all");
    if count > 1 && !replace_all {
        bail!("old string appears {count} times, must be unique (use all=true)");
    }
    let (updated, replaced) = if replace_all {
        (text.replace(old, new), count)
    } else {
        (text.replacen(old, new, 1), 1)
    };
    fs::write(&path, updated)?;
    Ok(format!("ok: replaced {replaced} occurrence(s)"))
}

/// Apply a unified diff to one file with the system `patch` utility.
pub(crate) fn patch(ctx: &ToolContext, args: &Value) -> Result<String> {
    let raw = req_str(args, "path")?;
    let diff = req_str(args, "patch")?;
    let path = ctx.resolve(raw);
    if !path.exists() {
        bail!("file not found: {raw}");
    }
    let mut child = match Command::new("patch")
        .arg(&path)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            bail!("patch command not found, please install patch utility")
        }
        Err(err) => return Err(err.into()),
    };
    let deadline = Instant::now() + PATCH_TIMEOUT;
    let stdout = PipeDrain::spawn(child.stdout.take());
    let stderr = PipeDrain::spawn(child.stderr.take());
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(diff.as_bytes())?;
    }
    let status = child.wait_timeout(PATCH_TIMEOUT)?;
    let Some(status) = status.filter(|_| wait_drains(&[&stdout, &stderr], deadline)) else {
        kill_tree(&mut child);
        let _ = child.wait();
        bail!("patch timed out after {}s", PATCH_TIMEOUT.as_secs());
    };
    if status.success() {
        return Ok("ok: patch applied".to_string());
    }
    let stderr = stderr.collected();
    let stdout = stdout.collected();
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    Err(anyhow!("{detail}"))
}

pub(crate) fn ls(ctx: &ToolContext, args: &Value) -> Result<String> {
    let raw = opt_str(args, "path").unwrap_or(".");
    let path = ctx.resolve(raw);
    if !path.exists() {
        bail!("path not found: {raw}");
    }
    if !path.is_dir() {
        bail!("not a directory: {raw}");
    }
    let mut entries: Vec<_> = fs::read_dir(&path)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    let mut out = Vec::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_dir() {
            out.push(format!("{name}/"));
        } else {
            out.push(format!("{name} ({} bytes)", meta.len()));
        }
    }
    if out.is_empty() {
        return Ok("(empty directory)".to_string());
    }
    Ok(out.join("\n"))
}

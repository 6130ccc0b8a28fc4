use crate::{ToolContext, req_str};
use anyhow::{Result, bail};
use serde_json::Value;

pub(crate) fn fetch(ctx: &ToolContext, args: &Value) -> Result<String> {
    let url = req_str(args, "url")?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("unsupported URL scheme: {url}");
    }
    let response = ctx.http.get(url).send()?.error_for_status()?;
    let body = response.text()?;
    Ok(truncate_body(&body, ctx.settings.fetch_max_chars))
}

fn truncate_body(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((cut, _)) => format!(
            "{}\n... (truncated, {} bytes total)",
            &body[..cut],
            body.len()
        ),
        None => body.to_string(),
    }
}

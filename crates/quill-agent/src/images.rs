//! Image attachments for multimodal models.
//!
//! A user message may reference images either as `[image: path]` or as a
//! bare path ending in a known image extension. Each readable image becomes a
//! base64 data-URL part next to the original text.

use base64::Engine;
use quill_core::{ContentPart, ImageUrl, MessageContent};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

const BARE_PATH_PATTERN: &str =
    r#"(?i)(?:^|\s)["']?([^\s"'\[\]]+\.(?:png|jpe?g|gif|webp|bmp))\b["']?"#;
const TAGGED_PATTERN: &str = r"(?i)\[image:\s*([^\]]+)\]";

fn patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [TAGGED_PATTERN, BARE_PATH_PATTERN]
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

fn media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => return None,
    })
}

/// Reads an image file into a data-URL content part. `None` for missing
/// files and unsupported extensions.
pub fn load_image(path: &Path) -> Option<ContentPart> {
    let media = media_type(path)?;
    let bytes = fs::read(path).ok()?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Some(ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: format!("data:{media};base64,{encoded}"),
        },
    })
}

/// Image paths referenced in `text`, resolved against `workspace`, in order
/// of appearance and without duplicates.
pub fn referenced_paths(text: &str, workspace: &Path) -> Vec<PathBuf> {
    let mut found: Vec<(usize, String)> = patterns()
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.as_str().trim().to_string()))
        .collect();
    found.sort_by_key(|(pos, _)| *pos);

    let mut paths: Vec<PathBuf> = Vec::new();
    for (_, raw) in found {
        let path = Path::new(&raw);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace.join(path)
        };
        if !paths.contains(&resolved) {
            paths.push(resolved);
        }
    }
    paths
}

/// Builds the user message content for `text`, attaching every image it
/// references. Returns the content and the number of images attached.
pub fn user_content(text: &str, workspace: &Path) -> (MessageContent, usize) {
    let images: Vec<ContentPart> = referenced_paths(text, workspace)
        .iter()
        .filter_map(|path| load_image(path))
        .collect();
    if images.is_empty() {
        return (MessageContent::Text(text.to_string()), 0);
    }
    let count = images.len();
    let mut parts = vec![ContentPart::Text {
        text: text.to_string(),
    }];
    parts.extend(images);
    (MessageContent::Parts(parts), count)
}

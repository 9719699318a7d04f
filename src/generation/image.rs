#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::Context as _;
use base64::Engine as _;

/// Accepts a data URL as-is, otherwise reads and inlines the file at `arg`.
pub fn resolve_reference_image(arg: &str) -> anyhow::Result<String> {
    let arg = arg.trim();
    if arg.starts_with("data:") {
        return Ok(arg.to_owned());
    }
    encode_file(Path::new(arg))
}

pub fn encode_file(path: &Path) -> anyhow::Result<String> {
    let mime = mime_for(path)?;
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    if bytes.is_empty() {
        anyhow::bail!("image {} is empty", path.display());
    }
    let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{mime};base64,{b64}"))
}

fn mime_for(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    Ok(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => anyhow::bail!(
            "unsupported image type '{}' (use png|jpg|jpeg|webp|gif)",
            path.display()
        ),
    })
}

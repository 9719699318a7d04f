#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::Context as _;
use tokio::io::AsyncWriteExt as _;

use super::GenerationClient;

impl GenerationClient {
    /// Streams `url` into `dest` and returns the number of bytes written.
    ///
    /// The body lands in `<dest>.part` first and is renamed into place once
    /// complete, so an interrupted transfer never leaves a truncated `dest`.
    pub async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        tracing::debug!(url, dest = %dest.display(), "downloading video");
        let mut resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to request {url}"))?
            .error_for_status()
            .with_context(|| format!("download of {url} was refused"))?;

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("failed to create {}", part.display()))?;
        let mut written = 0u64;
        let copied: anyhow::Result<()> = async {
            while let Some(chunk) = resp.chunk().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.context(format!("download of {url} failed")));
        }
        tokio::fs::rename(&part, dest)
            .await
            .with_context(|| format!("failed to move {} into place", part.display()))?;

        tracing::info!(url, dest = %dest.display(), bytes = written, "downloaded video");
        Ok(written)
    }
}

fn part_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    name.into()
}

/// Last path segment of `url`, or `<id>.mp4` when it has no usable name.
#[must_use]
pub fn default_file_name(url: &str, id: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let after_scheme = path.split_once("://").map_or(path, |(_, rest)| rest);
    let name = after_scheme
        .split_once('/')
        .and_then(|(_, p)| p.rsplit('/').next())
        .unwrap_or_default();
    if name.contains('.') && !name.starts_with('.') {
        name.to_owned()
    } else {
        format!("{id}.mp4")
    }
}

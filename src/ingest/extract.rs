//! Text extraction for ingestion sources.
//!
//! Extraction backends (OCR, PDF parsers) live behind the gateway trait;
//! the built-in implementation handles plain text with lossy decoding for
//! unknown encodings. Remote sources are downloaded to the upload directory
//! first and cleaned up by the pipeline afterwards.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),
    #[error("download failed: {0}")]
    Download(String),
}

#[async_trait]
pub trait TextExtractionGateway: Send + Sync {
    async fn extract(&self, path: &Path, mime_type: &str) -> Result<String, ExtractionError>;
}

/// Reads files as text, decoding lossily when the bytes are not valid UTF-8.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractionGateway for PlainTextExtractor {
    async fn extract(&self, path: &Path, _mime_type: &str) -> Result<String, ExtractionError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("md") | Some("markdown") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        _ => "text/plain",
    }
}

/// Downloads a remote document into `dir`, named after the document id with
/// the URL's extension preserved. The caller owns cleanup of the returned
/// path.
pub async fn download_to_dir(
    client: &reqwest::Client,
    url: &str,
    dir: &Path,
    doc_id: &str,
) -> Result<PathBuf, ExtractionError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| ExtractionError::Download(err.to_string()))?;

    if !response.status().is_success() {
        return Err(ExtractionError::Download(format!(
            "{} responded {}",
            url,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| ExtractionError::Download(err.to_string()))?;

    let extension = url_extension(url).unwrap_or_else(|| "txt".to_string());
    let filename = format!("{}.{}", doc_id, extension);
    let path = dir.join(filename);

    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, &bytes).await?;

    Ok(path)
}

fn url_extension(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let name = trimmed.rsplit('/').next()?;
    let (_, extension) = name.rsplit_once('.')?;
    if extension.is_empty() || extension.len() > 8 {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_extractor_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        tokio::fs::write(&path, "hello extraction").await.unwrap();

        let extractor = PlainTextExtractor;
        let text = extractor.extract(&path, "text/plain").await.unwrap();
        assert_eq!(text, "hello extraction");
    }

    #[tokio::test]
    async fn extractor_is_lossy_on_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weird.txt");
        tokio::fs::write(&path, [0x68, 0x69, 0xFF, 0x21]).await.unwrap();

        let extractor = PlainTextExtractor;
        let text = extractor.extract(&path, "text/plain").await.unwrap();
        assert!(text.starts_with("hi"));
        assert!(text.ends_with('!'));
    }

    #[test]
    fn url_extension_handles_queries_and_fragments() {
        assert_eq!(
            url_extension("https://example.com/a/report.pdf?download=1"),
            Some("pdf".to_string())
        );
        assert_eq!(
            url_extension("https://example.com/page.HTML#top"),
            Some("html".to_string())
        );
        assert_eq!(url_extension("https://example.com/no-extension"), None);
    }

    #[test]
    fn mime_guess_defaults_to_plain_text() {
        assert_eq!(mime_for_path(Path::new("a.md")), "text/markdown");
        assert_eq!(mime_for_path(Path::new("a.bin")), "text/plain");
    }
}

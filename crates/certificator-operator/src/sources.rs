//! Certificate sources
//!
//! Raw certificate data comes from local directories and remote URLs. The
//! loader only returns bytes; parsing happens in [`refresh_bundle`] so a
//! broken file fails the whole refresh and the previous bundle stays in use.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use certificator_bundle::{BundleError, CertBundle, Digest};
use futures::future::try_join_all;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use certificator_common::{Error, Result};

/// Raw bytes read from one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceData {
    /// File path or URL
    pub origin: String,
    /// Unparsed content
    pub data: Vec<u8>,
}

/// Produces the raw certificate data of one refresh
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceLoader: Send + Sync {
    /// Read every source, in a stable order
    async fn load(&self) -> Result<Vec<SourceData>>;
}

/// Directories and URLs holding CA certificates
#[derive(Debug, Clone)]
pub struct CertificateSources {
    directories: Vec<PathBuf>,
    urls: Vec<String>,
    http: reqwest::Client,
}

impl CertificateSources {
    /// Create a loader for the given directories and URLs
    pub fn new(directories: Vec<PathBuf>, urls: Vec<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::internal_with_context("http client", e.to_string()))?;
        Ok(Self::with_client(directories, urls, http))
    }

    /// Create a loader with a custom HTTP client
    pub fn with_client(directories: Vec<PathBuf>, urls: Vec<String>, http: reqwest::Client) -> Self {
        Self {
            directories,
            urls,
            http,
        }
    }

    /// Configured directories
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Configured URLs
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    async fn download(&self, url: &str) -> Result<SourceData> {
        info!(url = %url, "Downloading certificates");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::fetch(url, format!("request failed: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::fetch_status(
                url,
                status.as_u16(),
                format!("GET {url}: {status}"),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::fetch(url, format!("reading body failed: {e}")))?;

        Ok(SourceData {
            origin: url.to_string(),
            data: body.to_vec(),
        })
    }
}

/// Read every regular file in `directory`, ordered by file name
///
/// Symlinks are followed; anything that resolves to a directory is skipped.
async fn read_directory(directory: &Path) -> Result<Vec<SourceData>> {
    let origin = directory.display().to_string();
    info!(directory = %origin, "Scanning directory");

    let mut entries = tokio::fs::read_dir(directory)
        .await
        .map_err(|e| Error::fetch(&origin, e.to_string()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::fetch(&origin, e.to_string()))?
    {
        files.push(entry.path());
    }
    files.sort();

    let mut sources = Vec::with_capacity(files.len());
    for path in files {
        let origin = path.display().to_string();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::fetch(&origin, e.to_string()))?;
        if metadata.is_dir() {
            continue;
        }

        debug!(path = %origin, "Loading certificate file");
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::fetch(&origin, e.to_string()))?;
        sources.push(SourceData { origin, data });
    }

    Ok(sources)
}

#[async_trait]
impl SourceLoader for CertificateSources {
    async fn load(&self) -> Result<Vec<SourceData>> {
        let mut sources = Vec::new();
        for directory in &self.directories {
            sources.extend(read_directory(directory).await?);
        }

        // try_join_all keeps input order, so the digest does not depend on
        // which download finishes first
        let downloads = try_join_all(self.urls.iter().map(|url| self.download(url))).await?;
        sources.extend(downloads);

        Ok(sources)
    }
}

/// Build a fresh bundle from everything `loader` returns
///
/// The digest is computed once here so the reconciler can compare bundles
/// without rehashing.
pub async fn refresh_bundle(
    loader: &dyn SourceLoader,
    password: &str,
) -> Result<(CertBundle, Digest)> {
    let sources = loader.load().await?;

    let mut bundle = CertBundle::new(password);
    for source in &sources {
        let count = bundle
            .append(&source.data)
            .map_err(|e| parse_error(&source.origin, e))?;
        debug!(origin = %source.origin, certificates = count, "Loaded certificate source");
    }

    let digest = bundle.digest();
    Ok((bundle, digest))
}

fn parse_error(origin: &str, e: BundleError) -> Error {
    match e {
        BundleError::Parse(message) => Error::parse(origin, message),
        BundleError::Encode(message) => Error::internal_with_context(origin, message),
    }
}

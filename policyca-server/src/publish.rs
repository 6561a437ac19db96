//! Content-addressed publication of policy documents.
//!
//! A document is stored as `<doc_dir>/<sha256-hex>.txt` and served from
//! `<base_url>/<sha256-hex>.txt`. Identical bytes always land at the same
//! name, so a file that already exists is left alone.

use std::path::{Path, PathBuf};

use rand::Rng;
use sha2::{Digest, Sha256};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot form document URL: {0}")]
    Url(#[from] url::ParseError),
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct DocumentPublisher {
    doc_dir: PathBuf,
    base_url: Url,
}

impl DocumentPublisher {
    pub fn new(doc_dir: impl Into<PathBuf>, mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            doc_dir: doc_dir.into(),
            base_url,
        }
    }

    pub fn doc_dir(&self) -> &Path {
        &self.doc_dir
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Store `doc` (if not already stored) and return its URL.
    pub async fn publish(&self, doc: &[u8]) -> Result<Url, PublishError> {
        let name = format!("{}.txt", sha256_hex(doc));
        let path = self.doc_dir.join(&name);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| PublishError::Io { path, source }
        };

        if tokio::fs::try_exists(&path).await.map_err(io_err(path.as_path()))? {
            tracing::debug!("Document {name} already published");
        } else {
            tokio::fs::create_dir_all(&self.doc_dir)
                .await
                .map_err(io_err(self.doc_dir.as_path()))?;
            // Unique temp name so concurrent publishers never share a file.
            let tmp = self
                .doc_dir
                .join(format!(".{name}.{:016x}.tmp", rand::thread_rng().r#gen::<u64>()));
            if let Err(e) = tokio::fs::write(&tmp, doc).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(io_err(tmp.as_path())(e));
            }
            tokio::fs::rename(&tmp, &path).await.map_err(io_err(path.as_path()))?;
            tracing::info!("Published {}", path.display());
        }

        Ok(self.base_url.join(&name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(dir: &Path, base: &str) -> DocumentPublisher {
        DocumentPublisher::new(dir.join("docs"), Url::parse(base).unwrap())
    }

    #[test]
    fn sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn publish_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let p = publisher(dir.path(), "https://ca.example:8443/security/");
        let url = p.publish(b"policy text").await.unwrap();

        let hex = sha256_hex(b"policy text");
        assert_eq!(
            url.as_str(),
            format!("https://ca.example:8443/security/{hex}.txt")
        );
        let stored = std::fs::read(dir.path().join("docs").join(format!("{hex}.txt"))).unwrap();
        assert_eq!(stored, b"policy text");
    }

    #[tokio::test]
    async fn republishing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = publisher(dir.path(), "https://ca.example/security/");
        let a = p.publish(b"same").await.unwrap();
        let b = p.publish(b"same").await.unwrap();
        assert_eq!(a, b);
        let files: Vec<_> = std::fs::read_dir(dir.path().join("docs")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_publishers_agree() {
        let dir = tempfile::tempdir().unwrap();
        let p = publisher(dir.path(), "https://ca.example/security/");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.publish(b"race").await.unwrap() })
            })
            .collect();
        let mut urls = Vec::new();
        for t in tasks {
            urls.push(t.await.unwrap());
        }
        assert!(urls.windows(2).all(|w| w[0] == w[1]));
        let files: Vec<_> = std::fs::read_dir(dir.path().join("docs")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let p = DocumentPublisher::new("/tmp", Url::parse("https://h/security").unwrap());
        assert_eq!(p.base_url().as_str(), "https://h/security/");
        assert_eq!(p.base_url().join("x.txt").unwrap().as_str(), "https://h/security/x.txt");
    }
}

//! On-disk fetch cache, HTTP retrieval, and record-file IO for talkfeed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use talkfeed_core::{Config, RecordFile};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "talkfeed-store";

const RETRY_DELAY: Duration = Duration::from_millis(250);

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes via a temp file + rename so readers never observe a partial
/// document and an interrupted run leaves the previous version intact.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
    let temp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(temp_name);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchCacheConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_age: Duration,
    pub max_bytes: usize,
}

impl Default for FetchCacheConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("talkfeed/{}", env!("CARGO_PKG_VERSION")),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Where the returned bytes came from. `StaleCache` means the network
/// retrieval failed and an expired entry was served instead; callers must
/// surface that to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Network,
    FreshCache,
    StaleCache { age: Duration },
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub bytes: Vec<u8>,
    pub provenance: Provenance,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response for {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

/// Result of a HEAD reachability probe. Probe failure is reported, never
/// treated as fatal by the resolver.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub url: String,
    pub ok: bool,
    pub detail: String,
}

/// URL-keyed document cache: sha256-addressed files on disk with a freshness
/// window, plus a per-run memo so one URL is retrieved at most once per
/// invocation. Constructed per run; the disk side persists between runs.
#[derive(Debug)]
pub struct FetchCache {
    client: reqwest::Client,
    dir: PathBuf,
    max_age: Duration,
    max_bytes: usize,
    memo: Mutex<HashMap<String, Vec<u8>>>,
}

impl FetchCache {
    pub fn new(dir: impl Into<PathBuf>, config: FetchCacheConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            dir: dir.into(),
            max_age: config.max_age,
            max_bytes: config.max_bytes,
            memo: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.xml", sha256_hex(url.as_bytes())))
    }

    /// Fetch a document, preferring the per-run memo, then a fresh disk
    /// entry, then the network. A failed retrieval falls back to a stale
    /// disk entry when one exists; that is the only locally absorbed
    /// failure, and it is marked in the returned provenance.
    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        if let Some(bytes) = self.memo.lock().await.get(url).cloned() {
            return Ok(FetchedDocument {
                bytes,
                provenance: Provenance::FreshCache,
            });
        }

        let path = self.cache_path(url);
        let disk = read_entry(&path).await;

        if let Some((bytes, age)) = &disk {
            if *age <= self.max_age {
                tracing::debug!(url, age_secs = age.as_secs(), "cache hit");
                self.memo.lock().await.insert(url.to_string(), bytes.clone());
                return Ok(FetchedDocument {
                    bytes: bytes.clone(),
                    provenance: Provenance::FreshCache,
                });
            }
        }

        tracing::info!(url, "downloading");
        match self.retrieve(url).await {
            Ok(bytes) => {
                if let Err(err) = write_atomic(&path, &bytes).await {
                    tracing::warn!(url, error = ?err, "failed to write cache entry");
                }
                self.memo.lock().await.insert(url.to_string(), bytes.clone());
                Ok(FetchedDocument {
                    bytes,
                    provenance: Provenance::Network,
                })
            }
            Err(err) => match disk {
                Some((bytes, age)) => {
                    tracing::warn!(
                        url,
                        age_secs = age.as_secs(),
                        error = %err,
                        "retrieval failed, serving stale cache entry"
                    );
                    self.memo.lock().await.insert(url.to_string(), bytes.clone());
                    Ok(FetchedDocument {
                        bytes,
                        provenance: Provenance::StaleCache { age },
                    })
                }
                None => Err(err),
            },
        }
    }

    /// One retrieval with a single retry on a failed request. Stale-cache
    /// fallback in `fetch` is the only further resilience.
    async fn retrieve(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        match self.retrieve_once(url).await {
            Ok(bytes) => Ok(bytes),
            Err(FetchError::Request { .. }) => {
                tokio::time::sleep(RETRY_DELAY).await;
                self.retrieve_once(url).await
            }
            Err(err) => Err(err),
        }
    }

    async fn retrieve_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if let Some(len) = resp.content_length() {
            if len as usize > self.max_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?
            .to_vec();

        if bytes.len() > self.max_bytes {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit: self.max_bytes,
            });
        }

        Ok(bytes)
    }

    /// HEAD reachability check for one URL.
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.client.head(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                ProbeOutcome {
                    url: url.to_string(),
                    ok: status.is_success(),
                    detail: format!("HTTP {}", status.as_u16()),
                }
            }
            Err(err) => ProbeOutcome {
                url: url.to_string(),
                ok: false,
                detail: err.to_string(),
            },
        }
    }

    /// Delete every cache entry, returning how many files were removed.
    pub fn clear(&self) -> anyhow::Result<usize> {
        let mut count = 0usize;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading cache directory {}", self.dir.display()))
            }
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("removing {}", entry.path().display()))?;
                count += 1;
            }
        }
        Ok(count)
    }
}

async fn read_entry(path: &Path) -> Option<(Vec<u8>, Duration)> {
    let meta = fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    let age = modified.elapsed().unwrap_or_default();
    let bytes = fs::read(path).await.ok()?;
    Some((bytes, age))
}

// Record and configuration file IO.

pub async fn load_record_file(path: &Path) -> anyhow::Result<RecordFile> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn save_record_file(path: &Path, file: &RecordFile) -> anyhow::Result<()> {
    let text = serde_yaml::to_string(file).context("serializing record file")?;
    write_atomic(path, text.as_bytes()).await
}

pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

pub async fn save_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    let text = serde_yaml::to_string(config).context("serializing configuration")?;
    write_atomic(path, text.as_bytes()).await
}

/// Record files in a directory (`media_*.yml`), sorted by name for
/// deterministic batch order.
pub fn list_record_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading record directory {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("media_") && name.ends_with(".yml") && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkfeed_core::{FeedMeta, TalkRecord};
    use tempfile::tempdir;

    #[test]
    fn cache_keys_are_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out.xml");
        write_atomic(&target, b"<rss/>").await.expect("write");

        assert_eq!(std::fs::read(&target).expect("read back"), b"<rss/>");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn fresh_cache_entry_short_circuits_the_network() {
        let dir = tempdir().expect("tempdir");
        let cache = FetchCache::new(dir.path(), FetchCacheConfig::default()).expect("cache");

        // Unroutable URL: any network attempt would fail, so success proves
        // the disk entry was used.
        let url = "http://127.0.0.1:1/schedule.xml";
        write_atomic(&cache.cache_path(url), b"<schedule/>")
            .await
            .expect("seed");

        let doc = cache.fetch(url).await.expect("fetch");
        assert_eq!(doc.bytes, b"<schedule/>");
        assert_eq!(doc.provenance, Provenance::FreshCache);
    }

    #[tokio::test]
    async fn failed_retrieval_falls_back_to_stale_entry() {
        let dir = tempdir().expect("tempdir");
        let config = FetchCacheConfig {
            max_age: Duration::ZERO,
            ..FetchCacheConfig::default()
        };
        let cache = FetchCache::new(dir.path(), config).expect("cache");

        let url = "http://127.0.0.1:1/schedule.xml";
        write_atomic(&cache.cache_path(url), b"<schedule/>")
            .await
            .expect("seed");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let doc = cache.fetch(url).await.expect("fetch");
        assert_eq!(doc.bytes, b"<schedule/>");
        assert!(matches!(doc.provenance, Provenance::StaleCache { .. }));
    }

    #[tokio::test]
    async fn failed_retrieval_without_cache_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let cache = FetchCache::new(dir.path(), FetchCacheConfig::default()).expect("cache");
        let err = cache
            .fetch("http://127.0.0.1:1/schedule.xml")
            .await
            .expect_err("no cache to fall back to");
        assert!(matches!(err, FetchError::Request { .. }));
    }

    #[tokio::test]
    async fn repeated_fetches_are_memoized_within_a_run() {
        let dir = tempdir().expect("tempdir");
        let cache = FetchCache::new(dir.path(), FetchCacheConfig::default()).expect("cache");

        let url = "http://127.0.0.1:1/schedule.xml";
        write_atomic(&cache.cache_path(url), b"<schedule/>")
            .await
            .expect("seed");
        cache.fetch(url).await.expect("first fetch");

        // Delete the disk entry: the memo alone must satisfy the repeat.
        std::fs::remove_file(cache.cache_path(url)).expect("remove");
        let doc = cache.fetch(url).await.expect("second fetch");
        assert_eq!(doc.bytes, b"<schedule/>");
    }

    #[tokio::test]
    async fn record_files_round_trip_through_yaml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("media_36c3.yml");
        let file = RecordFile {
            meta: FeedMeta {
                title: "36C3 media feed".into(),
                description: "Curated talks of the 36C3.".into(),
                image_url: None,
            },
            feed: vec![TalkRecord {
                title: "Some Talk".into(),
                categories: vec!["Technology".into()],
                ..TalkRecord::default()
            }],
        };

        save_record_file(&path, &file).await.expect("save");
        let loaded = load_record_file(&path).await.expect("load");
        assert_eq!(loaded, file);
    }

    #[test]
    fn listing_record_files_filters_and_sorts() {
        let dir = tempdir().expect("tempdir");
        for name in ["media_37c3.yml", "media_36c3.yml", "notes.txt", "feed_36c3.xml"] {
            std::fs::write(dir.path().join(name), b"").expect("write");
        }
        let files = list_record_files(dir.path()).expect("list");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["media_36c3.yml", "media_37c3.yml"]);
    }

    #[tokio::test]
    async fn clear_removes_cache_entries() {
        let dir = tempdir().expect("tempdir");
        let cache = FetchCache::new(dir.path(), FetchCacheConfig::default()).expect("cache");
        write_atomic(&cache.cache_path("http://a.test/x"), b"a")
            .await
            .expect("seed");
        write_atomic(&cache.cache_path("http://b.test/y"), b"b")
            .await
            .expect("seed");
        assert_eq!(cache.clear().expect("clear"), 2);
        assert_eq!(cache.clear().expect("clear again"), 0);
    }
}

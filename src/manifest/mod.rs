//! Firmware catalog resolution.
//!
//! Sources are tried strictly in order, first success wins:
//! user-selected file, primary URL, mirror URLs, bundled file, fallback
//! paths. When all of them fail the empty catalog is returned. A successful
//! resolution is cached until the custom file is set or cleared.
pub mod fetcher;

pub use fetcher::{FetchResponse, HttpFetcher, ManifestFetcher};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OnceCell};

use crate::config::Preferences;
use crate::events::{CoreEvent, EventSink};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("{source_label} fetch of {url} failed (attempt {attempt}): {reason}")]
    NetworkFetch {
        source_label: String,
        url: String,
        attempt: u32,
        reason: String,
    },

    #[error("Invalid manifest format in {origin}: {reason}")]
    InvalidFormat { origin: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to save preferences: {0}")]
    Preferences(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Catalog document. Unknown top-level keys are kept as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManifestDocument {
    #[serde(default)]
    pub product_list: Vec<Value>,
    #[serde(default)]
    pub firmware_list: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestDocument {
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ManifestError::InvalidFormat {
            origin: origin.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.product_list.is_empty() && self.firmware_list.is_empty()
    }
}

/// Where the current catalog came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum ManifestSource {
    Custom { path: PathBuf },
    Network { label: String, url: String },
    Bundled { path: PathBuf },
    Fallback { path: PathBuf },
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedManifest {
    pub document: ManifestDocument,
    pub source: ManifestSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    /// Wait `backoff_unit * attempt` after a failed attempt
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

/// URLs and files making up tiers 2 to 4
#[derive(Debug, Clone, Default)]
pub struct ManifestSources {
    pub primary_url: String,
    pub mirrors: Vec<String>,
    pub bundled: PathBuf,
    pub fallbacks: Vec<PathBuf>,
}

pub struct ManifestResolver {
    fetcher: Arc<dyn ManifestFetcher>,
    sources: ManifestSources,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
    preferences_path: PathBuf,
    custom: OnceCell<Mutex<Option<PathBuf>>>,
    cache: Mutex<ManifestCache>,
}

/// `generation` moves on every custom-file change so a resolution started
/// before the change is not stored afterwards
#[derive(Default)]
struct ManifestCache {
    generation: u64,
    resolved: Option<ResolvedManifest>,
}

impl ManifestResolver {
    pub fn new(
        fetcher: Arc<dyn ManifestFetcher>,
        sources: ManifestSources,
        events: Arc<dyn EventSink>,
        preferences_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            sources,
            retry: RetryPolicy::default(),
            events,
            preferences_path: preferences_path.into(),
            custom: OnceCell::new(),
            cache: Mutex::new(ManifestCache::default()),
        }
    }

    /// The custom path slot, read from preferences on first use
    async fn custom_slot(&self) -> &Mutex<Option<PathBuf>> {
        self.custom
            .get_or_init(|| async {
                let custom = Preferences::load(&self.preferences_path).await.custom_manifest_path;
                if let Some(path) = &custom {
                    log::info!("Custom manifest configured: {}", path.display());
                }
                Mutex::new(custom)
            })
            .await
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cached catalog, resolving it on first use
    pub async fn get_manifest(&self) -> ManifestDocument {
        self.get_resolved().await.document
    }

    /// The cache lock is not held while the tiers are walked
    pub async fn get_resolved(&self) -> ResolvedManifest {
        let generation = {
            let cache = self.cache.lock().await;
            if let Some(resolved) = cache.resolved.as_ref() {
                return resolved.clone();
            }
            cache.generation
        };

        let resolved = self.resolve().await;
        if resolved.source != ManifestSource::Empty {
            let mut cache = self.cache.lock().await;
            if cache.generation == generation {
                cache.resolved = Some(resolved.clone());
            }
        }
        resolved
    }

    pub async fn custom_manifest_path(&self) -> Option<PathBuf> {
        self.custom_slot().await.lock().await.clone()
    }

    /// Use `path` as the catalog from now on. The file must parse.
    pub async fn set_custom_manifest(&self, path: &Path) -> Result<ManifestDocument> {
        let document = ManifestDocument::read(path).await?;
        self.store_custom(Some(path.to_path_buf())).await?;
        log::info!("Custom manifest set to {}", path.display());
        Ok(document)
    }

    pub async fn clear_custom_manifest(&self) -> Result<()> {
        self.store_custom(None).await?;
        log::info!("Custom manifest cleared");
        Ok(())
    }

    async fn store_custom(&self, path: Option<PathBuf>) -> Result<()> {
        let mut preferences = Preferences::load(&self.preferences_path).await;
        preferences.custom_manifest_path = path.clone();
        preferences.save(&self.preferences_path).await?;

        *self.custom_slot().await.lock().await = path.clone();
        {
            let mut cache = self.cache.lock().await;
            cache.generation += 1;
            cache.resolved = None;
        }
        self.events.emit(CoreEvent::ManifestSourceChanged {
            custom_path: path.map(|p| p.to_string_lossy().into_owned()),
        });
        Ok(())
    }

    /// Walk every tier without consulting the cache
    pub async fn resolve(&self) -> ResolvedManifest {
        if let Some(resolved) = self.try_custom().await {
            return resolved;
        }
        if let Some(resolved) = self.try_network().await {
            return resolved;
        }

        log::error!(
            "All manifest URLs failed (primary and {} mirrors), trying local manifest...",
            self.sources.mirrors.len()
        );
        if let Some(document) = read_local(&self.sources.bundled).await {
            return ResolvedManifest {
                document,
                source: ManifestSource::Bundled {
                    path: self.sources.bundled.clone(),
                },
            };
        }
        for path in &self.sources.fallbacks {
            if let Some(document) = read_local(path).await {
                return ResolvedManifest {
                    document,
                    source: ManifestSource::Fallback { path: path.clone() },
                };
            }
        }

        log::error!("No manifest source available, using empty catalog");
        ResolvedManifest {
            document: ManifestDocument::default(),
            source: ManifestSource::Empty,
        }
    }

    async fn try_custom(&self) -> Option<ResolvedManifest> {
        let path = self.custom_manifest_path().await?;
        match ManifestDocument::read(&path).await {
            Ok(document) => {
                log::info!("[Manifest] Using custom manifest: {}", path.display());
                Some(ResolvedManifest {
                    document,
                    source: ManifestSource::Custom { path },
                })
            }
            Err(e) => {
                log::warn!("[Manifest] Custom manifest unusable, falling back: {}", e);
                None
            }
        }
    }

    async fn try_network(&self) -> Option<ResolvedManifest> {
        let primary = self.sources.primary_url.trim();
        let urls = std::iter::once(("primary".to_string(), primary))
            .chain(
                self.sources
                    .mirrors
                    .iter()
                    .enumerate()
                    .map(|(i, url)| (format!("mirror {}", i + 1), url.trim())),
            )
            .filter(|(_, url)| !url.is_empty());

        for (label, url) in urls {
            if let Some(document) = self.fetch_with_retry(&label, url).await {
                if label != "primary" {
                    log::info!("[Manifest] Using {} succeeded: {}", label, url);
                }
                return Some(ResolvedManifest {
                    document,
                    source: ManifestSource::Network {
                        label,
                        url: url.to_string(),
                    },
                });
            }
        }
        None
    }

    async fn fetch_with_retry(&self, label: &str, url: &str) -> Option<ManifestDocument> {
        for attempt in 1..=self.retry.attempts {
            match self.fetch_once(label, url, attempt).await {
                Ok(document) => return Some(document),
                Err(e) => log::warn!("[Manifest] {} ({}/{})", e, attempt, self.retry.attempts),
            }
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.backoff_unit * attempt).await;
            }
        }
        None
    }

    async fn fetch_once(&self, label: &str, url: &str, attempt: u32) -> Result<ManifestDocument> {
        let failure = |reason: String| ManifestError::NetworkFetch {
            source_label: label.to_string(),
            url: url.to_string(),
            attempt,
            reason,
        };

        let response = match tokio::time::timeout(self.retry.attempt_timeout, self.fetcher.get(url)).await {
            Err(_) => return Err(failure(format!("timed out after {:?}", self.retry.attempt_timeout))),
            Ok(Err(e)) => return Err(failure(e.to_string())),
            Ok(Ok(response)) => response,
        };

        if response.status != 200 {
            return Err(failure(format!("HTTP {}", response.status)));
        }
        ManifestDocument::parse(&response.body, url)
    }
}

async fn read_local(path: &Path) -> Option<ManifestDocument> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return None;
    }
    match ManifestDocument::read(path).await {
        Ok(document) => {
            log::info!("[Manifest] Using local manifest: {}", path.display());
            Some(document)
        }
        Err(e) => {
            log::warn!("[Manifest] Failed to parse local file: {}", e);
            None
        }
    }
}

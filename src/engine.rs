//! Component wiring. One `Engine` per process, built at startup.
use std::sync::Arc;

use anyhow::Context;

use crate::analysis::{AnalysisOutcome, FirmwareAnalyzer, ScriptAnalyzer, SecondaryAnalyzer};
use crate::config::{AppConfig, AppPaths};
use crate::download::DownloadService;
use crate::events::EventSink;
use crate::files::{FilePicker, NoPicker};
use crate::flash::FlashOrchestrator;
use crate::manifest::{HttpFetcher, ManifestFetcher, ManifestResolver, ManifestSources, RetryPolicy};
use crate::serial::watcher::DEFAULT_POLL_INTERVAL;
use crate::serial::{PortArbiter, PortWatcher, SerialBackend, SystemSerialBackend};
use crate::tool::{ProcessRunner, ToolResolver, ToolRunner};

pub struct Engine {
    pub paths: AppPaths,
    pub config: AppConfig,
    pub events: Arc<dyn EventSink>,
    pub arbiter: Arc<PortArbiter>,
    pub watcher: PortWatcher,
    pub analyzer: FirmwareAnalyzer,
    pub secondary: Option<Arc<dyn SecondaryAnalyzer>>,
    pub flasher: FlashOrchestrator,
    pub downloads: DownloadService,
    pub manifest: ManifestResolver,
    pub picker: Arc<dyn FilePicker>,
}

impl Engine {
    /// Discover paths, load configuration and wire the system implementations.
    /// Fails when a required configuration key is missing.
    pub fn bootstrap(packaged: bool, events: Arc<dyn EventSink>, picker: Arc<dyn FilePicker>) -> anyhow::Result<Self> {
        let paths = AppPaths::discover(packaged).context("Failed to locate application directories")?;
        let config = AppConfig::load(&paths).context("Invalid application configuration")?;
        log::info!(
            "Configuration loaded: manifest {} (+{} mirrors), api {}",
            config.manifest_url(),
            config.firmware_manifest_mirrors.len(),
            config.api_base_url()
        );

        let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new());
        let secondary = ScriptAnalyzer::with_system_python(paths.analysis_script(), runner.clone())
            .map(|s| Arc::new(s) as Arc<dyn SecondaryAnalyzer>);
        if secondary.is_none() {
            log::warn!("python3 not found on PATH, secondary analysis disabled");
        }

        let engine = EngineBuilder::new(paths, config, events)
            .runner(runner)
            .picker(picker)
            .secondary(secondary)
            .build();
        log::info!("FlashHub engine started");
        Ok(engine)
    }

    pub fn builder(paths: AppPaths, config: AppConfig, events: Arc<dyn EventSink>) -> EngineBuilder {
        EngineBuilder::new(paths, config, events)
    }

    /// Tool heuristics first, then the secondary analyzer if one is configured
    pub async fn analyze(&self, file: &std::path::Path) -> AnalysisOutcome {
        let outcome = self.analyzer.analyze(file).await;
        if outcome.result().is_some() {
            return outcome;
        }
        let Some(secondary) = &self.secondary else {
            return outcome;
        };

        log::info!("Falling back to secondary analyzer for {}", file.display());
        match secondary.analyze(file).await {
            Some(result) => AnalysisOutcome::Identified(result),
            None => AnalysisOutcome::Inconclusive,
        }
    }
}

/// Swaps in alternative backends; defaults are the system ones
pub struct EngineBuilder {
    paths: AppPaths,
    config: AppConfig,
    events: Arc<dyn EventSink>,
    serial_backend: Arc<dyn SerialBackend>,
    runner: Arc<dyn ToolRunner>,
    fetcher: Arc<dyn ManifestFetcher>,
    picker: Arc<dyn FilePicker>,
    secondary: Option<Arc<dyn SecondaryAnalyzer>>,
    resolver: Option<ToolResolver>,
    retry: RetryPolicy,
}

impl EngineBuilder {
    pub fn new(paths: AppPaths, config: AppConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            paths,
            config,
            events,
            serial_backend: Arc::new(SystemSerialBackend::new()),
            runner: Arc::new(ProcessRunner::new()),
            fetcher: Arc::new(HttpFetcher::new()),
            picker: Arc::new(NoPicker),
            secondary: None,
            resolver: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn serial_backend(mut self, backend: Arc<dyn SerialBackend>) -> Self {
        self.serial_backend = backend;
        self
    }

    pub fn runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ManifestFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn picker(mut self, picker: Arc<dyn FilePicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn secondary(mut self, secondary: Option<Arc<dyn SecondaryAnalyzer>>) -> Self {
        self.secondary = secondary;
        self
    }

    pub fn tool_resolver(mut self, resolver: ToolResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Engine {
        let Self {
            paths,
            config,
            events,
            serial_backend,
            runner,
            fetcher,
            picker,
            secondary,
            resolver,
            retry,
        } = self;

        let resolver = resolver.unwrap_or_else(|| paths.tool_resolver());
        let arbiter = Arc::new(PortArbiter::new(serial_backend.clone(), events.clone()));
        let watcher = PortWatcher::new(serial_backend, events.clone(), DEFAULT_POLL_INTERVAL);
        let analyzer = FirmwareAnalyzer::new(resolver.clone(), runner.clone(), events.clone(), paths.temp_dir.clone());
        let flasher = FlashOrchestrator::new(arbiter.clone(), resolver, runner, events.clone(), paths.dump_dir());
        let downloads = DownloadService::new(paths.download_dir(), events.clone());

        let sources = ManifestSources {
            primary_url: config.manifest_url().to_string(),
            mirrors: config.firmware_manifest_mirrors.clone(),
            bundled: paths.bundled_manifest(),
            fallbacks: paths.fallback_manifests(),
        };
        let manifest =
            ManifestResolver::new(fetcher, sources, events.clone(), paths.preferences_file()).with_retry_policy(retry);

        Engine {
            paths,
            config,
            events,
            arbiter,
            watcher,
            analyzer,
            secondary,
            flasher,
            downloads,
            manifest,
            picker,
        }
    }
}

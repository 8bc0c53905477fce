// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Running the build pipeline.

[Orchestrator::run] executes the phases fetch, index, assemble, sign and
publish in order, stopping after [BuildOptions::run_through]. Work whose
inputs are unchanged is skipped:

* fetch reuses cached content;
* index reuses parse results stored per content digest;
* assemble keeps the previous `Release` date when the fingerprint of its
  inputs matches the one in `state.json`, so unchanged inputs produce
  byte-identical output;
* sign keeps existing signatures that verify;
* publish transfers only the difference.
*/

use {
    crate::{
        config::BuilderConfig,
        destination::{
            github::GitHubDestination, local::LocalDestination, DestinationLocator,
            PublishDestination,
        },
        error::{AssemblyError, BuildError, FetchError, Phase, PublishError, Result, SigningError},
        event::{BuildEvent, EventSink},
        fetcher::{ArtifactFetcher, ContentCache, FetchOptions, FetchOutput, FetchedAsset},
        index::{IndexSet, PackageIndexer},
        io::{sha256_hex, Compression, MultiContentDigest},
        package::ParsedDeb,
        publisher::{PublishOptions, Publisher},
        repository::{
            assembler::RepositoryAssembler,
            writer::{FilesystemRepositoryWriter, MemoryRepositoryWriter, RepositoryWriter},
            RepositoryLayout,
        },
        signer::{ReleaseSigner, SignOutcome},
        signing_key::{KeyOrigin, KeyStore, SigningKey},
        source::{github::GitHubSource, local::LocalSource, ReleaseSource, SourceLocator},
    },
    chrono::{DateTime, Utc},
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        io::{Cursor, Write},
        path::Path,
    },
    tokio_util::sync::CancellationToken,
};

const STATE_VERSION: u32 = 1;
const MANIFEST_VERSION: u32 = 1;

/// Persisted memoization state of the assemble phase.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct BuildState {
    version: u32,
    /// Digest of everything the assembled tree depends on.
    fingerprint: String,
    /// RFC 3339 `Release` date of the assembled tree.
    release_date: String,
}

/// The assets of the last online fetch.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct FetchManifest {
    version: u32,
    source: String,
    release: String,
    assets: Vec<FetchedAsset>,
}

/// Inputs of the assemble phase.
#[derive(Serialize)]
struct AssemblyInputs<'a> {
    assets: Vec<(&'a str, &'a str)>,
    codename: &'a str,
    suite: &'a Option<String>,
    origin: &'a Option<String>,
    label: &'a Option<String>,
    description: &'a Option<String>,
    components: &'a [String],
    architectures: &'a [String],
    compressions: &'a [Compression],
    valid_days: Option<u32>,
    public_url: Option<String>,
    layout: RepositoryLayout,
    sign: bool,
    preserve_stale: bool,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let data = std::fs::read(path).ok()?;

    match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(&data)?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// What to run.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Last phase to execute.
    pub run_through: Phase,
    /// Assemble in memory and report the publish plan without changing anything.
    pub dry_run: bool,
    /// Use the persisted fetch manifest instead of contacting the source.
    pub offline: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            run_through: Phase::Publish,
            dry_run: false,
            offline: false,
        }
    }
}

/// Summary of a build.
#[derive(Clone, Debug, Default)]
pub struct BuildReport {
    /// Phases that ran to completion, in order.
    pub completed: Vec<Phase>,
    /// Phases that had nothing to do.
    pub skipped: Vec<Phase>,

    pub assets: usize,
    pub downloaded: usize,
    pub cached: usize,

    pub packages: usize,
    /// Assets whose control data came from the parse cache.
    pub parse_cache_hits: usize,

    pub files_written: usize,
    pub files_unchanged: usize,
    pub files_pruned: usize,
    /// Whether assembly inputs matched the previous build.
    pub assembly_inputs_unchanged: bool,
    /// Exact `Release` content.
    pub release: Option<Vec<u8>>,

    pub key_id: Option<String>,
    pub key_generated: bool,
    pub signing: Option<SignOutcome>,

    pub uploaded: usize,
    pub deleted: usize,
    pub publish_unchanged: usize,
    pub promoted: bool,
}

impl std::fmt::Display for BuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for phase in &self.completed {
            match phase {
                Phase::Fetch => writeln!(
                    f,
                    "fetch: {} assets ({} downloaded, {} cached)",
                    self.assets, self.downloaded, self.cached
                )?,
                Phase::Index => writeln!(
                    f,
                    "index: {} packages ({} from parse cache)",
                    self.packages, self.parse_cache_hits
                )?,
                Phase::Assemble => writeln!(
                    f,
                    "assemble: {} written, {} unchanged, {} pruned",
                    self.files_written, self.files_unchanged, self.files_pruned
                )?,
                Phase::Sign => writeln!(
                    f,
                    "sign: key {}{}, {}",
                    self.key_id.as_deref().unwrap_or("<none>"),
                    if self.key_generated { " (generated)" } else { "" },
                    match self.signing {
                        Some(SignOutcome::Signed) => "signed",
                        Some(SignOutcome::Unchanged) => "signatures unchanged",
                        None => "not signed",
                    }
                )?,
                Phase::Publish => writeln!(
                    f,
                    "publish: {} uploaded, {} deleted, {} unchanged{}",
                    self.uploaded,
                    self.deleted,
                    self.publish_unchanged,
                    if self.promoted { "" } else { " (not promoted)" }
                )?,
            }
        }

        for phase in &self.skipped {
            writeln!(f, "{}: skipped", phase)?;
        }

        Ok(())
    }
}

/// Sequences the build phases.
pub struct Orchestrator {
    config: BuilderConfig,
    source: Box<dyn ReleaseSource>,
    destination: Option<Box<dyn PublishDestination>>,
    cancel: CancellationToken,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(
        config: BuilderConfig,
        source: Box<dyn ReleaseSource>,
        destination: Option<Box<dyn PublishDestination>>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            cancel: CancellationToken::new(),
            events: EventSink::default(),
        }
    }

    /// Construct collaborators from configuration.
    pub fn from_config(config: BuilderConfig) -> Result<Self> {
        config.validate()?;

        let source: Box<dyn ReleaseSource> = match config.source_locator()? {
            SourceLocator::GitHub { owner, repo } => Box::new(
                GitHubSource::new(
                    config.github_api_url.as_deref(),
                    owner,
                    repo,
                    config.github_token(),
                )
                .map_err(FetchError::from)?,
            ),
            SourceLocator::Local(path) => Box::new(LocalSource::new(path)),
        };

        let destination: Option<Box<dyn PublishDestination>> = match config.destination_locator()? {
            Some(DestinationLocator::Local(path)) => Some(Box::new(LocalDestination::new(path))),
            Some(DestinationLocator::GitHubRelease { owner, repo, .. }) => {
                let tag = config
                    .destination_tag()?
                    .unwrap_or_else(|| format!("apt-{}", config.codename));

                Some(Box::new(
                    GitHubDestination::new(
                        config.github_api_url.as_deref(),
                        owner,
                        repo,
                        tag,
                        config.github_token(),
                    )
                    .map_err(PublishError::from)?,
                ))
            }
            None => None,
        };

        Ok(Self::new(config, source, destination))
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn begin(&self, phase: Phase) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled(phase));
        }

        info!("{} phase", phase);
        self.events.emit(BuildEvent::PhaseStarted(phase));

        Ok(())
    }

    /// Record a finished phase, returning whether the pipeline stops here.
    fn finish(&self, phase: Phase, options: &BuildOptions, report: &mut BuildReport) -> bool {
        self.events.emit(BuildEvent::PhaseFinished(phase));
        report.completed.push(phase);

        options.run_through == phase
    }

    fn skip(&self, phase: Phase, options: &BuildOptions, report: &mut BuildReport) -> bool {
        self.events.emit(BuildEvent::PhaseSkipped(phase));
        report.skipped.push(phase);

        options.run_through == phase
    }

    /// Run the pipeline.
    pub async fn run(&self, options: &BuildOptions) -> Result<BuildReport> {
        self.config.validate()?;
        let mut report = BuildReport::default();

        self.begin(Phase::Fetch)?;
        let cache = ContentCache::open(self.config.cache_dir())?;
        let assets = self.fetch(&cache, options, &mut report).await?;
        if self.finish(Phase::Fetch, options, &mut report) {
            return Ok(report);
        }

        self.begin(Phase::Index)?;
        let indices = self.index(&assets, &mut report).await?;
        if self.finish(Phase::Index, options, &mut report) {
            return Ok(report);
        }

        self.begin(Phase::Assemble)?;
        let writer: Box<dyn RepositoryWriter> = if options.dry_run {
            Box::new(MemoryRepositoryWriter::default())
        } else {
            Box::new(FilesystemRepositoryWriter::new(self.config.repository_dir()))
        };
        let release = self
            .assemble(writer.as_ref(), &assets, &indices, options, &mut report)
            .await?;
        if self.finish(Phase::Assemble, options, &mut report) {
            return Ok(report);
        }

        if self.config.sign {
            self.begin(Phase::Sign)?;
            let signed = self
                .sign(writer.as_ref(), &release, options, &mut report)
                .await?;
            let stop = if signed {
                self.finish(Phase::Sign, options, &mut report)
            } else {
                self.skip(Phase::Sign, options, &mut report)
            };
            if stop {
                return Ok(report);
            }
        } else {
            info!("signing is disabled");
            if self.skip(Phase::Sign, options, &mut report) {
                return Ok(report);
            }
        }

        match &self.destination {
            Some(destination) => {
                self.begin(Phase::Publish)?;
                self.publish(destination.as_ref(), writer.as_ref(), options, &mut report)
                    .await?;
                self.finish(Phase::Publish, options, &mut report);
            }
            None => {
                info!("no destination configured; not publishing");
                self.skip(Phase::Publish, options, &mut report);
            }
        }

        Ok(report)
    }

    async fn fetch(
        &self,
        cache: &ContentCache,
        options: &BuildOptions,
        report: &mut BuildReport,
    ) -> Result<Vec<FetchedAsset>> {
        let manifest_path = self.config.fetch_manifest_path();
        let source = self.config.source_locator()?.to_string();

        let output = if options.offline {
            let manifest = read_json::<FetchManifest>(&manifest_path)
                .filter(|m| m.version == MANIFEST_VERSION)
                .ok_or_else(|| {
                    FetchError::NotFound(format!(
                        "offline build requires a fetch manifest at {}",
                        manifest_path.display()
                    ))
                })?;

            if manifest.source != source || manifest.release != self.config.release {
                return Err(FetchError::NotFound(format!(
                    "fetch manifest is for release {} of {}",
                    manifest.release, manifest.source
                ))
                .into());
            }

            for asset in &manifest.assets {
                if !cache.verify(&asset.sha256).await? {
                    return Err(FetchError::NotFound(format!(
                        "{} is not cached; an online build is required",
                        asset.asset.name
                    ))
                    .into());
                }
            }

            info!("offline: using {} assets from {}", manifest.assets.len(), manifest_path.display());
            FetchOutput {
                cached: manifest.assets.len(),
                assets: manifest.assets,
                downloaded: 0,
            }
        } else {
            let fetcher = ArtifactFetcher::new(
                self.source.as_ref(),
                cache,
                FetchOptions {
                    concurrency: self.config.concurrency,
                    retry: self.config.retry_policy(),
                    asset_pattern: self.config.asset_regex()?,
                },
                self.cancel.clone(),
                self.events.clone(),
            );
            let output = fetcher.fetch(&self.config.release_selector()).await?;

            if !options.dry_run {
                let manifest = FetchManifest {
                    version: MANIFEST_VERSION,
                    source,
                    release: self.config.release.clone(),
                    assets: output.assets.clone(),
                };
                write_json(&manifest_path, &manifest).map_err(|e| {
                    FetchError::CacheIo(format!("{}", manifest_path.display()), e)
                })?;
            }

            output
        };

        report.assets = output.assets.len();
        report.downloaded = output.downloaded;
        report.cached = output.cached;

        Ok(output.assets)
    }

    async fn index(&self, assets: &[FetchedAsset], report: &mut BuildReport) -> Result<IndexSet> {
        let indexer = PackageIndexer::new(
            self.config.components.clone(),
            self.config.architectures.iter().cloned(),
        )
        .with_layout(self.config.layout()?);
        let parse_cache = self.config.parse_cache_dir();

        let mut packages = vec![];
        for fetched in assets {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled(Phase::Index));
            }

            let cached_path = parse_cache.join(format!("{}.json", fetched.sha256));
            let parsed = match read_json::<ParsedDeb>(&cached_path)
                .filter(|p| p.digest.sha256 == fetched.sha256)
            {
                Some(parsed) => {
                    debug!("{}: using cached control data", fetched.asset.name);
                    report.parse_cache_hits += 1;
                    parsed
                }
                None => {
                    let parsed = self.parse(&indexer, fetched).await?;
                    if let Err(e) = write_json(&cached_path, &parsed) {
                        warn!("unable to write {}: {}", cached_path.display(), e);
                    }
                    parsed
                }
            };

            packages.push(indexer.package(&fetched.asset.name, &parsed)?);
        }

        let indices = indexer.build(packages);
        report.packages = indices.packages.len();
        info!(
            "indexed {} packages into {} indices",
            indices.packages.len(),
            indices.indices.len()
        );

        Ok(indices)
    }

    async fn parse(&self, indexer: &PackageIndexer, fetched: &FetchedAsset) -> Result<ParsedDeb> {
        let data = tokio::fs::read(&fetched.path)
            .await
            .map_err(|e| FetchError::CacheIo(format!("{}", fetched.path.display()), e))?;

        let indexer = indexer.clone();
        let name = fetched.asset.name.clone();
        debug!("reading control file of {}", name);

        let parsed = tokio::task::spawn_blocking(move || {
            let digest = MultiContentDigest::of(&data);
            indexer.parse_deb(&name, Cursor::new(data), digest)
        })
        .await
        .map_err(|e| {
            FetchError::CacheIo(
                fetched.asset.name.clone(),
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })??;

        Ok(parsed)
    }

    fn fingerprint(&self, assets: &[FetchedAsset]) -> Result<String> {
        let mut asset_digests = assets
            .iter()
            .map(|a| (a.asset.name.as_str(), a.sha256.as_str()))
            .collect::<Vec<_>>();
        asset_digests.sort_unstable();

        let inputs = AssemblyInputs {
            assets: asset_digests,
            codename: &self.config.codename,
            suite: &self.config.suite,
            origin: &self.config.origin,
            label: &self.config.label,
            description: &self.config.description,
            components: &self.config.components,
            architectures: &self.config.architectures,
            compressions: &self.config.index_compressions,
            valid_days: self.config.valid_days,
            public_url: self.config.public_url()?,
            layout: self.config.layout()?,
            sign: self.config.sign,
            preserve_stale: self.config.preserve_stale,
        };
        let data = serde_json::to_vec(&inputs)
            .map_err(|e| BuildError::Config(format!("unable to fingerprint inputs: {}", e)))?;

        Ok(sha256_hex(&data))
    }

    async fn assemble(
        &self,
        writer: &dyn RepositoryWriter,
        assets: &[FetchedAsset],
        indices: &IndexSet,
        options: &BuildOptions,
        report: &mut BuildReport,
    ) -> Result<Vec<u8>> {
        let fingerprint = self.fingerprint(assets)?;
        let state_path = self.config.state_path();

        let previous_date = read_json::<BuildState>(&state_path)
            .filter(|s| s.version == STATE_VERSION && s.fingerprint == fingerprint)
            .and_then(|s| DateTime::parse_from_rfc3339(&s.release_date).ok())
            .map(|d| d.with_timezone(&Utc));

        let date = match previous_date {
            Some(date) => {
                debug!("assembly inputs unchanged; keeping Release date {}", date);
                report.assembly_inputs_unchanged = true;
                date
            }
            None => Utc::now(),
        };

        let paths = assets
            .iter()
            .map(|a| (a.asset.name.clone(), a.path.clone()))
            .collect::<BTreeMap<_, _>>();

        let assembler = RepositoryAssembler::new(writer, self.config.assembly_options()?);
        let output = assembler.assemble(indices, &paths, date).await?;

        if !options.dry_run {
            let state = BuildState {
                version: STATE_VERSION,
                fingerprint,
                release_date: date.to_rfc3339(),
            };
            write_json(&state_path, &state)
                .map_err(|e| AssemblyError::IoFailure(format!("{}", state_path.display()), e))?;
        }

        report.files_written = output.written;
        report.files_unchanged = output.unchanged;
        report.files_pruned = output.pruned.len();
        report.release = Some(output.release_bytes.clone());

        Ok(output.release_bytes)
    }

    async fn load_key(&self, options: &BuildOptions) -> Result<Option<(SigningKey, KeyOrigin)>> {
        let store = KeyStore::new(self.config.key_path());

        // Dry runs never create keys.
        if options.dry_run && !store.path().exists() {
            warn!(
                "dry run: no key at {}; signatures not computed",
                store.path().display()
            );
            return Ok(None);
        }

        let request = self.config.key_request()?;
        let key = tokio::task::spawn_blocking(move || store.load_or_generate(&request))
            .await
            .map_err(|e| {
                SigningError::Io(
                    "key store".to_string(),
                    std::io::Error::new(std::io::ErrorKind::Other, e),
                )
            })??;

        Ok(Some(key))
    }

    /// Returns whether signatures are present.
    async fn sign(
        &self,
        writer: &dyn RepositoryWriter,
        release: &[u8],
        options: &BuildOptions,
        report: &mut BuildReport,
    ) -> Result<bool> {
        let (key, origin) = match self.load_key(options).await? {
            Some(key) => key,
            None => return Ok(false),
        };

        if origin == KeyOrigin::Generated {
            info!(
                "generated signing key {} for {}",
                key.key_id(),
                key.user_id()
            );
        }
        report.key_id = Some(key.key_id().to_string());
        report.key_generated = origin == KeyOrigin::Generated;

        let signer = ReleaseSigner::new(key);
        let outcome = signer
            .sign_tree(writer, &self.config.assembly_options()?, release)
            .await?;
        report.signing = Some(outcome);

        Ok(true)
    }

    async fn publish(
        &self,
        destination: &dyn PublishDestination,
        tree: &dyn RepositoryWriter,
        options: &BuildOptions,
        report: &mut BuildReport,
    ) -> Result<()> {
        let publisher = Publisher::new(
            destination,
            PublishOptions {
                concurrency: self.config.concurrency,
                retry: self.config.retry_policy(),
                delete_existing: self.config.delete_existing_published,
                dry_run: options.dry_run,
            },
            self.cancel.clone(),
            self.events.clone(),
        );

        let output = publisher.publish(tree).await?;

        report.uploaded = output.uploaded;
        report.deleted = output.deleted;
        report.publish_unchanged = output.plan.unchanged.len();
        report.promoted = output.promoted;

        Ok(())
    }
}

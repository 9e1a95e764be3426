use anyhow::{anyhow, Result};
use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tornet_core::{
    atomic_write_bytes, copy_dir_recursive, ensure_dir, CommandRunner, CommandSpec, OrderedKv,
};
use tracing::{debug, info, warn};

const TOOLCHAIN_BIN: &str = "tornettools";
const SIMULATOR_BIN: &str = "shadow";
const ARCHIVE_BIN: &str = "tar";
const USERSTATS_REF: &str = "userstats.csv";
const GEOIP_REF: &str = "geoip";
const TMODEL_REF: &str = "tmodel-ccs2018.github.io";
const TRACE_EVENTS: &str = "BW,CIRC,STREAM";
const TORRC_REL_PATH: &str = "conf/tor.markovclient.torrc";
const COMPLETION_MARKER: &str = "shadow.log";
const DIRTINESS_KEY: &str = "MaxCircuitDirtiness";
const VANILLA_NAME: &str = "vanilla";
const MANIFEST_NAME: &str = "manifest.json";

pub struct SweepResult {
    pub project_dir: PathBuf,
    pub experiment_name: String,
    pub dialect: ToolCapabilities,
    pub staged: bool,
    pub generated: bool,
    pub variants: Vec<ExperimentVariant>,
}

pub struct SweepPreview {
    pub experiment_name: String,
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub artifact_urls: Vec<String>,
    pub variant_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExperimentVariant {
    pub name: String,
    pub path: PathBuf,
    pub source: VariantSource,
    pub dirtiness: Option<u64>,
    pub simulated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantSource {
    Generated,
    Cloned,
    CloneFailed { reason: String },
}

impl VariantSource {
    pub fn label(&self) -> &'static str {
        match self {
            VariantSource::Generated => "generated",
            VariantSource::Cloned => "cloned",
            VariantSource::CloneFailed { .. } => "clone_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub bucket: DateBucket,
    pub dirtiness: Vec<u64>,
    pub scale: f64,
    pub seed: u64,
    pub output_root: PathBuf,
    pub data_root: PathBuf,
    pub stage_policy: StagePolicy,
    pub workers: Option<usize>,
    pub bin_dir: Option<PathBuf>,
    pub sources: Vec<ArtifactSource>,
}

impl SweepPlan {
    pub fn new(bucket: DateBucket) -> Self {
        SweepPlan {
            bucket,
            dirtiness: Vec::new(),
            scale: 0.01,
            seed: 1,
            output_root: PathBuf::from("."),
            data_root: PathBuf::from("."),
            stage_policy: StagePolicy::Always,
            workers: None,
            bin_dir: None,
            sources: default_sources(),
        }
    }

    pub fn experiment_name(&self) -> String {
        let overrides = self
            .dirtiness
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}-seed-{}-dirty-{}-scale-{}",
            self.bucket.label(),
            self.seed,
            overrides,
            self.scale
        )
    }

    pub fn project_dir(&self) -> PathBuf {
        self.output_root.join(self.experiment_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBucket {
    year: i32,
    month: u32,
}

impl DateBucket {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if month == 0 || month > 12 {
            return Err(anyhow!("month must be between 1 and 12, got {}", month));
        }
        Ok(DateBucket { year, month })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let (year, month) = text
            .split_once('-')
            .ok_or_else(|| anyhow!("expected a YYYY-MM date, got {:?}", text))?;
        let year: i32 = year
            .parse()
            .map_err(|_| anyhow!("invalid year in {:?}", text))?;
        let month: u32 = month
            .parse()
            .map_err(|_| anyhow!("invalid month in {:?}", text))?;
        DateBucket::new(year, month)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn last_day(&self) -> u32 {
        let next = if self.month == 12 {
            NaiveDate::from_ymd_opt(self.year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(self.year, self.month + 1, 1)
        };
        next.and_then(|d| d.pred_opt()).map_or(30, |d| d.day())
    }
}

#[derive(Debug, Clone)]
pub struct BucketPaths {
    pub data_dir: PathBuf,
    pub consensus_dir: PathBuf,
    pub server_dir: PathBuf,
    pub onionperf_dir: PathBuf,
    pub bandwidth_file: PathBuf,
    pub staged_dir: PathBuf,
}

impl BucketPaths {
    pub fn resolve(data_root: &Path, bucket: &DateBucket) -> Self {
        let label = bucket.label();
        let data_dir = data_root.join("data").join(&label);
        BucketPaths {
            consensus_dir: data_dir.join(format!("consensuses-{}", label)),
            server_dir: data_dir.join(format!("server-descriptors-{}", label)),
            onionperf_dir: data_dir.join(format!("onionperf-{}", label)),
            bandwidth_file: data_dir.join("bandwidth.csv"),
            staged_dir: data_dir.join("output"),
            data_dir,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactSource {
    pub url: String,
}

impl ArtifactSource {
    pub fn new(url: impl Into<String>) -> Self {
        ArtifactSource { url: url.into() }
    }

    /// Substitutes the zero-padded bucket fields into the URL template.
    pub fn resolve(&self, bucket: &DateBucket) -> String {
        self.url
            .replace("{year}", &format!("{:04}", bucket.year()))
            .replace("{month}", &format!("{:02}", bucket.month()))
            .replace("{last_day}", &format!("{:02}", bucket.last_day()))
    }

    /// Local file name: the URL's last path segment, query stripped.
    pub fn file_name(&self, bucket: &DateBucket) -> String {
        let resolved = self.resolve(bucket);
        let tail = resolved.rsplit('/').next().unwrap_or(&resolved);
        tail.split('?').next().unwrap_or(tail).to_string()
    }
}

pub fn default_sources() -> Vec<ArtifactSource> {
    vec![
        ArtifactSource::new("https://collector.torproject.org/archive/relay-descriptors/consensuses/consensuses-{year}-{month}.tar.xz"),
        ArtifactSource::new("https://collector.torproject.org/archive/relay-descriptors/server-descriptors/server-descriptors-{year}-{month}.tar.xz"),
        ArtifactSource::new("https://collector.torproject.org/archive/onionperf/onionperf-{year}-{month}.tar.xz"),
        ArtifactSource::new("https://metrics.torproject.org/bandwidth.csv?start={year}-{month}-01&end={year}-{month}-{last_day}"),
    ]
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    sources: Vec<ArtifactSource>,
}

/// Reads a YAML file with a `sources:` list of `url:` templates.
pub fn load_sources(path: &Path) -> Result<Vec<ArtifactSource>> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read sources file {}: {}", path.display(), e))?;
    let parsed: SourcesFile = serde_yaml::from_str(&text)
        .map_err(|e| anyhow!("failed to parse sources file {}: {}", path.display(), e))?;
    if parsed.sources.is_empty() {
        return Err(anyhow!("sources file {} lists no sources", path.display()));
    }
    Ok(parsed.sources)
}

pub struct FetchedBody {
    pub status: u16,
    pub body: Vec<u8>,
}

/// HTTP seam for acquisition; whether a status counts as success is the
/// cache's call.
pub trait Fetcher {
    fn get(&self, url: &str) -> Result<FetchedBody>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        // Archives run to hundreds of megabytes, past the default read timeout.
        let client = reqwest::blocking::Client::builder().timeout(None).build()?;
        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn get(&self, url: &str) -> Result<FetchedBody> {
        let response = self.client.get(url).send()?;
        let status = response.status().as_u16();
        let body = response.bytes()?.to_vec();
        Ok(FetchedBody { status, body })
    }
}

pub struct ArtifactCache<'a> {
    sources: &'a [ArtifactSource],
    fetcher: &'a dyn Fetcher,
    runner: &'a dyn CommandRunner,
}

impl<'a> ArtifactCache<'a> {
    pub fn new(
        sources: &'a [ArtifactSource],
        fetcher: &'a dyn Fetcher,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        ArtifactCache {
            sources,
            fetcher,
            runner,
        }
    }

    pub fn is_complete(&self, bucket: &DateBucket, paths: &BucketPaths) -> bool {
        self.sources
            .iter()
            .all(|source| paths.data_dir.join(source.file_name(bucket)).is_file())
    }

    /// Fetches whatever is missing. Present files are trusted as-is, a
    /// non-200 response leaves that artifact absent, and archives are
    /// extracted immediately after download.
    pub fn ensure(&self, bucket: &DateBucket, paths: &BucketPaths) -> Result<()> {
        ensure_dir(&paths.data_dir)?;
        for source in self.sources {
            let url = source.resolve(bucket);
            let target = paths.data_dir.join(source.file_name(bucket));
            if target.is_file() {
                info!("{} already exists", target.display());
                continue;
            }
            info!("getting {}", url);
            let fetched = self.fetcher.get(&url)?;
            if fetched.status != 200 {
                warn!("{} answered {}, leaving artifact absent", url, fetched.status);
                continue;
            }
            atomic_write_bytes(&target, &fetched.body)?;
            if is_archive_name(&target) {
                self.extract(&target, &paths.data_dir)?;
            }
        }
        Ok(())
    }

    fn extract(&self, archive: &Path, dir: &Path) -> Result<()> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());
        let spec = CommandSpec::new(ARCHIVE_BIN)
            .arg("xaf")
            .arg(name)
            .current_dir(dir);
        let out = self.runner.run(&spec)?;
        if !out.success() {
            return Err(anyhow!(
                "extraction of {} failed with status {}",
                archive.display(),
                out.status_label()
            ));
        }
        Ok(())
    }
}

fn is_archive_name(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.ends_with(".tar.xz")
        || name.ends_with(".tar.gz")
        || name.ends_with(".tar.bz2")
        || name.ends_with(".tar")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCapabilities {
    Legacy,
    Current,
}

impl ToolCapabilities {
    pub fn from_major(major: u32) -> Self {
        if major >= 2 {
            ToolCapabilities::Current
        } else {
            ToolCapabilities::Legacy
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ToolCapabilities::Legacy => "legacy",
            ToolCapabilities::Current => "current",
        }
    }

    pub fn needs_topology_model(&self) -> bool {
        matches!(self, ToolCapabilities::Legacy)
    }

    pub fn wants_network_info(&self) -> bool {
        matches!(self, ToolCapabilities::Current)
    }

    /// The flag string handed through the simulate step's passthrough option.
    pub fn simulator_args(&self, workers: usize, seed: u64) -> String {
        match self {
            ToolCapabilities::Legacy => format!("-i node,ram -w {} -s {}", workers, seed),
            ToolCapabilities::Current => format!(
                "-p {} --seed {} --template-directory shadow.data.template",
                workers, seed
            ),
        }
    }
}

/// Asks the simulator for its version once and condenses the answer into a
/// dialect. No fallback: an unparseable answer aborts the run.
pub fn probe_simulator(runner: &dyn CommandRunner) -> Result<ToolCapabilities> {
    let spec = CommandSpec::new(SIMULATOR_BIN).arg("--version");
    let out = runner.run_captured(&spec)?;
    let major = parse_simulator_version(&out.stdout)?;
    Ok(ToolCapabilities::from_major(major))
}

fn parse_simulator_version(stdout: &str) -> Result<u32> {
    let pattern = Regex::new(r"(?i)shadow\s+v?(\d+)\.")?;
    let caps = pattern
        .captures(stdout)
        .ok_or_else(|| anyhow!("no version in simulator output: {:?}", stdout.trim()))?;
    let major = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    major
        .parse()
        .map_err(|_| anyhow!("unparseable major version in {:?}", stdout.trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePolicy {
    /// Re-stage on every run.
    Always,
    /// Skip when the staged output already satisfies the detected dialect.
    IfMissing,
}

/// The staged output is only provably complete when the dialect names a file
/// to look for; the legacy dialect has no anchor file and never skips.
pub fn staging_complete(caps: ToolCapabilities, paths: &BucketPaths) -> bool {
    caps.wants_network_info() && StagedBundle::scan(&paths.staged_dir).network_info.is_some()
}

pub fn should_stage(policy: StagePolicy, caps: ToolCapabilities, paths: &BucketPaths) -> bool {
    match policy {
        StagePolicy::Always => true,
        StagePolicy::IfMissing => !staging_complete(caps, paths),
    }
}

pub fn stage_bucket(
    runner: &dyn CommandRunner,
    caps: ToolCapabilities,
    paths: &BucketPaths,
) -> Result<()> {
    let mut spec = CommandSpec::new(TOOLCHAIN_BIN)
        .arg("stage")
        .arg_path(&paths.consensus_dir)
        .arg_path(&paths.server_dir)
        .arg(USERSTATS_REF);
    if caps.needs_topology_model() {
        spec = spec.arg(TMODEL_REF);
    }
    spec = spec
        .arg("--onionperf_data_path")
        .arg_path(&paths.onionperf_dir)
        .arg("--bandwidth_data_path")
        .arg_path(&paths.bandwidth_file)
        .arg("--geoip")
        .arg(GEOIP_REF)
        .arg("--prefix")
        .arg_path(&paths.staged_dir);
    let out = runner.run(&spec)?;
    if !out.success() {
        warn!("staging exited with status {}", out.status_label());
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct StagedBundle {
    pub relay_info: Option<PathBuf>,
    pub user_info: Option<PathBuf>,
    pub network_info: Option<PathBuf>,
}

impl StagedBundle {
    /// Name-matches the staged files. Anything missing stays `None` and is
    /// later passed through as an empty path for the tool to complain about.
    pub fn scan(staged_dir: &Path) -> Self {
        let mut bundle = StagedBundle::default();
        let entries = match fs::read_dir(staged_dir) {
            Ok(entries) => entries,
            Err(_) => return bundle,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains("relayinfo") {
                bundle.relay_info = Some(path.clone());
            }
            if name.contains("userinfo") {
                bundle.user_info = Some(path.clone());
            }
            if name.contains("networkinfo_staging.gml") {
                bundle.network_info = Some(path);
            }
        }
        bundle
    }
}

pub fn generation_complete(target: &Path) -> bool {
    target.exists()
}

/// Generates the baseline variant unless its directory already exists.
/// Returns whether the generation subprocess ran.
pub fn generate_base(
    runner: &dyn CommandRunner,
    caps: ToolCapabilities,
    paths: &BucketPaths,
    scale: f64,
    bin_dir: &Path,
    target: &Path,
) -> Result<bool> {
    if generation_complete(target) {
        info!("{} already exists, skipping generation", target.display());
        return Ok(false);
    }
    let bundle = StagedBundle::scan(&paths.staged_dir);
    let mut spec = CommandSpec::new(TOOLCHAIN_BIN)
        .arg("generate")
        .arg_path(&bundle.relay_info.unwrap_or_default())
        .arg_path(&bundle.user_info.unwrap_or_default());
    if caps.wants_network_info() {
        spec = spec.arg_path(&bundle.network_info.unwrap_or_default());
    }
    if caps.needs_topology_model() {
        spec = spec.arg(TMODEL_REF);
    }
    spec = spec
        .arg("--network_scale")
        .arg(scale.to_string())
        .arg("--events")
        .arg(TRACE_EVENTS)
        .arg("--bin_dir")
        .arg_path(bin_dir)
        .arg("--prefix")
        .arg_path(target);
    let out = runner.run(&spec)?;
    if !out.success() {
        warn!("generation exited with status {}", out.status_label());
    }
    Ok(true)
}

pub fn default_bin_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".local").join("bin"))
        .unwrap_or_else(|| PathBuf::from(".local/bin"))
}

/// Clones vanilla into `target` and pins the circuit-lifetime override in
/// its torrc. Failures are reported, not raised; the caller keeps the
/// variant enqueued either way.
pub fn clone_variant(base: &Path, target: &Path, dirtiness: u64) -> VariantSource {
    if let Err(err) = copy_dir_recursive(base, target) {
        warn!(
            "failed to copy {} for {}: {:#}. It might already exist",
            base.display(),
            target.display(),
            err
        );
        return VariantSource::CloneFailed {
            reason: err.to_string(),
        };
    }
    match apply_dirtiness(target, dirtiness) {
        Ok(()) => VariantSource::Cloned,
        Err(err) => {
            warn!(
                "failed to rewrite config under {}: {:#}",
                target.display(),
                err
            );
            VariantSource::CloneFailed {
                reason: err.to_string(),
            }
        }
    }
}

fn apply_dirtiness(variant_dir: &Path, dirtiness: u64) -> Result<()> {
    let conf_path = variant_dir.join(TORRC_REL_PATH);
    let text = fs::read_to_string(&conf_path)
        .map_err(|e| anyhow!("failed to read {}: {}", conf_path.display(), e))?;
    let mut options = OrderedKv::parse(&text);
    options.set(DIRTINESS_KEY, dirtiness.to_string());
    atomic_write_bytes(&conf_path, options.render().as_bytes())
}

pub fn simulation_complete(variant_dir: &Path) -> bool {
    variant_dir.join(COMPLETION_MARKER).is_file()
}

/// Simulates the variant unless its marker log exists, then always parses.
/// Returns whether the simulate subprocess ran.
pub fn execute_variant(
    runner: &dyn CommandRunner,
    caps: ToolCapabilities,
    variant_dir: &Path,
    workers: usize,
    seed: u64,
) -> Result<bool> {
    let mut simulated = false;
    if simulation_complete(variant_dir) {
        info!("{} already simulated, skipping", variant_dir.display());
    } else {
        let spec = CommandSpec::new(TOOLCHAIN_BIN)
            .arg("simulate")
            .arg("-a")
            .arg(caps.simulator_args(workers, seed))
            .arg_path(variant_dir);
        let out = runner.run(&spec)?;
        if !out.success() {
            warn!("simulation exited with status {}", out.status_label());
        }
        simulated = true;
    }
    let spec = CommandSpec::new(TOOLCHAIN_BIN)
        .arg("parse")
        .arg_path(variant_dir);
    let out = runner.run(&spec)?;
    if !out.success() {
        warn!("parse exited with status {}", out.status_label());
    }
    Ok(simulated)
}

pub fn plot_variants(
    runner: &dyn CommandRunner,
    variant_dirs: &[PathBuf],
    metrics_file: &Path,
    prefix: &Path,
) -> Result<()> {
    let mut spec = CommandSpec::new(TOOLCHAIN_BIN).arg("plot");
    for dir in variant_dirs {
        spec = spec.arg_path(dir);
    }
    spec = spec
        .arg("--tor_metrics_path")
        .arg_path(metrics_file)
        .arg("--prefix")
        .arg_path(prefix);
    let out = runner.run(&spec)?;
    if !out.success() {
        warn!("plot exited with status {}", out.status_label());
    }
    Ok(())
}

/// The plot step wants the measured-network metrics CSV that acquisition
/// downloaded; match it by name so a failed fetch degrades to an empty path.
pub fn find_metrics_file(data_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(data_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains("bandwidth") && name.ends_with(".csv") {
            return Some(path);
        }
    }
    None
}

/// Drives acquire → probe → stage → generate → mutate → simulate/parse →
/// plot for one plan, in that order, entirely through the filesystem.
pub fn run_sweep(
    plan: &SweepPlan,
    fetcher: &dyn Fetcher,
    runner: &dyn CommandRunner,
) -> Result<SweepResult> {
    let experiment_name = plan.experiment_name();
    let project_dir = plan.project_dir();
    let experiments_dir = project_dir.join("experiments");
    let paths = BucketPaths::resolve(&plan.data_root, &plan.bucket);
    info!("running sweep {}", experiment_name);

    let cache = ArtifactCache::new(&plan.sources, fetcher, runner);
    cache.ensure(&plan.bucket, &paths)?;

    let caps = probe_simulator(runner)?;
    debug!("simulator dialect: {}", caps.label());

    let staged = if should_stage(plan.stage_policy, caps, &paths) {
        stage_bucket(runner, caps, &paths)?;
        true
    } else {
        info!(
            "staged bundle for {} already present, skipping",
            plan.bucket.label()
        );
        false
    };

    ensure_dir(&experiments_dir)?;
    let vanilla_dir = experiments_dir.join(VANILLA_NAME);
    let bin_dir = plan.bin_dir.clone().unwrap_or_else(default_bin_dir);
    let generated = generate_base(runner, caps, &paths, plan.scale, &bin_dir, &vanilla_dir)?;

    let mut variants = vec![ExperimentVariant {
        name: VANILLA_NAME.to_string(),
        path: vanilla_dir.clone(),
        source: VariantSource::Generated,
        dirtiness: None,
        simulated: false,
    }];
    for &dirtiness in &plan.dirtiness {
        let name = format!("dirty-{}", dirtiness);
        let path = experiments_dir.join(&name);
        let source = clone_variant(&vanilla_dir, &path, dirtiness);
        variants.push(ExperimentVariant {
            name,
            path,
            source,
            dirtiness: Some(dirtiness),
            simulated: false,
        });
    }
    write_manifest(&project_dir, plan, caps, &variants)?;

    let workers = plan.workers.unwrap_or_else(num_cpus::get);
    for variant in &mut variants {
        variant.simulated = execute_variant(runner, caps, &variant.path, workers, plan.seed)?;
    }

    let variant_dirs: Vec<PathBuf> = variants.iter().map(|v| v.path.clone()).collect();
    let metrics_file = find_metrics_file(&paths.data_dir).unwrap_or_default();
    plot_variants(
        runner,
        &variant_dirs,
        &metrics_file,
        &project_dir.join("pdfs"),
    )?;

    write_manifest(&project_dir, plan, caps, &variants)?;

    Ok(SweepResult {
        project_dir,
        experiment_name,
        dialect: caps,
        staged,
        generated,
        variants,
    })
}

/// Computes everything `run_sweep` would name without touching the network
/// or spawning anything.
pub fn describe_sweep(plan: &SweepPlan) -> SweepPreview {
    let mut variant_names = vec![VANILLA_NAME.to_string()];
    variant_names.extend(plan.dirtiness.iter().map(|d| format!("dirty-{}", d)));
    let paths = BucketPaths::resolve(&plan.data_root, &plan.bucket);
    SweepPreview {
        experiment_name: plan.experiment_name(),
        project_dir: plan.project_dir(),
        data_dir: paths.data_dir,
        artifact_urls: plan
            .sources
            .iter()
            .map(|s| s.resolve(&plan.bucket))
            .collect(),
        variant_names,
    }
}

fn write_manifest(
    project_dir: &Path,
    plan: &SweepPlan,
    caps: ToolCapabilities,
    variants: &[ExperimentVariant],
) -> Result<()> {
    let entries: Vec<Value> = variants
        .iter()
        .map(|variant| {
            let mut entry = json!({
                "name": variant.name,
                "path": variant.path.display().to_string(),
                "source": variant.source.label(),
                "simulated": variant.simulated,
            });
            if let VariantSource::CloneFailed { reason } = &variant.source {
                entry["clone_error"] = json!(reason);
            }
            entry
        })
        .collect();
    let payload = json!({
        "schema_version": "sweep_manifest_v1",
        "experiment": plan.experiment_name(),
        "bucket": plan.bucket.label(),
        "seed": plan.seed,
        "scale": plan.scale,
        "dirtiness": plan.dirtiness,
        "dialect": caps.label(),
        "created_at": Utc::now().to_rfc3339(),
        "variants": entries,
    });
    atomic_write_bytes(
        &project_dir.join(MANIFEST_NAME),
        &serde_json::to_vec_pretty(&payload)?,
    )
}

use std::env::consts::{ARCH, FAMILY, OS};
use std::env::current_dir;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error, bail};
use console::{Term, style};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::danbooru::identifier::Identifier;
use crate::danbooru::io::config_loader::{DanbooruConfig, Options};
use crate::danbooru::io::{Logger, OperationStatus, init_config, init_logger};
use crate::danbooru::materializer::{FileMaterializer, MaterializeError, extension_for, file_stem, sanitize_filename};
use crate::danbooru::orchestrator::{FetchReport, FetchStats, Orchestrator};
use crate::danbooru::record::{Field, ImageSize, PostRecord};
use crate::danbooru::scheduler::Scheduler;
use crate::danbooru::sender::{Credential, HttpTransport, ProfileError, Transport, fetch_profile};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

/// Directory holding `config.toml` and `danbooru.toml`.
const CONFIG_DIR: &str = "./config";

/// One file to download after the fetch run.
#[derive(Debug, Clone)]
struct MediaJob {
    post_id: u64,
    url: String,
    relative_dir: String,
    stem: String,
    declared_ext: Option<String>,
    /// Only set when the file is the original the hash describes.
    md5: Option<String>,
}

#[derive(Debug, Default)]
struct DownloadSummary {
    written: usize,
    skipped: usize,
    failed: usize,
    cancelled: usize,
}

/// Handles the flow of a fetch run from configuration to the printed summary.
pub(crate) struct Program {
    args: Vec<String>,
}

impl Program {
    pub(crate) fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    pub(crate) async fn run(&self) -> Result<(), Error> {
        let _ = Term::stdout().set_title("danbooru fetcher");

        let config_manager = init_config(CONFIG_DIR).await.context("Failed to load configuration")?;
        let app_config = config_manager.get_app_config()?;
        let danbooru_config = config_manager.get_danbooru_config()?;
        let logger = init_logger(&app_config).context("Failed to initialize logging")?;
        // Anything the config loader had to say happened before there was a subscriber.
        config_manager.replay_notices();

        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        log_system_information();
        if let Ok(dir) = current_dir() {
            trace!("Program Working Directory: {}", dir.display());
        }
        trace!("Log Directory: {}", logger.log_dir().display());

        let identifiers = self.collect_identifiers(&danbooru_config)?;
        if identifiers.is_empty() {
            info!(
                "Nothing to fetch. Add posts, pools or artists to {}/danbooru.toml or pass them as arguments.",
                CONFIG_DIR
            );
            return Ok(());
        }

        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(&app_config.sender_config()).context("Failed to create HTTP client")?,
        );
        let credential = danbooru_config.credential();
        validate_credential(transport.as_ref(), &credential).await?;

        let cancel = CancellationToken::new();
        spawn_interrupt_handler(cancel.clone());

        let run_id = Uuid::new_v4();
        logger.log_system_event("run_started", &format!("{} identifiers", identifiers.len()));

        let orchestrator = Orchestrator::new(
            transport.clone(),
            credential.clone(),
            app_config.backoff.build_policy(),
            app_config.orchestrator_config(),
        );
        let (jobs, aborted) = fetch_reports(
            &orchestrator,
            &logger,
            run_id,
            identifiers,
            cancel.clone(),
            &danbooru_config.options,
        )
        .await;
        let stats = orchestrator.stats();

        let downloads = if danbooru_config.options.download_media && !cancel.is_cancelled() {
            let materializer = FileMaterializer::new(&app_config.paths.download_directory);
            download_media(transport.as_ref(), &credential, &materializer, &logger, run_id, jobs, &cancel).await
        } else {
            DownloadSummary::default()
        };

        print_summary(&stats, &downloads);
        logger.log_system_event("run_finished", &format!("{} posts reported", stats.total()));

        if let Some(error) = aborted {
            logger.log_error(Some(run_id), "authentication", &error, None);
            bail!(error);
        }
        Ok(())
    }

    /// Everything listed in `danbooru.toml`, followed by the command-line arguments.
    fn collect_identifiers(&self, danbooru_config: &DanbooruConfig) -> Result<Vec<Identifier>, Error> {
        let mut identifiers = danbooru_config.identifiers();
        for arg in &self.args {
            let identifier =
                Identifier::from_str(arg).with_context(|| format!("Invalid identifier argument {:?}", arg))?;
            identifiers.push(identifier);
        }
        Ok(identifiers)
    }
}

/// Confirms the credential before any post is requested.
async fn validate_credential(transport: &dyn Transport, credential: &Credential) -> Result<(), Error> {
    if credential.is_anonymous() {
        info!("No credentials configured, continuing anonymously. Gated posts will be reported as degraded.");
        return Ok(());
    }

    match fetch_profile(transport, credential).await {
        Ok(profile) => {
            info!("Logged in as {}", profile);
            if !profile.tier().can_view_gold_exclusive() {
                info!("Account level cannot view gold-exclusive posts; they will be reported as degraded.");
            }
            Ok(())
        }
        Err(ProfileError::AuthenticationFailure) => {
            error!("The configured username or API key was rejected.");
            bail!("Authentication failed: invalid API key or username")
        }
        Err(ProfileError::Unexpected(detail)) => {
            warn!("Could not verify credentials ({}), continuing anyway.", detail);
            Ok(())
        }
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current group before stopping...");
            cancel.cancel();
        }
    });
}

fn spinner() -> ProgressBar {
    let progress_bar = ProgressBar::new_spinner();
    match ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {pos} posts {msg}") {
        Ok(progress_style) => progress_bar.set_style(progress_style),
        Err(e) => warn!("Falling back to the default progress style: {}", e),
    }
    progress_bar.enable_steady_tick(Duration::from_millis(120));
    progress_bar
}

fn download_bar(len: u64) -> ProgressBar {
    let progress_bar = ProgressBar::new(len);
    match ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        Ok(progress_style) => progress_bar.set_style(progress_style.progress_chars("=>-")),
        Err(e) => warn!("Falling back to the default progress style: {}", e),
    }
    progress_bar
}

/// Drains the fetch stream. Returns the media to download and the abort reason, if any.
async fn fetch_reports(
    orchestrator: &Orchestrator,
    logger: &Logger,
    run_id: Uuid,
    identifiers: Vec<Identifier>,
    cancel: CancellationToken,
    options: &Options,
) -> (Vec<MediaJob>, Option<String>) {
    let progress_bar = spinner();
    let mut reports = orchestrator.fetch(run_id, identifiers, cancel);
    let mut jobs = Vec::new();
    let mut aborted = None;

    while let Some(item) = reports.next().await {
        match item {
            Ok(report) => {
                logger.log_fetch(run_id, &report);
                progress_bar.set_message(format!("{} ({})", report.origin, report.outcome.kind()));
                progress_bar.inc(1);
                if let Some(job) = media_job(&report, options.image_size, options.verify_hashes) {
                    jobs.push(job);
                }
            }
            Err(run_error) => {
                aborted = Some(run_error.to_string());
            }
        }
    }

    progress_bar.finish_with_message("done");
    (jobs, aborted)
}

/// Pools go into a folder named after the pool, falling back to its id.
fn relative_dir(report: &FetchReport) -> String {
    match &report.origin {
        Identifier::Post(_) => "Posts".to_string(),
        Identifier::Pool(_) => {
            let name = report.title.clone().unwrap_or_else(|| report.origin.label());
            format!("Pools/{}", sanitize_filename(&name))
        }
        Identifier::Artist(_) => format!("Artists/{}", sanitize_filename(&report.origin.label())),
    }
}

/// `Page_<n>` for pools taken in order, `Post_<id>` for other pools, the artist-prefixed stem otherwise.
fn media_stem(report: &FetchReport, record: &PostRecord, post_id: u64) -> Option<String> {
    match (&report.origin, report.page) {
        (Identifier::Pool(_), Some(page)) => Some(format!("Page_{}", page)),
        (Identifier::Pool(_), None) => Some(format!("Post_{}", post_id)),
        _ => file_stem(record),
    }
}

/// The file to download for a usable record, if the upstream exposed one.
fn media_job(report: &FetchReport, size: ImageSize, verify_hashes: bool) -> Option<MediaJob> {
    let record = report.outcome.record()?;
    if record.is_gated() {
        log_unavailable(report, record);
        return None;
    }
    let Field::Present(post_id) = report.post_id else {
        log_unavailable(report, record);
        return None;
    };
    let stem = media_stem(report, record, post_id)?;

    let preferred = record.file_url_for(size);
    let (url, is_original) = match (preferred, &record.file_url) {
        (Field::Present(url), _) => (url.clone(), size == ImageSize::Large),
        (_, Field::Present(original)) => (original.clone(), true),
        _ => {
            log_unavailable(report, record);
            return None;
        }
    };

    let md5 = match &record.md5 {
        Field::Present(md5) if verify_hashes && is_original && !record.flags.hash_unverifiable => {
            Some(md5.clone())
        }
        _ => None,
    };
    let declared_ext = url
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_string())
        .or_else(|| record.file_ext.clone());

    Some(MediaJob {
        post_id,
        url,
        relative_dir: relative_dir(report),
        stem,
        declared_ext,
        md5,
    })
}

fn log_unavailable(report: &FetchReport, record: &PostRecord) {
    match record.manual_download_url() {
        Some(url) => info!(origin = %report.origin, "File is not served, it may be available at {}", url),
        None => info!(origin = %report.origin, "File is not served and no source is known"),
    }
}

/// Downloads media in tiered groups, the same way posts are fetched.
async fn download_media(
    transport: &dyn Transport,
    credential: &Credential,
    materializer: &FileMaterializer,
    logger: &Logger,
    run_id: Uuid,
    jobs: Vec<MediaJob>,
    cancel: &CancellationToken,
) -> DownloadSummary {
    let mut summary = DownloadSummary::default();
    if jobs.is_empty() {
        return summary;
    }

    let progress_bar = download_bar(jobs.len() as u64);
    let mut scheduler = Scheduler::default();
    let mut remaining = jobs.into_iter();

    while let Some(plan) = scheduler.next_group(remaining.len()) {
        if cancel.is_cancelled() {
            warn!("Download cancelled with {} files left", remaining.len());
            for job in remaining.by_ref() {
                logger.log_materialize(run_id, job.post_id, &job.url, OperationStatus::Cancelled, None);
                summary.cancelled += 1;
            }
            break;
        }
        let group: Vec<MediaJob> = remaining.by_ref().take(plan.len).collect();
        let results = scheduler
            .dispatch(plan.limit, group, |job| async move {
                let status = download_one(transport, credential, materializer, logger, run_id, &job).await;
                (job, status)
            })
            .await;

        for (job, status) in results {
            match status {
                OperationStatus::Completed => summary.written += 1,
                OperationStatus::Skipped => summary.skipped += 1,
                _ => summary.failed += 1,
            }
            progress_bar.set_message(format!("post {}", job.post_id));
            progress_bar.inc(1);
        }
    }

    progress_bar.finish_with_message("downloads complete");
    summary
}

async fn download_one(
    transport: &dyn Transport,
    credential: &Credential,
    materializer: &FileMaterializer,
    logger: &Logger,
    run_id: Uuid,
    job: &MediaJob,
) -> OperationStatus {
    let ext_hint = job.declared_ext.as_deref().unwrap_or_default();
    if !ext_hint.is_empty() && materializer.exists(&job.relative_dir, &job.stem, ext_hint).await {
        logger.log_materialize(run_id, job.post_id, &job.stem, OperationStatus::Skipped, None);
        return OperationStatus::Skipped;
    }

    let response = match transport.get(&job.url, credential).await {
        Ok(response) if (200..300).contains(&response.status) => response,
        Ok(response) => {
            warn!(post_id = job.post_id, status = response.status, "Media request failed");
            logger.log_materialize(run_id, job.post_id, &job.url, OperationStatus::Failed, None);
            return OperationStatus::Failed;
        }
        Err(e) => {
            warn!(post_id = job.post_id, "Media request failed: {}", e);
            logger.log_materialize(run_id, job.post_id, &job.url, OperationStatus::Failed, None);
            return OperationStatus::Failed;
        }
    };

    let ext = extension_for(job.declared_ext.as_deref(), response.content_type.as_deref());
    let written = match &job.md5 {
        Some(md5) => {
            materializer
                .materialize_verified(&job.relative_dir, &job.stem, &ext, &response.body, md5)
                .await
        }
        None => materializer.materialize(&job.relative_dir, &job.stem, &ext, &response.body).await,
    };

    match written {
        Ok(path) => {
            logger.log_materialize(
                run_id,
                job.post_id,
                &path.display().to_string(),
                OperationStatus::Completed,
                Some(response.body.len() as u64),
            );
            OperationStatus::Completed
        }
        Err(e @ MaterializeError::HashMismatch { .. }) => {
            error!(post_id = job.post_id, "{}", e);
            logger.log_error(Some(run_id), "hash_mismatch", &e.to_string(), Some(&job.url));
            OperationStatus::Failed
        }
        Err(e) => {
            error!(post_id = job.post_id, "Failed to save file: {}", e);
            logger.log_materialize(run_id, job.post_id, &job.stem, OperationStatus::Failed, None);
            OperationStatus::Failed
        }
    }
}

fn print_summary(stats: &FetchStats, downloads: &DownloadSummary) {
    let term = Term::stdout();
    let lines = [
        format!("{}", style("Fetch summary").bold()),
        format!("  {:<14}{}", "success", style(stats.success).green()),
        format!("  {:<14}{}", "degraded", style(stats.degraded).yellow()),
        format!("  {:<14}{}", "not found", stats.not_found),
        format!("  {:<14}{}", "forbidden", stats.forbidden),
        format!("  {:<14}{}", "rate limited", stats.rate_limited),
        format!("  {:<14}{}", "server errors", style(stats.server_errors).red()),
        format!("  {:<14}{}", "malformed", style(stats.malformed).red()),
        format!(
            "  {:<14}{} written, {} skipped, {} failed, {} cancelled",
            "files", downloads.written, downloads.skipped, downloads.failed, downloads.cancelled
        ),
    ];
    for line in lines {
        if term.write_line(&line).is_err() {
            info!("{}", console::strip_ansi_codes(&line));
        }
    }
    info!(
        groups = stats.groups_dispatched,
        retry_rounds = stats.retry_rounds,
        total = stats.total(),
        "Run complete"
    );
}

/// Logs information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}

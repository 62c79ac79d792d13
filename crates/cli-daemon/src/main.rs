use anyhow::{bail, Context, Result};
use avatar_daemon::{
    avatar::AvatarStore,
    cleanup,
    face::FaceRegion,
    inbox,
    inference::IdentityModel,
    job::{load_all_jobs, save_job},
    media::{FfmpegBackend, MediaBackend},
    tts::ElevenLabsClient,
    Job, JobRegistry, JobRequest, JobSettings, JobStatus, Pipeline, PipelineConfig, PipelineError, WorkerPool,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Talking-avatar video generation daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one video and wait for it to finish
    Generate {
        /// Text to speak
        #[arg(short, long, required_unless_present = "script_file")]
        script: Option<String>,

        /// Read the script from a file instead
        #[arg(long, conflicts_with = "script")]
        script_file: Option<PathBuf>,

        /// Avatar id
        #[arg(short, long)]
        avatar: String,

        /// Voice id (defaults to the configured voice)
        #[arg(long)]
        voice: Option<String>,

        /// Run the enhancement pass
        #[arg(long)]
        enhance: bool,

        /// Final video path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Face location as x,y,width,height
        #[arg(long, value_parser = parse_region)]
        face: Option<FaceRegion>,
    },

    /// Show one job
    Status { job_id: String },

    /// List jobs, newest first
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Manage avatars
    Avatars {
        #[command(subcommand)]
        action: AvatarCommand,
    },

    /// List voices available to the configured API key, or clone a new one
    Voices {
        #[command(subcommand)]
        action: Option<VoiceCommand>,
    },

    /// Generate every request in a JSON array file and wait for all of them
    Batch {
        /// File holding `[{"script": ..., "avatar_id": ...}, ...]`
        file: PathBuf,
    },

    /// Remove stale temp files
    Cleanup {
        /// Override temp_file_max_age_secs
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Run as a daemon, taking requests from the inbox directory
    Run,
}

#[derive(Subcommand, Debug)]
enum AvatarCommand {
    List,
    Show {
        id: String,
    },
    /// Register an avatar from reference frames or from a source video
    Import {
        #[arg(short, long)]
        name: String,

        #[arg(required_unless_present = "video", conflicts_with = "video")]
        frames: Vec<PathBuf>,

        /// Sample reference frames from this video instead
        #[arg(long)]
        video: Option<PathBuf>,

        /// Override avatar_max_frames when sampling a video
        #[arg(long, requires = "video")]
        max_frames: Option<usize>,

        /// Face location as x,y,width,height
        #[arg(long, value_parser = parse_region)]
        face: Option<FaceRegion>,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum VoiceCommand {
    /// List available voices
    List,
    /// Clone a voice from speech samples and print its id
    #[command(name = "clone")]
    CloneVoice {
        #[arg(short, long)]
        name: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(required = true)]
        samples: Vec<PathBuf>,
    },
}

fn parse_region(s: &str) -> std::result::Result<FaceRegion, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid face region {:?}: {}", s, e))?;
    match parts.as_slice() {
        [x, y, w, h] if *w > 0 && *h > 0 => Ok(FaceRegion::new(*x, *y, *w, *h)),
        _ => Err(format!("face region must be x,y,width,height with non-zero size, got {:?}", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Generate {
            script,
            script_file,
            avatar,
            voice,
            enhance,
            output,
            face,
        } => {
            let script = match (script, script_file) {
                (Some(s), _) => s,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read script: {}", path.display()))?,
                (None, None) => bail!("either --script or --script-file is required"),
            };
            let mut request = JobRequest::new(script, avatar);
            request.voice_id = voice;
            request.settings = JobSettings {
                enhance_quality: enhance,
                face_region: face,
                output_path: output,
            };
            generate(cfg, request).await
        }
        Command::Status { job_id } => show_status(&cfg, &job_id),
        Command::Jobs { status, limit } => list_jobs(&cfg, status, limit),
        Command::Avatars { action } => manage_avatars(&cfg, action).await,
        Command::Voices { action } => match action.unwrap_or(VoiceCommand::List) {
            VoiceCommand::List => list_voices(&cfg).await,
            VoiceCommand::CloneVoice {
                name,
                description,
                samples,
            } => {
                let client = ElevenLabsClient::from_config(&cfg);
                let voice_id = client.clone_voice(&name, description.as_deref(), &samples).await?;
                println!("{}", voice_id);
                Ok(())
            }
        },
        Command::Batch { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read batch file: {}", file.display()))?;
            let requests: Vec<JobRequest> = serde_json::from_str(&content)
                .with_context(|| format!("Invalid batch file: {}", file.display()))?;
            generate_batch(cfg, requests).await
        }
        Command::Cleanup { max_age_secs } => {
            let max_age = Duration::from_secs(max_age_secs.unwrap_or(cfg.temp_file_max_age_secs));
            let active = active_job_ids(&cfg)?;
            let cleaned = cleanup::cleanup_stale_temp_files(&cfg.temp_dir, max_age, &active).await?;
            println!("Removed {} stale temp file(s)", cleaned);
            Ok(())
        }
        Command::Run => run_daemon(cfg).await,
    }
}

async fn build_pipeline(cfg: Arc<PipelineConfig>, registry: Arc<JobRegistry>) -> Result<Pipeline> {
    let media = FfmpegBackend::new(&cfg)
        .await
        .context("FFmpeg 4 or newer is required")?;
    if cfg.elevenlabs_api_key.is_none() {
        warn!("ELEVENLABS_API_KEY is not set; speech synthesis will fail");
    }
    let tts = ElevenLabsClient::from_config(&cfg);
    let model = IdentityModel;
    info!("Lip-sync model: identity (faces are passed through unchanged)");
    Ok(Pipeline::new(
        cfg,
        registry,
        Arc::new(tts),
        Arc::new(model),
        Arc::new(media),
    ))
}

async fn generate(cfg: PipelineConfig, request: JobRequest) -> Result<()> {
    cfg.ensure_dirs()?;
    let cfg = Arc::new(cfg);
    let registry = Arc::new(JobRegistry::with_state_dir(cfg.job_state_dir.clone()));
    let pipeline = build_pipeline(Arc::clone(&cfg), Arc::clone(&registry)).await?;

    request.validate()?;
    if !pipeline.avatars().exists(&request.avatar_id) {
        return Err(PipelineError::avatar_not_found(&request.avatar_id).into());
    }
    let id = registry.submit(Job::new(request))?;
    info!("Job {}: submitted", id);

    let run = pipeline.run_job(&id);
    tokio::pin!(run);
    let job = tokio::select! {
        job = &mut run => job?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling job {}", id);
            pipeline.cancel_job(&id)?;
            run.await?
        }
    };
    save_job(&job, &cfg.job_state_dir)?;

    match job.status {
        JobStatus::Completed => {
            let output = job.output_path.as_deref().map(|p| p.display().to_string()).unwrap_or_default();
            println!("{}", output);
            Ok(())
        }
        status => bail!(
            "Job {} {}: {}",
            job.id,
            status,
            job.error.as_deref().unwrap_or("no output produced")
        ),
    }
}

async fn generate_batch(cfg: PipelineConfig, requests: Vec<JobRequest>) -> Result<()> {
    cfg.ensure_dirs()?;
    let cfg = Arc::new(cfg);
    let registry = Arc::new(JobRegistry::with_state_dir(cfg.job_state_dir.clone()));
    let pipeline = Arc::new(build_pipeline(Arc::clone(&cfg), Arc::clone(&registry)).await?);
    let pool = WorkerPool::start(pipeline);

    let outcome = pool.submit_batch(requests)?;
    for (position, reason) in &outcome.rejected {
        eprintln!("entry {}: {}", position, reason);
    }

    let mut interrupted = false;
    loop {
        let finished = outcome
            .job_ids
            .iter()
            .filter(|id| registry.get_status(id).map_or(true, |j| j.status.is_terminal()))
            .count();
        if finished == outcome.job_ids.len() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!("Interrupted, cancelling unfinished jobs");
                interrupted = true;
                for id in &outcome.job_ids {
                    if let Err(e) = pool.pipeline().cancel_job(id) {
                        warn!("Job {}: {}", id, e);
                    }
                }
            }
        }
    }
    pool.shutdown().await;
    persist_snapshots(&registry, &cfg);

    let mut failed = outcome.rejected.len();
    for id in &outcome.job_ids {
        let job = registry.get_status(id)?;
        match (&job.status, job.output_path.as_deref()) {
            (JobStatus::Completed, Some(path)) => println!("{}  {}", job.id, path.display()),
            _ => {
                failed += 1;
                println!("{}  {}  {}", job.id, job.status, job.error.as_deref().unwrap_or("-"));
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} batch entries did not complete", failed, outcome.job_ids.len() + outcome.rejected.len());
    }
    Ok(())
}

fn show_status(cfg: &PipelineConfig, job_id: &str) -> Result<()> {
    let jobs = load_all_jobs(&cfg.job_state_dir).context("Failed to load jobs")?;
    match jobs.into_iter().find(|j| j.id == job_id) {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        None => bail!("{}", PipelineError::job_not_found(job_id).public_message(None)),
    }
}

fn list_jobs(cfg: &PipelineConfig, status: Option<JobStatus>, limit: usize) -> Result<()> {
    let jobs = load_all_jobs(&cfg.job_state_dir).context("Failed to load jobs")?;
    let shown: Vec<&Job> = jobs
        .iter()
        .filter(|j| status.map_or(true, |s| j.status == s))
        .take(limit)
        .collect();
    if shown.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for job in shown {
        let detail = match job.status {
            JobStatus::Completed => job
                .output_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            JobStatus::Failed => job.error.clone().unwrap_or_default(),
            _ => String::new(),
        };
        println!(
            "{}  {:<10} {:>3}%  {}  {}",
            job.id,
            job.status,
            job.progress,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            detail
        );
    }
    Ok(())
}

async fn manage_avatars(cfg: &PipelineConfig, action: AvatarCommand) -> Result<()> {
    let store = AvatarStore::new(cfg.avatars_dir.clone());
    match action {
        AvatarCommand::List => {
            let avatars = store.list()?;
            if avatars.is_empty() {
                println!("No avatars");
            }
            for avatar in avatars {
                println!(
                    "{}  {}  {} frame(s)  {}",
                    avatar.id,
                    avatar.name,
                    avatar.reference_frames.len(),
                    avatar.created_at.format("%Y-%m-%d")
                );
            }
        }
        AvatarCommand::Show { id } => {
            let avatar = store.load(&id)?;
            println!("{}", serde_json::to_string_pretty(&avatar)?);
        }
        AvatarCommand::Import {
            name,
            frames,
            video,
            max_frames,
            face,
        } => {
            std::fs::create_dir_all(store.root())?;
            let avatar = match video {
                Some(video) => {
                    let media = FfmpegBackend::new(cfg)
                        .await
                        .context("FFmpeg 4 or newer is required to read videos")?;
                    let max_frames = max_frames.unwrap_or(cfg.avatar_max_frames);
                    store
                        .import_video(&media as &dyn MediaBackend, &name, &video, max_frames, face)
                        .await?
                }
                None => store.import(&name, &frames, face)?,
            };
            println!("{}", avatar.id);
        }
        AvatarCommand::Delete { id } => {
            store.delete(&id)?;
            println!("Deleted avatar {}", id);
        }
    }
    Ok(())
}

async fn list_voices(cfg: &PipelineConfig) -> Result<()> {
    let client = ElevenLabsClient::from_config(cfg);
    for voice in client.list_voices().await? {
        println!(
            "{}  {}  {}",
            voice.voice_id,
            voice.name,
            voice.category.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Ids of jobs a previous or running daemon has not finished
fn active_job_ids(cfg: &PipelineConfig) -> Result<HashSet<String>> {
    Ok(load_all_jobs(&cfg.job_state_dir)?
        .into_iter()
        .filter(|j| !j.status.is_terminal())
        .map(|j| j.id)
        .collect())
}

/// Jobs still pending or processing on disk belong to a daemon that died; mark them failed
fn recover_interrupted_jobs(cfg: &PipelineConfig) -> Result<usize> {
    let mut recovered = 0;
    for mut job in load_all_jobs(&cfg.job_state_dir)? {
        if job.status.is_terminal() {
            continue;
        }
        warn!("Job {}: was {} when the daemon stopped, marking failed", job.id, job.status);
        job.status = JobStatus::Failed;
        job.error = Some("interrupted by daemon restart".to_string());
        job.updated_at = Utc::now();
        save_job(&job, &cfg.job_state_dir)?;
        recovered += 1;
    }
    Ok(recovered)
}

fn persist_snapshots(registry: &JobRegistry, cfg: &PipelineConfig) {
    for job in registry.list(None, usize::MAX) {
        if let Err(e) = save_job(&job, &cfg.job_state_dir) {
            warn!("Failed to save job {}: {}", job.id, e);
        }
    }
}

async fn run_daemon(cfg: PipelineConfig) -> Result<()> {
    cfg.ensure_dirs()?;
    let cfg = Arc::new(cfg);

    info!("Avatar daemon starting");
    info!("  Data dir: {}", cfg.data_dir.display());
    info!("  Inbox: {}", cfg.inbox_dir.display());
    info!("  Workers: {}, queue capacity: {}", cfg.max_workers, cfg.queue_max_size);
    info!("  Scan interval: {}s", cfg.scan_interval_secs);

    // Recovery on startup
    let recovered = recover_interrupted_jobs(&cfg).context("Failed to recover interrupted jobs")?;
    let max_age = Duration::from_secs(cfg.temp_file_max_age_secs);
    let cleaned = cleanup::cleanup_stale_temp_files(&cfg.temp_dir, max_age, &HashSet::new())
        .await
        .context("Failed to clean temp directory")?;
    info!(
        "Startup recovery complete: {} job(s) recovered, {} temp file(s) cleaned",
        recovered, cleaned
    );

    let registry = Arc::new(JobRegistry::with_state_dir(cfg.job_state_dir.clone()));
    let pipeline = Arc::new(build_pipeline(Arc::clone(&cfg), Arc::clone(&registry)).await?);
    let pool = WorkerPool::start(pipeline);

    loop {
        if let Err(e) = inbox::process_inbox(&cfg.inbox_dir, &pool) {
            warn!("Inbox scan failed: {}", e);
        }
        persist_snapshots(&registry, &cfg);

        let active: HashSet<String> = registry
            .list(None, usize::MAX)
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.id)
            .collect();
        if let Err(e) = cleanup::cleanup_stale_temp_files(&cfg.temp_dir, max_age, &active).await {
            warn!("Temp cleanup failed: {}", e);
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cfg.scan_interval_secs)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    // Queued work is dropped; running jobs finish
    for job in registry.list(Some(JobStatus::Pending), usize::MAX) {
        if let Err(e) = registry.cancel(&job.id) {
            warn!("Job {}: could not cancel on shutdown: {}", job.id, e);
        }
    }
    pool.shutdown().await;
    persist_snapshots(&registry, &cfg);
    info!("Avatar daemon stopped");
    Ok(())
}

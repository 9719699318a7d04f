#![forbid(unsafe_code)]

use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory as _, Parser, Subcommand, ValueEnum};

use crate::config::{self, Config};
use crate::generation::GenerationClient;
use crate::generation::download::default_file_name;
use crate::generation::image::resolve_reference_image;
use crate::logging;
use crate::output::table::Table;
use crate::task::dispatch::{self, SubmitRequest, clamp_batch_size};
use crate::task::model::{EndpointConfig, Task, TaskStatus};
use crate::task::storage::SnapshotStorage;
use crate::task::store::TaskStore;

#[derive(Debug, Parser)]
#[command(
    name = "soragen",
    version,
    about = "Submit video generation prompts and track their results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a batch of tasks and wait for their results
    Submit(SubmitArgs),
    #[command(alias = "ls")]
    List(ListArgs),
    /// Finished videos, newest first
    Gallery(GalleryArgs),
    Show(ShowArgs),
    /// Save a finished video to disk
    Download(DownloadArgs),
    #[command(alias = "rm")]
    Delete(DeleteArgs),
    Endpoint(EndpointArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct SubmitArgs {
    /// Style or scene text placed before the prompt
    #[arg(long = "prefix", default_value = "")]
    pub prefix: String,
    /// Quality or camera text placed after the prompt
    #[arg(long = "suffix", default_value = "")]
    pub suffix: String,
    /// Number of attempts (1-10)
    #[arg(short = 'n', long = "count")]
    pub count: Option<usize>,
    /// Reference image file or data URL
    #[arg(short = 'i', long = "image")]
    pub image: Option<String>,
    /// Prompt body
    #[arg(required = true)]
    pub prompt: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Only show tasks with this status
    #[arg(long = "filter", value_enum)]
    pub filter: Option<StatusFilter>,
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(long = "json")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Processing,
    Success,
    Failed,
}

impl From<StatusFilter> for TaskStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::Processing => Self::Processing,
            StatusFilter::Success => Self::Success,
            StatusFilter::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Parser)]
pub struct GalleryArgs {
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    /// Task ID or unique prefix
    pub id: String,
}

#[derive(Debug, Parser)]
pub struct DownloadArgs {
    /// Task ID or unique prefix
    pub id: String,
    /// Destination file (defaults to the URL's file name)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct DeleteArgs {
    /// Task ID or unique prefix
    pub id: String,
    /// Skip confirmation
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

#[derive(Debug, Parser)]
pub struct EndpointArgs {
    #[command(subcommand)]
    pub cmd: EndpointCmd,
}

#[derive(Debug, Subcommand)]
pub enum EndpointCmd {
    Show(EndpointShowArgs),
    Set(EndpointSetArgs),
}

#[derive(Debug, Parser)]
pub struct EndpointShowArgs {
    /// Print the key unmasked
    #[arg(long = "reveal")]
    pub reveal: bool,
}

#[derive(Debug, Parser)]
pub struct EndpointSetArgs {
    #[arg(long = "url")]
    pub url: Option<String>,
    /// Sent verbatim as the Authorization header (e.g. "Bearer sk-...")
    #[arg(long = "key")]
    pub key: Option<String>,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Some(Commands::Completion(args)) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "soragen", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Version) => Ok(cmd_version()),
        Some(Commands::Config(args)) => cmd_config(args),
        None => {
            let cfg = load_cfg().await?;
            cmd_list(&cfg, &ListArgs {
                filter: None,
                verbose: false,
                json: false,
                csv: false,
            })
        }
        Some(Commands::Submit(args)) => cmd_submit(&load_cfg().await?, args).await,
        Some(Commands::List(args)) => cmd_list(&load_cfg().await?, &args),
        Some(Commands::Gallery(args)) => cmd_gallery(&load_cfg().await?, &args),
        Some(Commands::Show(args)) => cmd_show(&load_cfg().await?, &args),
        Some(Commands::Download(args)) => cmd_download(&load_cfg().await?, args).await,
        Some(Commands::Delete(args)) => cmd_delete(&load_cfg().await?, &args),
        Some(Commands::Endpoint(args)) => cmd_endpoint(&load_cfg().await?, args),
    }
}

async fn load_cfg() -> anyhow::Result<Config> {
    let cfg = tokio::task::spawn_blocking(|| -> anyhow::Result<Config> {
        let (cfg, _paths) = config::load()?;
        Ok(cfg)
    })
    .await??;
    logging::init(&cfg.log.level);
    Ok(cfg)
}

fn open_store(cfg: &Config) -> anyhow::Result<TaskStore> {
    let dir = cfg.store_dir()?;
    Ok(TaskStore::load(SnapshotStorage::new(dir))?)
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => print!("{}", config::list_resolved_toml()?),
        ConfigCmd::Set(set) => {
            config::set_value_string(&set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => match config::get_value_string(&get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'soragen config list' to see available keys",
                get.key
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_submit(cfg: &Config, args: SubmitArgs) -> anyhow::Result<ExitCode> {
    let mut store = open_store(cfg)?;
    let client = GenerationClient::new(cfg.generation.model.clone())?;

    let image = args
        .image
        .as_deref()
        .map(resolve_reference_image)
        .transpose()?;
    let requested = args.count.unwrap_or(cfg.generation.default_count);
    let request = SubmitRequest {
        prefix: args.prefix,
        body: args.prompt.join(" "),
        suffix: args.suffix,
        image,
        count: requested,
    };
    if clamp_batch_size(requested) != requested {
        eprintln!(
            "batch size {requested} out of range; using {}",
            clamp_batch_size(requested)
        );
    }

    let mut batch = dispatch::dispatch(&mut store, &client, &request)?;
    println!("Submitted {} task(s) to {}:", batch.tasks().len(), client.model());
    for task in batch.tasks() {
        println!("  {} {}", status_icon(cfg, task.status), short_id(&task.id));
    }
    println!();

    let mut failed = 0usize;
    let mut unrecorded = 0usize;
    let interrupted = loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => break true,
            next = batch.next_completion() => next,
        };
        let Some(completion) = next else {
            break false;
        };
        let id = completion.id.clone();
        match dispatch::settle(&mut store, completion) {
            Ok(Some(task)) => {
                if task.status == TaskStatus::Failed {
                    failed += 1;
                }
                print_completion(cfg, &task);
            }
            Ok(None) => {}
            // Siblings keep running; this task stays PROCESSING on disk.
            Err(e) => {
                tracing::error!(id = %id, error = %e, "failed to record task result");
                eprintln!("{} could not record result: {e:#}", short_id(&id));
                unrecorded += 1;
            }
        }
    };

    if interrupted {
        eprintln!(
            "interrupted: {} task(s) remain processing and will not be updated",
            batch.in_flight()
        );
        return Ok(ExitCode::from(130));
    }
    if unrecorded > 0 {
        eprintln!(
            "{unrecorded} of {} result(s) could not be saved",
            batch.tasks().len()
        );
    }
    if failed > 0 {
        eprintln!("{failed} of {} task(s) failed", batch.tasks().len());
    }
    if failed > 0 || unrecorded > 0 {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_completion(cfg: &Config, task: &Task) {
    let detail = match task.status {
        TaskStatus::Success => task.video_url.clone().unwrap_or_default(),
        TaskStatus::Failed => task.error_message.clone().unwrap_or_default(),
        TaskStatus::Pending | TaskStatus::Processing => String::new(),
    };
    println!(
        "{} {} [{}] {}",
        status_icon(cfg, task.status),
        short_id(&task.id),
        task.status.as_str(),
        detail
    );
}

fn cmd_list(cfg: &Config, args: &ListArgs) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let want = args.filter.map(TaskStatus::from);
    let tasks: Vec<&Task> = store
        .newest_first()
        .into_iter()
        .filter(|t| want.is_none_or(|s| t.status == s))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(ExitCode::SUCCESS);
    }

    if args.csv {
        let mut t = Table::new([
            "task_id",
            "created_at",
            "status",
            "prompt",
            "video_url",
            "error",
        ]);
        for task in &tasks {
            t.row([
                task.id.clone(),
                created_rfc3339(task.created_at),
                task.status.as_str().to_owned(),
                task.prompt(),
                task.video_url.clone().unwrap_or_default(),
                task.error_message.clone().unwrap_or_default(),
            ]);
        }
        t.print_csv()?;
        return Ok(ExitCode::SUCCESS);
    }

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(ExitCode::SUCCESS);
    }

    let mut t = if args.verbose {
        Table::new(["TASK", "CREATED", "STATUS", "PROMPT", "RESULT"])
    } else {
        Table::new(["TASK", "CREATED", "STATUS", "PROMPT"])
    };
    for task in &tasks {
        let mut row = vec![
            format!("{} {}", status_icon(cfg, task.status), short_id(&task.id)),
            created_relative(task.created_at),
            task.status.as_str().to_owned(),
            truncate(&task.prompt(), cfg.ui.prompt_width),
        ];
        if args.verbose {
            row.push(task_result(task));
        }
        t.row(row);
    }
    t.print()?;

    Ok(ExitCode::SUCCESS)
}

fn cmd_gallery(cfg: &Config, args: &GalleryArgs) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let videos = store.gallery();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&videos)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Videos ({})", videos.len());
    if videos.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    let mut t = Table::new(["TASK", "CREATED", "PROMPT", "URL"]);
    for task in &videos {
        t.row([
            short_id(&task.id),
            created_relative(task.created_at),
            truncate(&task.prompt(), cfg.ui.prompt_width),
            task.video_url.clone().unwrap_or_default(),
        ]);
    }
    t.print()?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_show(cfg: &Config, args: &ShowArgs) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let task = store.find(&args.id)?;

    println!("Task: {}", task.id);
    println!("Status: {} {}", status_icon(cfg, task.status), task.status.as_str());
    println!("Created: {}", created_rfc3339(task.created_at));
    if !task.prompt_prefix.is_empty() {
        println!("Prefix: {}", task.prompt_prefix);
    }
    println!("Prompt: {}", task.prompt_body);
    if !task.prompt_suffix.is_empty() {
        println!("Suffix: {}", task.prompt_suffix);
    }
    if let Some(image) = task.reference_image.as_deref() {
        println!("Reference image: {}", truncate(image, 48));
    }
    if let Some(url) = task.video_url.as_deref() {
        println!("\nVideo: {url}");
    }
    if let Some(err) = task.error_message.as_deref() {
        println!("\nError:\n{err}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_download(cfg: &Config, args: DownloadArgs) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let task = store.find(&args.id)?;
    let url = match (task.status, task.video_url.as_deref()) {
        (TaskStatus::Success, Some(url)) => url,
        (status, _) => anyhow::bail!(
            "task {} has no video to download (status: {})",
            short_id(&task.id),
            status.as_str()
        ),
    };
    let dest = args
        .output
        .unwrap_or_else(|| PathBuf::from(default_file_name(url, &task.id)));

    let client = GenerationClient::new(cfg.generation.model.clone())?;
    let bytes = client.download(url, &dest).await?;
    println!("Saved {} ({bytes} bytes) to {}", short_id(&task.id), dest.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_delete(cfg: &Config, args: &DeleteArgs) -> anyhow::Result<ExitCode> {
    let mut store = open_store(cfg)?;
    let task = store.find(&args.id)?.clone();

    if !args.yes {
        if !std::io::stdin().is_terminal() {
            anyhow::bail!("refusing to delete without confirmation; pass --yes");
        }
        if !confirm_delete(&task)? {
            println!("Cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    store.delete_task(&task.id)?;
    println!("Deleted task {}", short_id(&task.id));
    Ok(ExitCode::SUCCESS)
}

fn confirm_delete(task: &Task) -> anyhow::Result<bool> {
    println!(
        "This will delete task {} ({}): {}",
        short_id(&task.id),
        task.status.as_str(),
        truncate(&task.prompt(), 60)
    );
    print!("Are you sure? (y/N): ");
    std::io::Write::flush(&mut std::io::stdout())?;
    let mut input = String::new();
    let _ = std::io::stdin().read_line(&mut input)?;
    let resp = input.trim().to_lowercase();
    Ok(resp == "y" || resp == "yes")
}

fn cmd_endpoint(cfg: &Config, args: EndpointArgs) -> anyhow::Result<ExitCode> {
    let mut store = open_store(cfg)?;
    match args.cmd {
        EndpointCmd::Show(show) => {
            let endpoint = store.endpoint();
            println!("URL: {}", endpoint.api_url);
            let key = if show.reveal {
                endpoint.api_key.clone()
            } else {
                mask_key(&endpoint.api_key)
            };
            println!("Key: {key}");
        }
        EndpointCmd::Set(set) => {
            if set.url.is_none() && set.key.is_none() {
                anyhow::bail!("nothing to set; pass --url and/or --key");
            }
            let current = store.endpoint().clone();
            let next = EndpointConfig {
                api_url: set.url.unwrap_or(current.api_url),
                api_key: set.key.unwrap_or(current.api_key),
            };
            store.save_configuration(next)?;
            println!("Endpoint saved to {}", store.storage().endpoint_path().display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_version() -> ExitCode {
    println!("soragen version {}", env!("CARGO_PKG_VERSION"));
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

fn task_result(task: &Task) -> String {
    match task.status {
        TaskStatus::Success => task.video_url.clone().unwrap_or_else(|| "-".to_owned()),
        TaskStatus::Failed => truncate(task.error_message.as_deref().unwrap_or("-"), 80),
        TaskStatus::Pending | TaskStatus::Processing => "-".to_owned(),
    }
}

fn status_icon(cfg: &Config, status: TaskStatus) -> &'static str {
    if !cfg.ui.icons {
        return "";
    }
    match status {
        TaskStatus::Pending => "○",
        TaskStatus::Processing => "●",
        TaskStatus::Success => "✓",
        TaskStatus::Failed => "✗",
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return "(not set)".to_owned();
    }
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{tail}")
}

fn created_at(ms: i64) -> Option<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

fn created_rfc3339(ms: i64) -> String {
    created_at(ms)
        .and_then(|t| {
            t.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| "unknown".to_owned())
}

fn created_relative(ms: i64) -> String {
    let Some(t) = created_at(ms) else {
        return "unknown".to_owned();
    };
    let diff = time::OffsetDateTime::now_utc() - t;
    if diff < time::Duration::minutes(1) {
        "just now".to_owned()
    } else if diff < time::Duration::hours(1) {
        format!("{}m ago", diff.whole_minutes())
    } else if diff < time::Duration::days(1) {
        format!("{}h ago", diff.whole_hours())
    } else if diff < time::Duration::days(7) {
        format!("{}d ago", diff.whole_days())
    } else {
        t.date().to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push_str("...");
    }
    out
}

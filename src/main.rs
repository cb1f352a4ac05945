use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::error;
use tokio::runtime::Handle;

use vidgrab::db::{self, AppDirs};
use vidgrab::download_manager::DownloadRequest;
use vidgrab::events::{PresentationState, UiEvent, UiSender};
use vidgrab::models::{default_quality, Outcome, Tool, QUALITY_OPTIONS};
use vidgrab::App;

#[derive(Debug, Parser)]
#[command(name = "vidgrab", version, about = "Download a video with a self-managed yt-dlp toolchain")]
struct Args {
    /// Keep state (tools, database, cookies) under this directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Check the managed tools, installing any that are missing.
    Tools {
        /// Also ask yt-dlp to update itself.
        #[arg(long)]
        update: bool,
    },
    /// Download one video.
    Download {
        url: String,
        /// Destination folder (defaults to the last one used).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Quality label or height, e.g. "720p (HD)" or 720.
        #[arg(short, long)]
        quality: Option<String>,
        /// Run yt-dlp with --verbose; its output is logged at debug level.
        #[arg(long)]
        verbose: bool,
    },
    /// List the quality choices.
    Qualities,
    /// Manage the cookie file passed to yt-dlp.
    Cookies {
        #[command(subcommand)]
        action: CookieCmd,
    },
    /// Show where vidgrab keeps its state and tools.
    Paths,
}

#[derive(Debug, Subcommand)]
enum CookieCmd {
    Show,
    /// Replace the stored cookies with a Netscape cookie file.
    Import { file: PathBuf },
    Clear,
}

fn main() {
    let args = Args::parse();
    let dirs = match &args.data_dir {
        Some(dir) => AppDirs::create(dir.clone()),
        None => db::ensure_app_dirs(),
    };
    let log_file = dirs.as_ref().ok().and_then(|d| {
        let path = d.log_path();
        match vidgrab::logging::open_log_file(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("warning: cannot open log file {}: {e}", path.display());
                None
            }
        }
    });
    vidgrab::logging::init(log_file);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main(args, dirs)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main(args: Args, dirs: Result<AppDirs>) -> Result<()> {
    let mut app = App::from_dirs(dirs?)?;

    match args.cmd {
        Cmd::Tools { update } => handle_tools(&mut app, update).await,
        Cmd::Download {
            url,
            output,
            quality,
            verbose,
        } => handle_download(&mut app, url, output, quality, verbose).await,
        Cmd::Qualities => {
            for label in QUALITY_OPTIONS {
                let marker = if label == default_quality() { " (default)" } else { "" };
                println!("{label}{marker}");
            }
            Ok(())
        }
        Cmd::Cookies { action } => handle_cookies(&app, action),
        Cmd::Paths => handle_paths(&app),
    }
}

async fn handle_tools(app: &mut App, update: bool) -> Result<()> {
    let tools = app.tool_manager()?;
    let reports = app.check_tools(&tools).await;

    for report in &reports {
        match (&report.outcome, &report.error) {
            (Some(outcome), _) => println!("{:<14} {:<18} {}", report.tool, outcome.as_str(), report.path.display()),
            (None, Some(err)) => println!("{:<14} {:<18} {}", report.tool, "failed", err),
            (None, None) => println!("{:<14} unknown", report.tool),
        }
    }

    if update {
        if tools.self_update(Tool::YtDlp).await {
            println!("yt-dlp is up to date");
        } else {
            println!("yt-dlp self-update did not succeed (see log)");
        }
    }

    let failed = reports.iter().filter(|r| !r.ok()).count();
    if failed > 0 {
        bail!("{failed} tool(s) could not be installed");
    }
    Ok(())
}

async fn handle_download(
    app: &mut App,
    url: String,
    output: Option<PathBuf>,
    quality: Option<String>,
    verbose: bool,
) -> Result<()> {
    let tools = app.tool_manager()?;
    app.check_tools(&tools).await;
    let paths = tools.resolved_paths();
    if paths.yt_dlp.is_none() {
        bail!("yt-dlp is not available; run `vidgrab tools` first");
    }

    let destination = match output {
        Some(dir) => dir,
        None => app.settings().preferred_destination()?,
    };
    let quality = match quality {
        Some(q) => q,
        None => app.settings().preferred_quality()?,
    };

    let (ui, mut rx) = UiSender::channel();
    let controller = app.session_controller(Handle::current(), paths, ui, verbose);
    let mut form = PresentationState::new(destination.to_string_lossy(), url.clone(), quality.clone());

    let started = controller.start(DownloadRequest {
        url,
        destination: destination.to_string_lossy().to_string(),
        quality: quality.clone(),
    });
    let mut handle = match started {
        Ok(handle) => handle,
        Err(e) => {
            while let Ok(event) = rx.try_recv() {
                form.apply(&event);
                render(&event);
            }
            return Err(e.into());
        }
    };

    let settings = app.settings();
    settings
        .save_last_destination(&destination)
        .context("remember destination")?;
    settings.save_last_quality(&quality).context("remember quality")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                controller.stop();
            }
            event = rx.recv() => match event {
                Some(event) => {
                    form.apply(&event);
                    render(&event);
                }
                None => break handle.wait().await,
            },
            outcome = handle.wait() => {
                while let Ok(event) = rx.try_recv() {
                    form.apply(&event);
                    render(&event);
                }
                break outcome;
            }
        }
    };
    println!();
    log::debug!("Final form state: {:?}", form);

    match outcome {
        Outcome::Succeeded | Outcome::Cancelled => Ok(()),
        Outcome::Failed(message) => bail!("download failed: {message}"),
    }
}

fn render(event: &UiEvent) {
    match event {
        UiEvent::Status { text } => {
            print!("\r\x1b[2K{text}");
            let _ = std::io::stdout().flush();
        }
        UiEvent::InfoDialog { message } => println!("\n{message}"),
        UiEvent::ErrorDialog { message } => eprintln!("\n{message}"),
        UiEvent::Phase { .. }
        | UiEvent::Progress { .. }
        | UiEvent::Controls { .. }
        | UiEvent::ProgressHidden => {}
    }
}

fn handle_cookies(app: &App, action: CookieCmd) -> Result<()> {
    let store = app.cookies();
    match action {
        CookieCmd::Show => {
            let text = store.load()?;
            if text.is_empty() {
                println!("(no cookies stored at {})", store.path().display());
            } else {
                print!("{text}");
            }
        }
        CookieCmd::Import { file } => {
            store.import(&file)?;
            println!("Cookies saved to {}", store.path().display());
        }
        CookieCmd::Clear => {
            store.clear()?;
            println!("Cookies cleared");
        }
    }
    Ok(())
}

fn handle_paths(app: &App) -> Result<()> {
    let dirs = app.dirs();
    println!("data:     {}", dirs.data.display());
    println!("tools:    {}", dirs.tools.display());
    println!("log file: {}", dirs.log_path().display());
    println!("database: {}", app.db().path().display());
    println!("cookies:  {}", dirs.cookie_path().display());

    let checks = app.db().last_tool_checks()?;
    if !checks.is_empty() {
        println!();
        for check in checks {
            let result = check
                .outcome
                .or(check.error)
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "{:<14} {} ({})",
                check.tool,
                result,
                check.checked_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }
    Ok(())
}

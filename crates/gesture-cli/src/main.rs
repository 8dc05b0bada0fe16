use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gesture_contracts::events::EventWriter;
use gesture_contracts::generation::{GenerationState, GenerationStatus, GenerationView};
use gesture_contracts::prompts::PromptMap;
use gesture_engine::{
    clamp_total_steps, idle_timeout_from_millis, ClientConfig, GenerationStreamClient,
    GestureOutcome, GestureSession,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "gesture-gen",
    version,
    about = "Streams image generations triggered by hand gestures"
)]
struct Cli {
    #[command(flatten)]
    server: ServerArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image for a prompt.
    Generate(GenerateArgs),
    /// Generate the image mapped to one gesture label.
    Gesture(GestureArgs),
    /// Read gesture labels from stdin and generate for each mapped one.
    Detect(DetectArgs),
    /// List the gesture to prompt map.
    Prompts,
}

#[derive(Debug, Args)]
struct ServerArgs {
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true)]
    total_steps: Option<u64>,
    /// 0 disables the stall check.
    #[arg(long, global = true)]
    idle_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    prompts: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "generated.png")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct GestureArgs {
    #[arg(long)]
    label: String,
    #[arg(long, default_value = "generated.png")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DetectArgs {
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROGRESS_BAR_WIDTH: usize = 20;
const DETECT_HELP: &str = "Commands: /start /quit /help, or a gesture label";

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gesture-gen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(ClientConfig::from_env(), &cli.server);
    match cli.command {
        Command::Generate(args) => run_generate(config, args),
        Command::Gesture(args) => run_gesture(config, args),
        Command::Detect(args) => run_detect(config, args),
        Command::Prompts => {
            let prompts = load_prompts(&config)?;
            for (gesture, prompt) in prompts.iter() {
                println!("{gesture}\t{prompt}");
            }
            Ok(0)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Flags win over the environment.
fn resolve_config(mut config: ClientConfig, args: &ServerArgs) -> ClientConfig {
    if let Some(base_url) = args.base_url.as_deref().map(str::trim) {
        if !base_url.is_empty() {
            config.base_url = base_url.to_string();
        }
    }
    if let Some(total_steps) = args.total_steps {
        config.default_total_steps = clamp_total_steps(total_steps);
    }
    if let Some(ms) = args.idle_timeout_ms {
        config.idle_timeout = idle_timeout_from_millis(ms);
    }
    if let Some(path) = args.prompts.clone() {
        config.prompts_path = Some(path);
    }
    config
}

fn load_prompts(config: &ClientConfig) -> Result<PromptMap> {
    match config.prompts_path.as_deref() {
        Some(path) => PromptMap::load(path),
        None => Ok(PromptMap::default()),
    }
}

fn event_writer(path: Option<&Path>) -> EventWriter {
    let session_id = format!("cli-{}", uuid::Uuid::new_v4().simple());
    match path {
        Some(path) => EventWriter::new(path, session_id),
        None => EventWriter::discard(session_id),
    }
}

fn run_generate(config: ClientConfig, args: GenerateArgs) -> Result<i32> {
    let events = event_writer(args.events.as_deref());
    let mut client = GenerationStreamClient::with_http(config, events)?;
    client.set_inputs(Some(&args.prompt), true);
    let state = drive_client(&mut client)?;
    finish_generation(&state, &args.out)
}

fn run_gesture(config: ClientConfig, args: GestureArgs) -> Result<i32> {
    let prompts = load_prompts(&config)?;
    let events = event_writer(args.events.as_deref());
    let client = GenerationStreamClient::with_http(config, events.clone())?;
    let mut session = GestureSession::new(prompts, client, events);

    session.start_detection();
    let outcome = session.on_gesture(&args.label);
    if let Some(result) = session.result() {
        println!("{result}");
    }
    if let GestureOutcome::Unmapped { .. } = outcome {
        return Ok(2);
    }

    let mut progress = ProgressPrinter::default();
    while session.is_generating() {
        session.wait_for_update(POLL_INTERVAL);
        progress.show(&session.view())?;
    }
    progress.end()?;
    finish_generation(session.state(), &args.out)
}

fn run_detect(config: ClientConfig, args: DetectArgs) -> Result<i32> {
    let prompts = load_prompts(&config)?;
    let events = event_writer(args.events.as_deref());
    let client = GenerationStreamClient::with_http(config, events.clone())?;
    let mut session = GestureSession::new(prompts, client, events);
    let lines = spawn_stdin_reader()?;

    println!("Gesture detection ready. {DETECT_HELP}");
    let mut progress = ProgressPrinter::default();
    let mut input_open = true;
    let mut active_gesture: Option<String> = None;

    while input_open || session.is_generating() {
        if input_open {
            match lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    let input = line.trim();
                    match input {
                        "" => {}
                        "/quit" => input_open = false,
                        "/help" => println!("{DETECT_HELP}"),
                        "/start" => {
                            if session.start_detection() {
                                println!("Detecting...");
                            } else {
                                println!("Still generating; wait for it to finish");
                            }
                        }
                        label => match session.on_gesture(label) {
                            GestureOutcome::Ignored => {
                                tracing::debug!(gesture = label, "gesture ignored outside detection");
                                println!("Ignored {label}; type /start to detect")
                            }
                            GestureOutcome::Unmapped { .. } => {
                                if let Some(result) = session.result() {
                                    println!("{result}");
                                }
                            }
                            GestureOutcome::Started { prompt } => {
                                if let Some(result) = session.result() {
                                    println!("{result}");
                                }
                                println!("Prompt: {prompt}");
                                active_gesture = Some(label.to_string());
                            }
                        },
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => input_open = false,
            }
        } else {
            session.wait_for_update(POLL_INTERVAL);
        }

        session.pump();
        if session.is_generating() {
            progress.show(&session.view())?;
            continue;
        }
        if let Some(gesture) = active_gesture.take() {
            progress.end()?;
            let state = session.state();
            let out = args.out_dir.join(detection_file_name(&gesture, state));
            finish_generation(state, &out)?;
        }
    }
    Ok(0)
}

fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name("stdin-gestures".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, "stopped reading gestures from stdin");
                        break;
                    }
                };
                if sender.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(receiver)
}

/// Applies stream events until the request settles.
fn drive_client(client: &mut GenerationStreamClient) -> Result<GenerationState> {
    let mut progress = ProgressPrinter::default();
    loop {
        let view = client.view();
        if !view.is_loading {
            break;
        }
        progress.show(&view)?;
        client.wait_for_update(POLL_INTERVAL);
        if !client.is_connected() && client.view().is_loading {
            break;
        }
    }
    progress.end()?;
    Ok(client.state().clone())
}

fn finish_generation(state: &GenerationState, out: &Path) -> Result<i32> {
    match state.status {
        GenerationStatus::Complete => {
            match state.image.as_deref() {
                Some(bytes) => {
                    save_image(bytes, out)?;
                    let description = describe_image(bytes);
                    tracing::info!(path = %out.display(), image = %description, "saved generated image");
                    println!("Saved {} ({description})", out.display());
                }
                None => tracing::warn!("generation complete but the server sent no image bytes"),
            }
            if let Some(url) = state.image_url.as_deref() {
                println!("Image URL: {url}");
            }
            Ok(0)
        }
        GenerationStatus::Failed => {
            let error = state.error.as_deref().unwrap_or("Generation failed");
            tracing::error!(request_id = ?state.request_id, error, "generation failed");
            Ok(1)
        }
        GenerationStatus::Idle | GenerationStatus::Loading => {
            tracing::error!(status = state.status.as_str(), "generation did not finish");
            Ok(1)
        }
    }
}

fn save_image(bytes: &[u8], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write image {}", path.display()))
}

fn describe_image(bytes: &[u8]) -> String {
    let Ok(format) = image::guess_format(bytes) else {
        return format!("{} bytes, unrecognized format", bytes.len());
    };
    match image::load_from_memory_with_format(bytes, format) {
        Ok(decoded) => format!(
            "{} {}x{}",
            format.to_mime_type(),
            decoded.width(),
            decoded.height()
        ),
        Err(_) => format!("{} bytes, {}", bytes.len(), format.to_mime_type()),
    }
}

fn detection_file_name(gesture: &str, state: &GenerationState) -> String {
    let extension = state
        .image
        .as_deref()
        .and_then(|bytes| image::guess_format(bytes).ok())
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("png");
    let stem: String = gesture
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    match state.request_id.as_deref() {
        Some(request_id) => format!("{stem}-{request_id}.{extension}"),
        None => format!("{stem}.{extension}"),
    }
}

fn render_progress(view: &GenerationView) -> String {
    let fraction = view.progress.clamp(0.0, 1.0);
    let filled = ((fraction * PROGRESS_BAR_WIDTH as f64).round() as usize).min(PROGRESS_BAR_WIDTH);
    format!(
        "Generating image... Step {} of {} [{}{}] {}%",
        view.current_step,
        view.total_steps,
        "#".repeat(filled),
        ".".repeat(PROGRESS_BAR_WIDTH - filled),
        (fraction * 100.0).round() as u64
    )
}

/// Rewrites one stdout line in place while a generation runs.
#[derive(Debug, Default)]
struct ProgressPrinter {
    last: Option<String>,
}

impl ProgressPrinter {
    fn show(&mut self, view: &GenerationView) -> Result<()> {
        if !view.is_loading {
            return Ok(());
        }
        let line = render_progress(view);
        if self.last.as_deref() == Some(line.as_str()) {
            return Ok(());
        }
        let mut stdout = io::stdout();
        write!(stdout, "\r{line}")?;
        stdout.flush()?;
        self.last = Some(line);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.last.take().is_some() {
            println!();
        }
        Ok(())
    }
}

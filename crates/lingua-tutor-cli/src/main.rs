use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use lingua_tutor_agent::prompt::live_system_prompt;
use lingua_tutor_agent::{ChatService, ChatSettings, Tutor, TutorEvent};
use lingua_tutor_core::config::Config;
use lingua_tutor_core::history_store::{
    CHAT_HISTORY_KEY, HistoryStore, JsonHistoryStore, MemoryHistoryStore,
};
use lingua_tutor_core::types::{Message, Role};
use lingua_tutor_media::{
    AudioDevice, LiveSession, LiveSessionConfig, SpeechQueue, SpeechQueueConfig, WavDevice,
};
use lingua_tutor_providers::gemini::GeminiProvider;
use lingua_tutor_providers::live::GeminiLiveProvider;

#[derive(Parser)]
#[command(
    name = "lingua-tutor",
    about = "German conversation tutor: streamed chat, spoken replies and live voice",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a lesson
    Chat {
        /// Write everything the tutor says to this WAV file on exit
        #[arg(long)]
        audio_out: Option<PathBuf>,

        /// Use this WAV file as microphone input in voice mode
        #[arg(long)]
        mic: Option<PathBuf>,

        /// Start with the deep-thinking model
        #[arg(long)]
        deep: bool,

        /// Keep the transcript in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Speak one utterance into a WAV file
    Say {
        text: String,

        /// Output WAV path
        #[arg(short, long, default_value = "tutor.wav")]
        out: PathBuf,
    },

    /// Stored transcript management
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print the stored transcript
    Show,
    /// Delete the stored transcript
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config, cli.verbose);
    tracing::debug!(path = %config_path.display(), "Loaded config");

    match cli.command {
        Commands::Chat {
            audio_out,
            mic,
            deep,
            ephemeral,
        } => run_chat(&config, audio_out, mic, deep, ephemeral).await?,
        Commands::Say { text, out } => run_say(&config, &text, &out).await?,
        Commands::History { action } => {
            let store = JsonHistoryStore::new(config.storage_dir());
            match action {
                HistoryAction::Show => {
                    let messages = store.load(CHAT_HISTORY_KEY).await?;
                    if messages.is_empty() {
                        println!("No stored transcript.");
                    }
                    for message in &messages {
                        print_message(message);
                    }
                }
                HistoryAction::Clear => {
                    store.clear(CHAT_HISTORY_KEY).await?;
                    println!("Transcript cleared.");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Lingua Tutor v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Transcripts: {}", config.storage_dir().display());
            println!(
                "API key: {}",
                if config.api_key().is_some() { "configured" } else { "missing" }
            );
            println!("Chat models: {} / {}", config.fast_model(), config.deep_model());
            println!("Speech: {} ({})", config.tts_model(), config.tts_voice());
            println!("Live: {} ({})", config.live_model(), config.live_voice());
        }
    }

    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`, then `logging.level`.
fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format == "json", logging.output == "stdout") {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

fn api_key(config: &Config) -> anyhow::Result<String> {
    config.api_key().context(
        "No Gemini API key configured (provider.api_key, provider.api_key_env, or GEMINI_API_KEY)",
    )
}

/// The live socket shares the REST host.
fn live_base_url(config: &Config) -> Option<String> {
    let base = config.base_url()?;
    Some(if let Some(host) = base.strip_prefix("https://") {
        format!("wss://{host}")
    } else if let Some(host) = base.strip_prefix("http://") {
        format!("ws://{host}")
    } else {
        base.to_string()
    })
}

fn build_tutor(
    config: &Config,
    device: Arc<WavDevice>,
    ephemeral: bool,
) -> anyhow::Result<(Tutor, mpsc::UnboundedReceiver<TutorEvent>)> {
    let key = api_key(config)?;
    let gemini = Arc::new(GeminiProvider::new(key.clone(), config.base_url()));
    let live_provider = Arc::new(GeminiLiveProvider::new(
        key,
        live_base_url(config).as_deref(),
    ));

    let output = device.open_output(config.output_sample_rate())?;
    let speech = SpeechQueue::new(gemini.clone(), output, SpeechQueueConfig::from_config(config));
    let live = LiveSession::new(
        live_provider,
        device,
        LiveSessionConfig::from_config(config, live_system_prompt(config)),
    )?;
    let chat = ChatService::new(gemini, ChatSettings::from_config(config));
    let store: Arc<dyn HistoryStore> = if ephemeral {
        Arc::new(MemoryHistoryStore::new())
    } else {
        Arc::new(JsonHistoryStore::new(config.storage_dir()))
    };

    Ok(Tutor::new(chat, speech, live, store))
}

async fn run_chat(
    config: &Config,
    audio_out: Option<PathBuf>,
    mic: Option<PathBuf>,
    deep: bool,
    ephemeral: bool,
) -> anyhow::Result<()> {
    let mut device = WavDevice::new(config.output_sample_rate());
    if let Some(mic) = mic {
        device = device.with_microphone(mic);
    }
    let device = Arc::new(device);

    let (tutor, events) = build_tutor(config, device.clone(), ephemeral)?;
    tutor.set_deep_mode(deep);
    let printer = tokio::spawn(print_events(events));

    println!("Type a message, or /voice, /deep, /clear, /quit.");
    tutor.start_lesson().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "/quit" | "/exit" => break,
            "/voice" => tutor.toggle_voice().await,
            "/clear" => tutor.clear().await,
            "/deep" => {
                let enabled = !tutor.deep_mode();
                tutor.set_deep_mode(enabled);
                println!("Deep thinking {}.", if enabled { "on" } else { "off" });
            }
            "/help" => println!("/voice  toggle voice mode\n/deep   toggle deep thinking\n/clear  start over\n/quit   leave"),
            text => tutor.send(text).await,
        }
    }

    tutor.stop_voice();
    tutor.speech().cancel();
    drop(tutor);
    printer.abort();

    if let Some(path) = audio_out {
        device.save_wav(&path)?;
        println!("Saved tutor audio to {}", path.display());
    }
    Ok(())
}

async fn run_say(config: &Config, text: &str, out: &Path) -> anyhow::Result<()> {
    let gemini = Arc::new(GeminiProvider::new(api_key(config)?, config.base_url()));
    let device = WavDevice::new(config.output_sample_rate());
    let output = device.open_output(config.output_sample_rate())?;
    let queue = SpeechQueue::new(gemini, output, SpeechQueueConfig::from_config(config));

    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    let task = queue.speak(text, queue.current_generation(), move |e| {
        let _ = errors_tx.send(e);
    });
    let Some(task) = task else {
        if let Ok(e) = errors.try_recv() {
            return Err(e.into());
        }
        anyhow::bail!("nothing speakable in {text:?}");
    };
    task.await?;
    if let Ok(e) = errors.try_recv() {
        return Err(e.into());
    }

    while queue.is_playing() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    device.save_wav(out)?;
    println!("Wrote {}", out.display());
    Ok(())
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Model => "tutor",
        Role::Error => "error",
    }
}

fn format_message(message: &Message) -> String {
    format!("{}: {}", label(message.role), message.text)
}

fn print_message(message: &Message) {
    println!("{}", format_message(message));
}

/// Turns transcript events into terminal text, streaming the growing reply in
/// place. Entries that land mid-reply get their own line and the reply picks
/// up again on the next update.
#[derive(Debug, Default)]
struct EventPrinter {
    /// (index, bytes already printed) of the reply being streamed.
    streaming: Option<(usize, usize)>,
    /// Streamed text is on screen without its newline.
    mid_line: bool,
}

impl EventPrinter {
    fn render(&mut self, event: TutorEvent) -> String {
        let mut out = String::new();
        if let TutorEvent::MessageUpdated { index, text } = &event {
            if let Some((current, printed)) = self.streaming.as_mut() {
                if *current == *index {
                    if let Some(rest) = text.get(*printed..) {
                        if self.mid_line {
                            out.push_str(rest);
                        } else {
                            out.push_str(&format!("{}: {}", label(Role::Model), rest.trim_start()));
                        }
                        *printed = text.len();
                        self.mid_line = true;
                    }
                }
            }
            return out;
        }

        if self.mid_line {
            out.push('\n');
            self.mid_line = false;
        }
        match event {
            TutorEvent::MessageAdded { index, message } => {
                if message.role == Role::Model && message.text.is_empty() {
                    out.push_str(&format!("{}: ", label(message.role)));
                    self.streaming = Some((index, 0));
                    self.mid_line = true;
                } else {
                    out.push_str(&format_message(&message));
                    out.push('\n');
                }
            }
            TutorEvent::MessageReplaced { index, message } => {
                if self.streaming.is_some_and(|(current, _)| current == index) {
                    self.streaming = None;
                }
                out.push_str(&format_message(&message));
                out.push('\n');
            }
            TutorEvent::TranscriptReset => {
                self.streaming = None;
                out.push_str("--- lesson ---\n");
            }
            TutorEvent::Heard(status) => {
                if !status.is_empty() {
                    out.push_str(&format!("  ({status})\n"));
                }
            }
            TutorEvent::VoiceActive(active) => {
                out.push_str(&format!("[voice {}]\n", if active { "on" } else { "off" }));
            }
            TutorEvent::MessageUpdated { .. } => {}
        }
        out
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<TutorEvent>) {
    let mut printer = EventPrinter::default();
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        print!("{}", printer.render(event));
        let _ = stdout.flush();
    }
}

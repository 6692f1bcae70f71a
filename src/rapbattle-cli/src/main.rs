//! RapBattle CLI - AI Rap Battle Generator
//!
//! Runs rap battles between two personas: lyrics, voices, beat, mix and
//! lyric timing, optionally lip-synced talking heads. Also serves the
//! pipeline over HTTP with live progress.

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use rapbattle_core::{
    BattleOrchestrator, BattleRequest, BattleStatus, BeatStyle, Config, Credentials,
    DeliveryStyle, ParticipantInput, ProgressUpdate, ProviderSet, StageStatus, Verse,
    default_config,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rapbattle",
    version,
    about = "AI Rap Battle Generator - Pit two personas against each other",
    long_about = "A CLI tool that writes, voices, mixes and times rap battles using OpenAI-compatible text APIs and hosted or local voices."
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full battle and print its progress
    Battle(BattleArgs),
    /// Write the battle's lyrics only
    Lyrics(BattleArgs),
    /// Serve the HTTP API
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8000", value_name = "ADDR")]
        bind: SocketAddr,
    },
}

#[derive(Args)]
struct BattleArgs {
    /// The battle topic
    #[arg(value_name = "TOPIC")]
    topic: String,

    /// Name of the first rapper
    #[arg(long, default_value = "Fighter A")]
    a_name: String,

    /// Delivery style of the first rapper
    #[arg(long, default_value = "east_coast", value_parser = parse_delivery)]
    a_style: DeliveryStyle,

    /// Voice sample to clone for the first rapper
    #[arg(long, value_name = "WAV")]
    a_voice: Option<PathBuf>,

    /// Pre-written lyrics for the first rapper (verses split by blank lines)
    #[arg(long, value_name = "FILE")]
    a_lyrics: Option<PathBuf>,

    /// Name of the second rapper
    #[arg(long, default_value = "Fighter B")]
    b_name: String,

    /// Delivery style of the second rapper
    #[arg(long, default_value = "west_coast", value_parser = parse_delivery)]
    b_style: DeliveryStyle,

    /// Voice sample to clone for the second rapper
    #[arg(long, value_name = "WAV")]
    b_voice: Option<PathBuf>,

    /// Pre-written lyrics for the second rapper
    #[arg(long, value_name = "FILE")]
    b_lyrics: Option<PathBuf>,

    /// Beat style
    #[arg(short, long, default_value = "trap", value_parser = parse_beat)]
    beat: BeatStyle,

    /// Target tempo
    #[arg(long, value_name = "BPM")]
    bpm: Option<u32>,

    /// Verses per rapper
    #[arg(short = 'n', long, default_value = "2", value_name = "COUNT")]
    verses: usize,

    /// Scene description used as atmosphere in the prompts
    #[arg(long)]
    scene: Option<String>,

    /// One verse each, no video
    #[arg(long)]
    test_mode: bool,
}

fn parse_delivery(s: &str) -> Result<DeliveryStyle, String> {
    s.parse()
}

fn parse_beat(s: &str) -> Result<BeatStyle, String> {
    s.parse()
}

impl BattleArgs {
    fn into_request(self) -> Result<BattleRequest, Box<dyn std::error::Error>> {
        let participant = |name: String,
                           style: DeliveryStyle,
                           voice: Option<PathBuf>,
                           lyrics: Option<PathBuf>|
         -> Result<ParticipantInput, Box<dyn std::error::Error>> {
            let mut input = ParticipantInput::new(name, style);
            if let Some(voice) = voice {
                input = input.with_voice_sample(voice);
            }
            if let Some(path) = lyrics {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| format!("Failed to read lyrics {}: {}", path.display(), e))?;
                input = input.with_lyrics(text);
            }
            Ok(input)
        };

        let fighter_a = participant(self.a_name, self.a_style, self.a_voice, self.a_lyrics)?;
        let fighter_b = participant(self.b_name, self.b_style, self.b_voice, self.b_lyrics)?;

        let mut request = BattleRequest::new(fighter_a, fighter_b, self.topic, self.beat)
            .with_verse_count(self.verses);
        request.bpm_hint = self.bpm;
        request.scene = self.scene;
        request.test_mode = self.test_mode;
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => default_config(),
    };

    let credentials = Credentials::from_env();
    if credentials.text_api_key.is_none() {
        eprintln!(
            "{}",
            "Warning: OPENAI_API_KEY not set. Lyrics must be provided.".yellow()
        );
    }

    let providers = ProviderSet::from_config(&config, &credentials)?;
    let orchestrator = BattleOrchestrator::new(config, providers);

    match cli.command {
        Command::Battle(args) => run_battle(&orchestrator, args.into_request()?).await?,
        Command::Lyrics(args) => {
            let request = args.into_request()?;
            print_header(&request);
            let verses = orchestrator.generate_lyrics(&request).await?;
            print_verses(&request, &verses);
        }
        Command::Serve { bind } => server::serve(orchestrator, bind).await?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,rapbattle_core=debug,rapbattle=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_battle(
    orchestrator: &BattleOrchestrator,
    request: BattleRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    print_header(&request);

    let battle_id = orchestrator.submit(request.clone())?;
    let mut subscription = orchestrator.subscribe(&battle_id)?;

    let mut printed = 0usize;
    let mut last = None;
    while let Some(update) = subscription.next().await {
        printed = print_stage_changes(&update, printed);
        last = Some(update);
    }

    let state = orchestrator.get_state(&battle_id)?;
    println!();
    println!("{}", "═".repeat(70).bright_blue());
    match last.map(|u| u.status) {
        Some(BattleStatus::Complete) => {
            print_verses(&request, &state.artifacts.verses);
            if let Some(mixed) = &state.artifacts.mixed_audio {
                println!(
                    "{} {}",
                    "Track:".bold(),
                    orchestrator.store().resolve(mixed).display().to_string().bright_white()
                );
            }
            if let Some(bpm) = state.artifacts.detected_bpm {
                println!("{} {:.1}", "Detected BPM:".bold(), bpm);
            }
            println!("{} {}", "Timed lines:".bold(), state.artifacts.timing.len());
            println!("{}", "  Battle complete.".bright_green().bold());
        }
        Some(BattleStatus::Cancelled) => {
            println!("{}", "  Battle cancelled.".yellow().bold());
        }
        _ => {
            let detail = state
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| state.message.clone());
            println!("{} {}", "Error:".red().bold(), detail);
        }
    }
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    Ok(())
}

fn print_header(request: &BattleRequest) {
    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!(
        "{}",
        format!(
            "  {} - {} beat",
            "RapBattle".bold(),
            request.beat_style.display_name()
        )
        .bright_blue()
        .bold()
    );
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    println!("{} {}", "Topic:".bold(), request.topic.bright_white());
    println!(
        "  {} {} {}",
        request.fighter_a.display_name_with_style().bright_cyan(),
        "vs".dimmed(),
        request.fighter_b.display_name_with_style().bright_magenta()
    );
    println!("{}", "─".repeat(70).dimmed());
}

/// Print stage results that finished since the last update. Returns the new
/// count of printed results.
fn print_stage_changes(update: &ProgressUpdate, printed: usize) -> usize {
    let finished: Vec<_> = update
        .stages
        .iter()
        .filter(|r| r.status.is_terminal())
        .collect();

    for result in finished.iter().skip(printed) {
        let marker = match result.status {
            StageStatus::Succeeded => "✔".bright_green(),
            StageStatus::Skipped => "↷".dimmed(),
            StageStatus::Cancelled => "■".yellow(),
            _ => "✘".red(),
        };
        let timing = result
            .duration_ms
            .map(|ms| format!("({:.1}s)", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "{} {:>10} {} {}",
            marker,
            result.stage.to_string().bold(),
            result.message,
            timing.dimmed()
        );
        if let Some(error) = &result.error {
            println!("  {}", error.red());
        }
    }

    finished.len().max(printed)
}

fn print_verses(request: &BattleRequest, verses: &[Verse]) {
    for verse in verses {
        let name = &request.participant(verse.speaker).name;
        println!();
        println!(
            "{} {}",
            "▶".bright_cyan(),
            format!("Verse {} - {}", verse.sequence, name).bright_cyan().bold()
        );
        for line in verse.text.lines() {
            println!("  {}", line);
        }
    }
    println!();
}

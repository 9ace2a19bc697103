//! parla - talk to a real-time voice/text agent from the terminal.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use parla_core::media::{AudioSource, MediaError, SyntheticSource};
use parla_core::protocol::AuthDescriptor;
use parla_core::{
    init_logging, EngineConfig, FileStore, RegisterParams, SessionController, SessionEvent,
    SessionHandle,
};
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(name = "parla", about = "Real-time voice/text agent client", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// JSON engine config; PARLA_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Agent websocket endpoint (ws:// or wss://).
    #[arg(long, global = true, env = "PARLA_ENDPOINT")]
    endpoint: Option<String>,
    /// Account to register as; anonymous when omitted.
    #[arg(long, global = true, env = "PARLA_ACCOUNT")]
    account: Option<String>,
    #[arg(long, global = true, env = "PARLA_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Where the session id is remembered between runs.
    #[arg(long, global = true)]
    session_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Send text and print the streamed reply. Reads stdin lines without --message.
    Chat {
        #[arg(short, long)]
        message: Vec<String>,
    },
    /// Hands-free voice conversation.
    Talk {
        /// Feed a 16-bit mono WAV file instead of the microphone.
        #[arg(long)]
        wav: Option<PathBuf>,
        /// Stop after this many seconds.
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
    /// Print the agent's view of the session.
    Query,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    init_logging(&config.log_filter);

    let mut controller = SessionController::new(config.clone());
    if let Some(path) = &cli.global.session_file {
        let store = FileStore::open(path)
            .with_context(|| format!("open session file {}", path.display()))?;
        controller = controller.with_store(Arc::new(store));
    }
    if let Command::Talk { .. } = cli.command {
        controller = with_speaker(controller)?;
    }
    let session = controller.spawn();

    session.connect().await.context("connect")?;
    let session_id = session
        .register(register_params(&cli.global))
        .await
        .context("register")?;
    tracing::info!(session_id = %session_id, endpoint = %config.endpoint, "connected");

    let result = match cli.command {
        Command::Chat { message } => chat(&session, message).await,
        Command::Talk { wav, seconds } => talk(&session, &config, wav, seconds).await,
        Command::Query => {
            let info = session.query_session().await.context("query session")?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    };
    session.shutdown("client exit").await.ok();
    result
}

fn load_config(args: &GlobalArgs) -> anyhow::Result<EngineConfig> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let mut config = config.apply_env().context("environment overrides")?;
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    config.validate()?;
    Ok(config)
}

fn register_params(args: &GlobalArgs) -> RegisterParams {
    let auth = match &args.account {
        Some(account) => AuthDescriptor::account(serde_json::json!({
            "account": account,
            "token": args.token.clone().unwrap_or_default(),
        })),
        None => AuthDescriptor::anonymous(),
    };
    RegisterParams::new(auth)
}

async fn chat(session: &SessionHandle, messages: Vec<String>) -> anyhow::Result<()> {
    let events = session.events();
    if !messages.is_empty() {
        for message in messages {
            let request_id = session.send_text(message).await?;
            print_reply(&events, &request_id).await?;
        }
        return Ok(());
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request_id = session.send_text(line).await?;
        tokio::select! {
            result = print_reply(&events, &request_id) => result?,
            _ = tokio::signal::ctrl_c() => {
                session.interrupt(Some(&request_id), "user").await?;
                println!();
            }
        }
    }
    Ok(())
}

/// Stream one reply to stdout until its terminal event.
async fn print_reply(
    events: &flume::Receiver<SessionEvent>,
    request_id: &str,
) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        let event = events
            .recv_async()
            .await
            .map_err(|_| anyhow!("session stopped"))?;
        match event {
            SessionEvent::TextChunk { request_id: id, text } if id == request_id => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            SessionEvent::MessageComplete { request_id: id, .. } if id == request_id => {
                writeln!(stdout)?;
                return Ok(());
            }
            SessionEvent::Interrupted { request_id: id, .. } if id == request_id => {
                writeln!(stdout, " [interrupted]")?;
                return Ok(());
            }
            SessionEvent::Error {
                request_id: Some(id),
                error,
            } if id == request_id => return Err(error.into()),
            SessionEvent::Error {
                request_id: None,
                error,
            } => tracing::warn!(%error, "session error"),
            SessionEvent::SessionExpired { message } => {
                return Err(anyhow!("session expired: {message}"));
            }
            other => tracing::debug!(?other, "event"),
        }
    }
}

async fn talk(
    session: &SessionHandle,
    config: &EngineConfig,
    wav: Option<PathBuf>,
    seconds: u64,
) -> anyhow::Result<()> {
    let chunk = config.capture.frame_samples;
    session
        .start_listening(move || open_source(wav, chunk))
        .await
        .context("start listening")?;
    eprintln!("listening; ctrl-c to stop");

    let events = session.events();
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv_async() => {
                let Ok(event) = event else { break };
                match event {
                    SessionEvent::SpeechStarted { .. } => eprintln!("[you] ..."),
                    SessionEvent::SpeechEnded { duration_ms, .. } => {
                        eprintln!("[you] {:.1}s", duration_ms / 1000.0);
                    }
                    SessionEvent::TextChunk { text, .. } => {
                        print!("{text}");
                        std::io::stdout().flush()?;
                    }
                    SessionEvent::MessageComplete { .. } => println!(),
                    SessionEvent::Interrupted { .. } => println!(" [interrupted]"),
                    SessionEvent::Error { error, .. } => eprintln!("error: {error}"),
                    SessionEvent::SessionExpired { message } => {
                        return Err(anyhow!("session expired: {message}"));
                    }
                    _ => {}
                }
            }
        }
    }
    session.stop_listening().await?;
    Ok(())
}

fn open_source(wav: Option<PathBuf>, chunk: usize) -> Result<Box<dyn AudioSource>, MediaError> {
    if let Some(path) = wav {
        return Ok(Box::new(SyntheticSource::from_wav_file(path, chunk)?.paced()));
    }
    open_microphone(chunk)
}

#[cfg(feature = "device-audio")]
fn open_microphone(_chunk: usize) -> Result<Box<dyn AudioSource>, MediaError> {
    Ok(Box::new(parla_core::media::device::CpalSource::open()?))
}

#[cfg(not(feature = "device-audio"))]
fn open_microphone(_chunk: usize) -> Result<Box<dyn AudioSource>, MediaError> {
    Err(MediaError::DeviceUnavailable(
        "built without device-audio; pass --wav".into(),
    ))
}

#[cfg(feature = "device-audio")]
fn with_speaker(controller: SessionController) -> anyhow::Result<SessionController> {
    let sink = parla_core::media::device::CpalSink::open().context("open speaker")?;
    Ok(controller.with_audio_sink(Box::new(sink)))
}

#[cfg(not(feature = "device-audio"))]
fn with_speaker(controller: SessionController) -> anyhow::Result<SessionController> {
    Ok(controller)
}

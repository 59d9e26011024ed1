use std::{path::PathBuf, sync::Arc};

use anyhow::bail;
use clap::Parser;
use futures::StreamExt;
use meshroom::{
    config::MeshConfig,
    room::{ConnectionId, RoomEvent, RoomEventStream},
};
use meshroom_wrtc::{host_media::StaticMediaDevices, RoomSession};
use tokio::task::JoinHandle;

mod logger;
mod ws_channel;

use ws_channel::WsChannel;

#[derive(Parser, Debug)]
/// starts the room-repl
struct Args {
    /// signaling service, ex: ws://127.0.0.1:8080/rooms
    url: String,
    /// toml file with mesh settings. defaults to the production settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// capture a microphone only
    #[arg(long)]
    audio_only: bool,
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
    /// module prefixes to log, ex: --log-target meshroom_wrtc --log-target webrtc_ice
    #[arg(long = "log-target", default_values_t = ["meshroom".to_string(), "room_repl".to_string()])]
    log_targets: Vec<String>,
}

/// join full-mesh rooms from the command line
#[derive(Parser, Debug, Eq, PartialEq)]
enum Repl {
    /// join a room under a display name
    Join { room: String, name: String },
    /// mute or unmute the microphone
    Mute,
    /// turn the camera on or off
    Video,
    /// start or stop sharing the screen
    Share,
    /// show everyone in the room
    Participants,
    /// show the negotiation session with each participant
    Sessions,
    /// show the tracks received from a participant
    Tracks { connection_id: String },
    /// leave the current room
    Leave,
}

#[derive(Default)]
struct State {
    session: Option<RoomSession>,
    printer: Option<JoinHandle<()>>,
}

impl State {
    fn session(&self) -> anyhow::Result<&RoomSession> {
        match &self.session {
            Some(session) => Ok(session),
            None => bail!("not in a room. use join first"),
        }
    }

    async fn leave(&mut self) {
        if let Some(session) = self.session.take() {
            session.leave().await;
        }
        if let Some(printer) = self.printer.take() {
            printer.abort();
        }
    }
}

async fn handle_command(state: &mut State, args: &Args, config: &MeshConfig, cmd: Repl) -> anyhow::Result<()> {
    match cmd {
        Repl::Join { room, name } => {
            // a session is single use; leaving the old one first
            state.leave().await;

            let channel = Arc::new(WsChannel::new(args.url.clone()));
            let devices = match args.audio_only {
                true => StaticMediaDevices::audio_only(),
                false => StaticMediaDevices::new(),
            };
            let session = RoomSession::with_webrtc(config.clone(), channel, Arc::new(devices))?;
            let events = session.get_event_stream();
            state.printer = Some(tokio::spawn(print_events(events)));
            state.session = Some(session.clone());

            session.join(&room, &name).await?;
            println!("joined {room} as {name}");
        }
        Repl::Mute => {
            let muted = state.session()?.toggle_mute().await?;
            println!("{}", if muted { "muted" } else { "unmuted" });
        }
        Repl::Video => {
            let enabled = state.session()?.toggle_video().await?;
            println!("camera {}", if enabled { "on" } else { "off" });
        }
        Repl::Share => {
            let sharing = state.session()?.toggle_screen_share().await?;
            println!("screen share {}", if sharing { "started" } else { "stopped" });
        }
        Repl::Participants => {
            for p in state.session()?.participants().await? {
                println!(
                    "{}{} ({}) muted: {} video: {} sharing: {}",
                    p.display_name,
                    if p.is_self { " [you]" } else { "" },
                    p.connection_id,
                    p.is_muted,
                    p.is_video_enabled,
                    p.is_screen_sharing
                );
            }
        }
        Repl::Sessions => {
            let sessions = state.session()?.sessions().await?;
            if sessions.is_empty() {
                println!("no sessions");
            }
            for s in sessions {
                println!(
                    "{} ({}): {} {} ice: {} sending: {:?} receiving: {:?}",
                    s.display_name, s.connection_id, s.role, s.state, s.ice_state, s.outgoing, s.remote_tracks
                );
            }
        }
        Repl::Tracks { connection_id } => {
            let tracks = state
                .session()?
                .remote_media(&ConnectionId::new(connection_id))
                .await?;
            for track in tracks {
                println!("{}", track.kind);
            }
        }
        Repl::Leave => {
            if state.session.is_none() {
                bail!("not in a room");
            }
            state.leave().await;
            println!("left the room");
        }
    }
    Ok(())
}

async fn print_events(mut stream: RoomEventStream) {
    while let Some(evt) = stream.next().await {
        match evt {
            RoomEvent::SessionStateChanged { .. } | RoomEvent::IceStateChanged { .. } => {
                log::debug!("{evt}")
            }
            RoomEvent::Error { message } => println!("error: {message}"),
            RoomEvent::Closed => {
                println!("room closed");
                break;
            }
            evt => println!("{evt}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(args.log_level, args.log_targets.clone())?;

    let config = match &args.config {
        Some(path) => MeshConfig::from_file(path)?,
        None => MeshConfig::production(),
    };
    config.validate()?;

    println!("starting REPL");
    println!("enter --help to see available commands");

    let mut state = State::default();
    let mut iter = std::io::stdin().lines();
    while let Some(Ok(line)) = iter.next() {
        let mut v = vec![""];
        v.extend(line.split_ascii_whitespace());
        let cli = match Repl::try_parse_from(v) {
            Ok(r) => r,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if let Err(e) = handle_command(&mut state, &args, &config, cli).await {
            println!("command failed: {e}");
        }
    }

    state.leave().await;
    Ok(())
}

//! Key Hint - a GUI application for practicing MIDI files on a light-up keyboard.
//!
//! Loads a MIDI file, connects to the keyboard named in the config and shows
//! the current target, progress and connection status. The window's frame
//! subscription drives the practice clock.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use iced::time::{self, milliseconds, Instant};
use iced::widget::{button, column, container, row, text};
use iced::{Center, Element, Fill, Subscription, Theme};
use log::{error, info};

use keyhint::config::TrainerConfig;
use keyhint::midi::note_name;
use keyhint::player::PlayState;
use keyhint::session::{ConnectionStatus, Session};
use keyhint::timeline;

#[derive(Parser, Debug)]
#[command(name = "keyhint", about = "Practice a MIDI file on a light-up keyboard")]
struct Args {
    /// MIDI file to practice (defaults to music_path from the config)
    music: Option<PathBuf>,

    /// Config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(TrainerConfig::default_path);
    let config = TrainerConfig::load(&config_path)?;
    let music_path = args
        .music
        .or_else(|| config.music_path.clone())
        .context("No MIDI file given and no music_path in the config")?;

    let music = timeline::load_file(&music_path, config.keyboard, config.timeline_settings())
        .with_context(|| format!("Failed to load {}", music_path.display()))?;
    let title = music_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Key Hint".to_string());

    let session = Arc::new(Session::new(config, music));
    start_device_thread(session.clone())?;

    iced::application(move || Trainer::new(session.clone(), title.clone()), Trainer::update, Trainer::view)
        .title("Key Hint")
        .subscription(Trainer::subscription)
        .theme(Trainer::theme)
        .run()?;
    Ok(())
}

/// Run the device loop on its own runtime so the MIDI connections never move
/// between threads.
fn start_device_thread(session: Arc<Session>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start device runtime")?;

    std::thread::Builder::new()
        .name("devices".to_string())
        .spawn(move || {
            if let Err(e) = runtime.block_on(session.run_devices()) {
                error!("Device loop stopped: {}", e);
            }
        })
        .context("Failed to spawn device thread")?;
    Ok(())
}

struct Trainer {
    session: Arc<Session>,
    title: String,
    last_frame: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
enum Message {
    Frame(Instant),
    Play,
    Pause,
    Stop,
}

impl Trainer {
    fn new(session: Arc<Session>, title: String) -> Self {
        Self {
            session,
            title,
            last_frame: None,
        }
    }

    fn update(&mut self, message: Message) {
        let mut player = self.session.player().lock().unwrap();
        match message {
            Message::Frame(now) => {
                if let Some(last) = self.last_frame {
                    player.update(now.duration_since(last).as_secs_f64());
                }
                self.last_frame = Some(now);
            }
            Message::Play => {
                info!("Play");
                player.play();
            }
            Message::Pause => {
                info!("Pause");
                player.pause();
            }
            Message::Stop => {
                info!("Stop");
                player.stop();
            }
        }
    }

    fn view(&self) -> Element<'_, Message> {
        let player = self.session.player().lock().unwrap();
        let state = player.state();
        let play_state = player.play_state();

        let (status, status_color) = match play_state {
            PlayState::Playing => ("▶ PLAYING", iced::Color::from_rgb(0.2, 0.8, 0.2)),
            PlayState::Paused => ("⏸ PAUSED", iced::Color::from_rgb(0.9, 0.7, 0.2)),
            PlayState::Stopped => ("⏹ STOPPED", iced::Color::from_rgb(0.6, 0.6, 0.6)),
        };

        let connection_status = match self.session.status() {
            ConnectionStatus::Connected(port) => format!("🎵 {}", port),
            ConnectionStatus::Waiting => format!("❌ Waiting for {}", self.session.config().device_name),
        };

        let target = if state.desired_keys.is_empty() {
            "-".to_string()
        } else {
            names(state.desired_keys.iter().copied())
        };
        let pressed = self.session.pressed_keys();
        let lit = self.session.lit_keys();

        let controls = row![
            button(text("Play")).on_press(Message::Play),
            button(text("Pause")).on_press(Message::Pause),
            button(text("Stop")).on_press(Message::Stop),
        ]
        .spacing(10);

        let content = column![
            text(&self.title).size(40),
            text(connection_status).size(16),
            text("").size(20),
            text(status).size(30).color(status_color),
            text("").size(10),
            text(target).size(60),
            text(format!(
                "Held: {}  ·  Lit: {}",
                names(pressed.iter().copied()),
                names(lit.iter().copied())
            ))
            .size(20),
            text("").size(10),
            text(format!(
                "{} / {}  ·  {:.1} BPM",
                clock(player.time_ms()),
                clock(player.total_ms()),
                player.bpm()
            ))
            .size(30),
            text("").size(20),
            controls,
        ]
        .align_x(Center);

        container(content)
            .width(Fill)
            .height(Fill)
            .center_x(Fill)
            .center_y(Fill)
            .into()
    }

    fn subscription(&self) -> Subscription<Message> {
        time::every(milliseconds(16)).map(Message::Frame)
    }

    fn theme(&self) -> Theme {
        Theme::Dark
    }
}

fn names(keys: impl Iterator<Item = u8>) -> String {
    keys.map(note_name).collect::<Vec<_>>().join(" ")
}

fn clock(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

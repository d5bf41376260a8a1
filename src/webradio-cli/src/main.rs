mod dispatch;
mod format;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{never, select, tick, unbounded, Receiver};
use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use webradio_core::{init_logging, AppDirs, BusMessage, Config, Event, EventBus};
use webradio_player::{ControllerResult, PlayOptions, PlayerController, StateStore};

use crate::dispatch::{ApiCall, HELP};
use crate::format::format_event;

#[derive(Debug, Parser)]
#[command(name = "webradio", version, about = "Web radio and file player driving mpg123")]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long)]
    config: Option<PathBuf>,
    /// Start volume, overriding the saved one
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,
    /// Seconds between keep-alive events (0 disables them)
    #[arg(long, default_value_t = 0)]
    keep_alive: u64,
    /// Also write the log to stderr
    #[arg(short, long)]
    verbose: bool,
    /// Streams or files to play, in order
    urls: Vec<String>,
}

/// Positional URLs from the command line.
#[derive(Debug, Default)]
struct Playlist {
    urls: Vec<String>,
    position: usize,
}

impl Playlist {
    fn new(urls: Vec<String>) -> Self {
        Self { urls, position: 0 }
    }

    fn current(&self) -> Option<&str> {
        self.urls.get(self.position).map(String::as_str)
    }

    fn advance(&mut self) -> Option<&str> {
        if self.position < self.urls.len() {
            self.position += 1;
        }
        self.current()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let mut config = match &cli.config {
        Some(path) => {
            dirs.ensure_exists()?;
            Config::load_from(path)?
        }
        None => Config::load_or_default(&dirs)?,
    };
    if cli.verbose {
        config.logging.console = true;
    }
    let _logging = init_logging(&config.logging, &dirs)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %dirs.config_dir().display(),
        "starting webradio"
    );

    let bus = EventBus::start(&config.events);
    let printer = bus.subscribe("cli").context("printer consumer already registered")?;
    let playlist_events = bus
        .subscribe("playlist")
        .context("playlist consumer already registered")?;
    let printer = thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || print_events(printer))
        .context("failed to start event printer")?;

    let store = StateStore::new(dirs.data_dir());
    let mut persisted = store.load();
    if cli.volume.is_some() {
        persisted.volume = cli.volume;
    }
    let controller = PlayerController::new(config.player.clone(), bus.publisher());
    controller.set_persistent_state(&persisted);

    bus.push_event(Event::Version(env!("CARGO_PKG_VERSION").to_string()));
    if let Err(err) = controller.create() {
        eprintln!("could not start '{}': {err}", config.player.executable);
    }

    let (shutdown_tx, shutdown_rx) = unbounded();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    }) {
        tracing::warn!(error = %err, "failed to install Ctrl-C handler");
    }

    let mut playlist = Playlist::new(cli.urls);
    if let Some(url) = playlist.current() {
        report(controller.play(url, PlayOptions::default()));
    }

    let input = spawn_stdin_reader()?;
    let closed_input = never();
    let mut stdin_open = true;
    let keep_alive = match cli.keep_alive {
        0 => never(),
        secs => tick(Duration::from_secs(secs)),
    };

    loop {
        let stdin = if stdin_open { &input } else { &closed_input };
        select! {
            recv(shutdown_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            recv(stdin) -> line => {
                let Ok(line) = line else {
                    tracing::debug!("stdin closed");
                    stdin_open = false;
                    continue;
                };
                match dispatch::parse(&line) {
                    Ok(Some(ApiCall::Quit)) => break,
                    Ok(Some(call)) => execute(&controller, &mut playlist, call),
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                }
            }
            recv(playlist_events) -> message => match message {
                Ok(BusMessage::Event(event)) => {
                    if let Event::Eof { advance_on_end: true, .. } = *event {
                        if let Some(next) = playlist.advance() {
                            report(controller.play(next, PlayOptions::default()));
                        }
                    }
                }
                Ok(BusMessage::Terminated) | Err(_) => break,
            },
            recv(keep_alive) -> _ => {
                let now = chrono::Local::now().format("%H:%M:%S").to_string();
                bus.push_event(Event::KeepAlive(now));
            }
        }
    }

    tracing::info!("shutting down");
    if let Err(err) = store.save(&controller.get_persistent_state()) {
        tracing::warn!(error = %err, "failed to save player state");
    }
    controller.destroy();
    bus.shutdown();
    if printer.join().is_err() {
        tracing::error!("event printer panicked");
    }
    Ok(())
}

fn execute(controller: &PlayerController, playlist: &mut Playlist, call: ApiCall) {
    match call {
        ApiCall::Play {
            url,
            last,
            resume_at,
        } => report(controller.play(
            &url,
            PlayOptions {
                advance_on_end: last,
                resume_at,
            },
        )),
        ApiCall::Stop { last } => report(controller.stop(last)),
        ApiCall::Pause => report(controller.pause()),
        ApiCall::Resume => report(controller.resume()),
        ApiCall::Toggle => report(controller.toggle()),
        ApiCall::Jump { seconds } => report(controller.jump(seconds)),
        ApiCall::Sample => report(controller.sample()),
        ApiCall::VolUp { by } => report(controller.vol_up(by)),
        ApiCall::VolDown { by } => report(controller.vol_down(by)),
        ApiCall::VolSet { value } => report(controller.vol_set(value)),
        ApiCall::VolMuteOn => report(controller.vol_mute_on()),
        ApiCall::VolMuteOff => report(controller.vol_mute_off()),
        ApiCall::VolMuteToggle => report(controller.vol_mute_toggle()),
        ApiCall::Next => match playlist.advance() {
            Some(next) => report(controller.play(next, PlayOptions::default())),
            None => println!("end of playlist"),
        },
        ApiCall::State => {
            let state = controller.snapshot();
            println!(
                "url: {} | playing: {} | paused: {} | elapsed: {:.0}% | volume: {}{}",
                state.url.as_deref().unwrap_or("-"),
                state.playing,
                state.paused,
                state.elapsed * 100.0,
                state.volume,
                if state.muted { " (muted)" } else { "" },
            );
            if controller.decode_errors() > 0 {
                println!("undecodable player lines: {}", controller.decode_errors());
            }
        }
        ApiCall::Help => println!("{HELP}"),
        ApiCall::Quit => {}
    }
}

fn report<T: std::fmt::Debug>(result: ControllerResult<T>) {
    match result {
        Ok(value) => tracing::debug!(?value, "api call completed"),
        Err(err) => {
            tracing::error!(error = %err, "api call failed");
            println!("error: {err}");
        }
    }
}

fn print_events(rx: Receiver<BusMessage>) {
    for message in rx {
        let Some(event) = message.event() else { break };
        println!("{}", format_event(event));
    }
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to start stdin reader")?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_advances_until_exhausted() {
        let mut playlist = Playlist::new(vec!["a.mp3".into(), "b.mp3".into()]);
        assert_eq!(playlist.current(), Some("a.mp3"));
        assert_eq!(playlist.advance(), Some("b.mp3"));
        assert_eq!(playlist.advance(), None);
        assert_eq!(playlist.advance(), None);
    }

    #[test]
    fn empty_playlist_has_nothing_to_play() {
        let mut playlist = Playlist::default();
        assert_eq!(playlist.current(), None);
        assert_eq!(playlist.advance(), None);
    }

    #[test]
    fn cli_accepts_urls_and_options() {
        let cli = Cli::try_parse_from([
            "webradio",
            "--volume",
            "40",
            "--keep-alive",
            "30",
            "http://radio/live.mp3",
            "/music/a.mp3",
        ])
        .expect("valid arguments");
        assert_eq!(cli.volume, Some(40));
        assert_eq!(cli.keep_alive, 30);
        assert_eq!(cli.urls, vec!["http://radio/live.mp3", "/music/a.mp3"]);
    }

    #[test]
    fn cli_rejects_out_of_range_volume() {
        assert!(Cli::try_parse_from(["webradio", "--volume", "150"]).is_err());
    }
}

//! Playback controller driving an external mpg123 process.
//!
//! Commands are written to the process and, where the protocol answers, the
//! caller blocks until the read loop sees the matching status line. Status
//! lines update [`PlaybackState`] and are translated into bus events.

use crate::channel::{ChannelError, LineChannel, LineReader, ReadOutcome};
use crate::pending::{Ack, PendingOperation, WaitError};
use crate::persistence::PersistentState;
use crate::protocol::{elapsed_fraction, is_playlist, resource_key, Command, StatusLine};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use webradio_core::{Event, EventPublisher, PlayerConfig};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("player process is not running")]
    NotRunning,
    #[error("player did not acknowledge within {0:?}")]
    AckTimeout(Duration),
    #[error("player process exited while a command was pending")]
    ProcessExited,
    #[error("player reported an error: {0}")]
    Player(String),
}

impl From<WaitError> for ControllerError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut(timeout) => ControllerError::AckTimeout(timeout),
            WaitError::Closed => ControllerError::ProcessExited,
            WaitError::Rejected(message) => ControllerError::Player(message),
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Snapshot of what the controller believes the player is doing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackState {
    /// Resource currently loaded, if any.
    pub url: Option<String>,
    pub playing: bool,
    pub paused: bool,
    /// Last sampled position as a fraction of the total length.
    pub elapsed: f64,
    pub volume: u8,
    pub muted: bool,
    /// Volume to restore when unmuting.
    pub saved_volume: u8,
    /// Carried into the `eof` event when the current track ends.
    pub advance_on_end: bool,
}

impl PlaybackState {
    fn new(volume: u8) -> Self {
        Self {
            url: None,
            playing: false,
            paused: false,
            elapsed: 0.0,
            volume,
            muted: false,
            saved_volume: volume,
            advance_on_end: true,
        }
    }

    /// A resource is loaded, whether playing or paused.
    pub fn is_active(&self) -> bool {
        self.playing || self.paused
    }

    fn clear_playback(&mut self) {
        self.url = None;
        self.playing = false;
        self.paused = false;
        self.elapsed = 0.0;
    }
}

/// Options for [`PlayerController::play`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayOptions {
    /// Value reported in the `eof` event once this resource ends.
    pub advance_on_end: bool,
    /// Start paused at this offset in seconds, then sample the position.
    pub resume_at: Option<u64>,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            advance_on_end: true,
            resume_at: None,
        }
    }
}

/// State shared with the read loop.
struct Shared {
    state: Mutex<PlaybackState>,
    pending: PendingOperation,
    events: EventPublisher,
    decode_errors: Mutex<Arc<AtomicU64>>,
}

impl Shared {
    fn handle_line(&self, line: &str) {
        match StatusLine::parse(line) {
            StatusLine::Frame => {}
            StatusLine::IcyMeta(title) => self.events.publish(Event::IcyMeta(title)),
            StatusLine::IcyName(name) => self.events.publish(Event::IcyName(name)),
            StatusLine::Stopped => {
                let eof = {
                    let mut state = self.state.lock();
                    let eof = state.is_active().then(|| Event::Eof {
                        name: state.url.clone().unwrap_or_default(),
                        advance_on_end: state.advance_on_end,
                    });
                    state.clear_playback();
                    eof
                };
                if let Some(eof) = eof {
                    tracing::info!("playback ended");
                    self.events.publish(eof);
                }
                self.pending.release(Ack::Done);
            }
            StatusLine::Paused => {
                let url = {
                    let mut state = self.state.lock();
                    state.paused = true;
                    state.playing = false;
                    state.url.clone().unwrap_or_default()
                };
                self.events.publish(Event::Pause(url));
                self.pending.release(Ack::Done);
            }
            StatusLine::Playing => {
                let url = {
                    let mut state = self.state.lock();
                    state.playing = true;
                    state.paused = false;
                    state.url.clone().unwrap_or_default()
                };
                self.events.publish(Event::Play(url));
                self.pending.release(Ack::Done);
            }
            StatusLine::Sample { position, total } => {
                let elapsed = elapsed_fraction(position, total);
                let paused = {
                    let mut state = self.state.lock();
                    state.elapsed = elapsed;
                    state.paused
                };
                self.events.publish(Event::Sample { elapsed, paused });
                self.pending.release(Ack::Done);
            }
            StatusLine::Jumped => self.pending.release(Ack::Done),
            StatusLine::Error(message) => {
                tracing::warn!(%message, "player reported an error");
                self.pending.release(Ack::Rejected(message));
            }
            StatusLine::Other(line) => tracing::debug!(%line, "unhandled player output"),
        }
    }
}

fn read_loop(mut reader: LineReader, shared: Arc<Shared>) {
    tracing::debug!("player read loop started");
    while let ReadOutcome::Line(line) = reader.read_line() {
        if !line.starts_with("@F") {
            tracing::trace!(%line, "player output");
        }
        shared.handle_line(&line);
    }
    shared.state.lock().clear_playback();
    shared.pending.close();
    tracing::info!("player output closed");
}

/// Drives one player process at a time.
pub struct PlayerController {
    config: PlayerConfig,
    shared: Arc<Shared>,
    channel: Mutex<Option<LineChannel>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Serializes command sequences so acknowledgements cannot interleave.
    op_lock: Mutex<()>,
}

impl PlayerController {
    pub fn new(config: PlayerConfig, events: EventPublisher) -> Self {
        let volume = config.vol_default.min(100);
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState::new(volume)),
                pending: PendingOperation::default(),
                events,
                decode_errors: Mutex::new(Arc::new(AtomicU64::new(0))),
            }),
            channel: Mutex::new(None),
            reader: Mutex::new(None),
            op_lock: Mutex::new(()),
        }
    }

    /// Start the configured player process and apply the current volume.
    ///
    /// On failure the controller stays without a process and playback
    /// operations are no-ops.
    pub fn create(&self) -> ControllerResult<()> {
        if self.channel.lock().is_some() {
            tracing::debug!("player process already running");
            return Ok(());
        }
        let channel = LineChannel::spawn(&self.config.executable, &self.config.command_args())
            .map_err(|err| {
                tracing::error!(error = %err, "could not start player");
                err
            })?;
        self.attach(channel)
    }

    /// Drive an already-established channel instead of spawning a process.
    pub fn attach(&self, mut channel: LineChannel) -> ControllerResult<()> {
        let reader = channel.take_reader().ok_or(ChannelError::NoStdout)?;
        *self.shared.decode_errors.lock() = reader.decode_errors();
        self.shared.pending.reopen();
        *self.channel.lock() = Some(channel);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("player-reader".into())
            .spawn(move || read_loop(reader, shared))
            .map_err(|err| ChannelError::Spawn {
                executable: "player-reader thread".into(),
                source: err,
            })?;
        *self.reader.lock() = Some(handle);

        let volume = self.shared.state.lock().volume;
        self.apply_volume(volume)
    }

    /// Stop the process: `QUIT`, then wait for it to exit within the
    /// configured grace period. A process that does not exit is left alone.
    pub fn destroy(&self) {
        let Some(mut channel) = self.channel.lock().take() else {
            return;
        };
        tracing::info!("stopping player");
        let exited = match channel.terminate(self.config.shutdown_grace()) {
            Ok(()) => true,
            Err(ChannelError::ShutdownTimeout(grace)) => {
                tracing::warn!(?grace, "player process did not exit after QUIT");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to stop player process");
                false
            }
        };
        drop(channel);
        self.shared.pending.close();

        if let Some(handle) = self.reader.lock().take() {
            if exited && handle.join().is_err() {
                tracing::error!("player read loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.channel
            .lock()
            .as_mut()
            .is_some_and(LineChannel::is_running)
    }

    pub fn snapshot(&self) -> PlaybackState {
        self.shared.state.lock().clone()
    }

    /// Number of player output lines skipped as undecodable.
    pub fn decode_errors(&self) -> u64 {
        self.shared.decode_errors.lock().load(Ordering::Relaxed)
    }

    /// Load and start `url`. Returns whether a new load was issued; asking
    /// for the resource that is already loaded only refreshes the position.
    pub fn play(&self, url: &str, options: PlayOptions) -> ControllerResult<bool> {
        let _op = self.op_lock.lock();
        if !self.has_channel() {
            tracing::debug!(url, "no player process; play ignored");
            return Ok(false);
        }

        let (same, active) = {
            let state = self.shared.state.lock();
            let same = state.is_active()
                && state
                    .url
                    .as_deref()
                    .is_some_and(|current| resource_key(current) == resource_key(url));
            (same, state.is_active())
        };
        if same {
            tracing::debug!(url, "already loaded");
            self.send_and_wait(Command::Sample)?;
            return Ok(false);
        }
        if active {
            self.stop_sequence(false)?;
        }

        {
            let mut state = self.shared.state.lock();
            state.url = Some(url.to_string());
            state.advance_on_end = options.advance_on_end;
            state.elapsed = 0.0;
        }
        tracing::info!(url, "loading");

        let loaded = if is_playlist(url) {
            self.send_and_wait(Command::LoadList(url))
        } else if let Some(offset) = options.resume_at.filter(|offset| *offset > 0) {
            self.send_and_wait(Command::LoadPaused(url))
                .and_then(|()| self.send_and_wait(Command::Jump(offset)))
                .and_then(|()| self.send_and_wait(Command::Sample))
        } else {
            self.send_and_wait(Command::Load(url))
        };

        if let Err(err) = loaded {
            let mut state = self.shared.state.lock();
            if !state.is_active() {
                state.url = None;
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Stop the loaded resource. `advance_on_end` is reported in the `eof`
    /// event that follows. Returns false when nothing was loaded.
    pub fn stop(&self, advance_on_end: bool) -> ControllerResult<bool> {
        let _op = self.op_lock.lock();
        if !self.has_channel() || !self.shared.state.lock().is_active() {
            return Ok(false);
        }
        self.stop_sequence(advance_on_end)?;
        Ok(true)
    }

    pub fn pause(&self) -> ControllerResult<bool> {
        let _op = self.op_lock.lock();
        if !self.has_channel() || !self.shared.state.lock().playing {
            return Ok(false);
        }
        self.toggle_sequence()?;
        Ok(true)
    }

    pub fn resume(&self) -> ControllerResult<bool> {
        let _op = self.op_lock.lock();
        if !self.has_channel() || !self.shared.state.lock().paused {
            return Ok(false);
        }
        self.toggle_sequence()?;
        Ok(true)
    }

    /// Pause when playing, resume when paused.
    pub fn toggle(&self) -> ControllerResult<bool> {
        let _op = self.op_lock.lock();
        if !self.has_channel() || !self.shared.state.lock().is_active() {
            return Ok(false);
        }
        self.toggle_sequence()?;
        Ok(true)
    }

    /// Seek to `seconds` from the start of the loaded resource.
    pub fn jump(&self, seconds: u64) -> ControllerResult<bool> {
        let _op = self.op_lock.lock();
        if !self.has_channel() || !self.shared.state.lock().is_active() {
            return Ok(false);
        }
        self.send_and_wait(Command::Jump(seconds))?;
        self.send_and_wait(Command::Sample)?;
        Ok(true)
    }

    /// Refresh the position; `None` when nothing is loaded.
    pub fn sample(&self) -> ControllerResult<Option<f64>> {
        let _op = self.op_lock.lock();
        if !self.has_channel() || !self.shared.state.lock().is_active() {
            return Ok(None);
        }
        self.send_and_wait(Command::Sample)?;
        Ok(Some(self.shared.state.lock().elapsed))
    }

    /// Raise the volume by `by`, or by the configured step.
    pub fn vol_up(&self, by: Option<i32>) -> ControllerResult<u8> {
        let amount = self.volume_step(by);
        let volume = self.update_volume(|current| current.saturating_add(amount));
        self.apply_volume(volume)?;
        Ok(volume)
    }

    /// Lower the volume by `by`, or by the configured step.
    pub fn vol_down(&self, by: Option<i32>) -> ControllerResult<u8> {
        let amount = self.volume_step(by);
        let volume = self.update_volume(|current| current.saturating_sub(amount));
        self.apply_volume(volume)?;
        Ok(volume)
    }

    /// Set the volume, clamped to 0..=100.
    pub fn vol_set(&self, value: i32) -> ControllerResult<u8> {
        let volume = self.update_volume(|_| value);
        self.apply_volume(volume)?;
        Ok(volume)
    }

    /// Mute, remembering the current volume. Returns false if already muted.
    pub fn vol_mute_on(&self) -> ControllerResult<bool> {
        {
            let mut state = self.shared.state.lock();
            if state.muted {
                return Ok(false);
            }
            state.saved_volume = state.volume;
            state.volume = 0;
            state.muted = true;
        }
        self.apply_volume(0)?;
        Ok(true)
    }

    /// Restore the volume saved by [`vol_mute_on`](Self::vol_mute_on).
    pub fn vol_mute_off(&self) -> ControllerResult<bool> {
        let volume = {
            let mut state = self.shared.state.lock();
            if !state.muted {
                return Ok(false);
            }
            state.muted = false;
            state.volume = state.saved_volume;
            state.volume
        };
        self.apply_volume(volume)?;
        Ok(true)
    }

    /// Flip the mute state; returns whether the player is now muted.
    pub fn vol_mute_toggle(&self) -> ControllerResult<bool> {
        if self.shared.state.lock().muted {
            self.vol_mute_off()?;
            Ok(false)
        } else {
            self.vol_mute_on()?;
            Ok(true)
        }
    }

    /// State worth keeping across restarts. While muted, the volume to
    /// restore is reported rather than zero.
    pub fn get_persistent_state(&self) -> PersistentState {
        let state = self.shared.state.lock();
        let volume = if state.muted {
            state.saved_volume
        } else {
            state.volume
        };
        PersistentState {
            volume: Some(volume),
        }
    }

    /// Adopt persisted state. Takes effect on the player at the next
    /// volume change or [`create`](Self::create).
    pub fn set_persistent_state(&self, persisted: &PersistentState) {
        let volume = persisted
            .volume
            .unwrap_or(self.config.vol_default)
            .min(100);
        let mut state = self.shared.state.lock();
        state.volume = volume;
        state.saved_volume = volume;
        state.muted = false;
        tracing::debug!(volume, "restored player state");
    }

    fn has_channel(&self) -> bool {
        self.channel.lock().is_some()
    }

    fn volume_step(&self, by: Option<i32>) -> i32 {
        by.map_or(i32::from(self.config.vol_delta), |by| by.max(0))
    }

    fn update_volume(&self, f: impl FnOnce(i32) -> i32) -> u8 {
        let mut state = self.shared.state.lock();
        let volume = f(i32::from(state.volume)).clamp(0, 100) as u8;
        state.volume = volume;
        volume
    }

    /// Send `VOLUME` without waiting and announce the new value. Without a
    /// process the value is only stored.
    fn apply_volume(&self, volume: u8) -> ControllerResult<()> {
        match self.write(Command::Volume(volume)) {
            Ok(()) => {
                tracing::debug!(volume, "volume set");
                self.shared.events.publish(Event::VolSet(volume));
                Ok(())
            }
            Err(ControllerError::NotRunning) => {
                tracing::debug!(volume, "no player process; volume stored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn stop_sequence(&self, advance_on_end: bool) -> ControllerResult<()> {
        self.shared.state.lock().advance_on_end = advance_on_end;
        self.send_and_wait(Command::Stop)?;
        self.shared.state.lock().elapsed = 0.0;
        Ok(())
    }

    fn toggle_sequence(&self) -> ControllerResult<()> {
        self.send_and_wait(Command::Pause)?;
        self.send_and_wait(Command::Sample)
    }

    fn send_and_wait(&self, command: Command<'_>) -> ControllerResult<()> {
        self.shared.pending.arm()?;
        self.write(command)?;
        self.shared
            .pending
            .wait(self.config.ack_timeout())
            .map_err(|err| {
                tracing::warn!(%command, error = ?err, "command not acknowledged");
                ControllerError::from(err)
            })
    }

    fn write(&self, command: Command<'_>) -> ControllerResult<()> {
        let mut guard = self.channel.lock();
        let channel = guard.as_mut().ok_or(ControllerError::NotRunning)?;
        tracing::debug!(%command, "player command");
        channel.write_line(&command.to_string())?;
        Ok(())
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};

    fn controller() -> (PlayerController, Receiver<Event>) {
        let (tx, rx) = unbounded();
        let controller = PlayerController::new(PlayerConfig::default(), EventPublisher::new(tx));
        (controller, rx)
    }

    fn drain(rx: &Receiver<Event>) -> Vec<Event> {
        rx.try_iter().collect()
    }

    #[test]
    fn playback_operations_are_noops_without_a_process() {
        let (controller, rx) = controller();
        assert!(!controller.play("a.mp3", PlayOptions::default()).unwrap());
        assert!(!controller.stop(true).unwrap());
        assert!(!controller.pause().unwrap());
        assert!(!controller.toggle().unwrap());
        assert_eq!(controller.sample().unwrap(), None);
        assert!(!controller.is_running());
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn volume_is_clamped_and_stored_without_a_process() {
        let (controller, rx) = controller();
        assert_eq!(controller.vol_set(150).unwrap(), 100);
        assert_eq!(controller.vol_set(-3).unwrap(), 0);
        assert_eq!(controller.vol_up(None).unwrap(), 5);
        assert_eq!(controller.vol_up(Some(-10)).unwrap(), 5);
        assert_eq!(controller.vol_down(Some(2)).unwrap(), 3);
        assert_eq!(controller.vol_down(Some(50)).unwrap(), 0);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn extreme_volume_steps_saturate() {
        let (controller, _rx) = controller();
        controller.vol_set(50).unwrap();
        assert_eq!(controller.vol_up(Some(i32::MAX)).unwrap(), 100);
        assert_eq!(controller.vol_down(Some(i32::MAX)).unwrap(), 0);
        assert_eq!(controller.vol_set(i32::MIN).unwrap(), 0);
        assert_eq!(controller.vol_set(i32::MAX).unwrap(), 100);
    }

    #[test]
    fn mute_round_trip_restores_volume() {
        let (controller, _rx) = controller();
        controller.vol_set(40).unwrap();

        assert!(controller.vol_mute_on().unwrap());
        assert!(!controller.vol_mute_on().unwrap());
        assert_eq!(controller.snapshot().volume, 0);
        assert_eq!(controller.get_persistent_state().volume, Some(40));

        assert!(!controller.vol_mute_toggle().unwrap());
        assert_eq!(controller.snapshot().volume, 40);
        assert!(!controller.vol_mute_off().unwrap());
    }

    #[test]
    fn persistent_state_falls_back_to_default_volume() {
        let (controller, _rx) = controller();
        controller.set_persistent_state(&PersistentState { volume: Some(70) });
        assert_eq!(controller.get_persistent_state().volume, Some(70));

        controller.set_persistent_state(&PersistentState::default());
        assert_eq!(
            controller.get_persistent_state().volume,
            Some(PlayerConfig::default().vol_default)
        );
    }

    #[test]
    fn stop_marker_emits_eof_only_when_something_was_loaded() {
        let (controller, rx) = controller();
        let shared = &controller.shared;

        shared.handle_line("@P 0");
        assert!(drain(&rx).is_empty());

        {
            let mut state = shared.state.lock();
            state.url = Some("a.mp3".into());
            state.advance_on_end = true;
        }
        shared.handle_line("@P 2");
        shared.handle_line("@P 0");
        assert_eq!(
            drain(&rx),
            vec![
                Event::Play("a.mp3".into()),
                Event::Eof {
                    name: "a.mp3".into(),
                    advance_on_end: true
                }
            ]
        );
        let state = controller.snapshot();
        assert!(!state.playing && !state.paused);
        assert_eq!(state.url, None);
    }

    #[test]
    fn status_lines_update_state_and_emit_events() {
        let (controller, rx) = controller();
        let shared = &controller.shared;
        shared.state.lock().url = Some("http://radio/live".into());

        shared.handle_line("@P 1");
        assert!(controller.snapshot().paused);
        shared.handle_line("@SAMPLE 30 120");
        shared.handle_line("@P 2");
        shared.handle_line("@I ICY-META: StreamTitle='Artist - Song';");
        shared.handle_line("@I ICY-NAME: Radio");
        shared.handle_line("@F 1 2 0.01 0.02");

        assert_eq!(
            drain(&rx),
            vec![
                Event::Pause("http://radio/live".into()),
                Event::Sample {
                    elapsed: 0.25,
                    paused: true
                },
                Event::Play("http://radio/live".into()),
                Event::IcyMeta("Artist - Song".into()),
                Event::IcyName("Radio".into()),
            ]
        );
        let state = controller.snapshot();
        assert!(state.playing && !state.paused);
        assert_eq!(state.elapsed, 0.25);
    }
}

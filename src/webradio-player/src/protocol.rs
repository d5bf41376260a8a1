//! mpg123 remote-control line protocol.
//!
//! Commands are written one per line to the player's stdin; status lines
//! read from its stdout start with `@` followed by a one-letter category.

use std::fmt;

/// A command understood by the player in remote mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Load(&'a str),
    LoadPaused(&'a str),
    /// Load a playlist, starting at its first entry.
    LoadList(&'a str),
    Stop,
    /// Toggle between paused and playing.
    Pause,
    /// Seek to an absolute offset in seconds.
    Jump(u64),
    Sample,
    Volume(u8),
    Quit,
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Load(url) => write!(f, "LOAD {url}"),
            Command::LoadPaused(url) => write!(f, "LOADPAUSED {url}"),
            Command::LoadList(url) => write!(f, "LOADLIST 0 {url}"),
            Command::Stop => f.write_str("STOP"),
            Command::Pause => f.write_str("PAUSE"),
            Command::Jump(seconds) => write!(f, "JUMP {seconds}s"),
            Command::Sample => f.write_str("SAMPLE"),
            Command::Volume(volume) => write!(f, "VOLUME {volume}"),
            Command::Quit => f.write_str("QUIT"),
        }
    }
}

/// A classified status line.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLine {
    /// `@F`: per-frame timing, emitted continuously while playing.
    Frame,
    IcyMeta(String),
    IcyName(String),
    /// `@P 0`
    Stopped,
    /// `@P 1`
    Paused,
    /// `@P 2`
    Playing,
    /// `@SAMPLE <position> <total>`
    Sample { position: u64, total: u64 },
    /// `@J`
    Jumped,
    /// `@E <message>`
    Error(String),
    /// Anything else (`@R` banner, `@V` volume echo, other `@I` lines).
    Other(String),
}

impl StatusLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.starts_with("@F") {
            return StatusLine::Frame;
        }
        if line.starts_with("@I ICY-META") {
            return StatusLine::IcyMeta(extract_icy_meta(line));
        }
        if let Some(rest) = line.strip_prefix("@I ICY-NAME") {
            let name = rest.strip_prefix(':').unwrap_or(rest).trim();
            return StatusLine::IcyName(name.to_string());
        }
        if let Some(rest) = line.strip_prefix("@P ") {
            match rest.trim() {
                "0" => return StatusLine::Stopped,
                "1" => return StatusLine::Paused,
                "2" => return StatusLine::Playing,
                _ => {}
            }
        }
        if let Some(rest) = line.strip_prefix("@SAMPLE ") {
            let mut fields = rest.split_whitespace().map(str::parse::<u64>);
            if let (Some(Ok(position)), Some(Ok(total))) = (fields.next(), fields.next()) {
                return StatusLine::Sample { position, total };
            }
        }
        if line.starts_with("@J") {
            return StatusLine::Jumped;
        }
        if let Some(rest) = line.strip_prefix("@E") {
            return StatusLine::Error(rest.trim().to_string());
        }
        StatusLine::Other(line.to_string())
    }
}

/// Position as a fraction of the total, clamped to `[0, 1]`; 0 when the
/// total is unknown.
pub fn elapsed_fraction(position: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (position as f64 / total as f64).clamp(0.0, 1.0)
}

/// Pull the quoted title out of `@I ICY-META: StreamTitle='X';`.
///
/// Titles may contain apostrophes, so the value runs from the first quote to
/// the next `';` (or the last quote) rather than to the next quote.
fn extract_icy_meta(line: &str) -> String {
    let Some(start) = line.find('\'') else {
        let rest = line.trim_start_matches("@I ICY-META");
        return rest.strip_prefix(':').unwrap_or(rest).trim().to_string();
    };
    let body = &line[start + 1..];
    let end = body
        .find("';")
        .or_else(|| body.rfind('\''))
        .unwrap_or(body.len());
    body[..end].to_string()
}

/// Whether the resource should be loaded as a playlist.
pub fn is_playlist(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let lower = path.to_ascii_lowercase();
    [".m3u", ".m3u8", ".pls"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Key used to recognise "the same resource" when asked to play it again.
///
/// URLs compare as a whole; local paths compare by file name only, so two
/// files of the same name in different directories are considered equal.
pub fn resource_key(url: &str) -> &str {
    if url.contains("://") {
        return url;
    }
    url.rsplit(['/', '\\']).next().unwrap_or(url)
}

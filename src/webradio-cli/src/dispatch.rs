//! Parsing of interactive API calls of the form `name key=value ...`.

use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Play {
        url: String,
        last: bool,
        resume_at: Option<u64>,
    },
    Stop {
        last: bool,
    },
    Pause,
    Resume,
    Toggle,
    Jump {
        seconds: u64,
    },
    Sample,
    VolUp {
        by: Option<i32>,
    },
    VolDown {
        by: Option<i32>,
    },
    VolSet {
        value: i32,
    },
    VolMuteOn,
    VolMuteOff,
    VolMuteToggle,
    /// Skip to the next entry of the command-line playlist.
    Next,
    State,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown api '{0}' (try 'help')")]
    UnknownApi(String),
    #[error("malformed argument '{0}', expected name=value")]
    MalformedArgument(String),
    #[error("unknown argument '{name}' for '{api}'")]
    UnknownArgument { api: String, name: String },
    #[error("'{api}' requires argument '{name}'")]
    MissingArgument { api: String, name: &'static str },
    #[error("invalid value '{value}' for '{name}'")]
    InvalidValue { name: String, value: String },
}

pub const HELP: &str = "\
apis:
  play url=<url> [last=true|false] [resume=<seconds>]
  stop [last=true|false]
  pause | resume | toggle | sample
  jump seconds=<n>
  vol_up [by=<n>] | vol_down [by=<n>] | vol_set value=<n>
  vol_mute_on | vol_mute_off | vol_mute_toggle
  next | state | help | quit";

struct Args<'a> {
    api: &'a str,
    values: BTreeMap<&'a str, &'a str>,
}

impl<'a> Args<'a> {
    fn parse(api: &'a str, tokens: impl Iterator<Item = &'a str>) -> Result<Self, DispatchError> {
        let mut values = BTreeMap::new();
        for token in tokens {
            let (name, value) = token
                .split_once('=')
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| DispatchError::MalformedArgument(token.to_string()))?;
            values.insert(name, value);
        }
        Ok(Self { api, values })
    }

    fn take<T: FromStr>(&mut self, name: &str) -> Result<Option<T>, DispatchError> {
        let Some(value) = self.values.remove(name) else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|_| DispatchError::InvalidValue {
                name: name.to_string(),
                value: value.to_string(),
            })
    }

    fn require<T: FromStr>(&mut self, name: &'static str) -> Result<T, DispatchError> {
        self.take(name)?.ok_or_else(|| DispatchError::MissingArgument {
            api: self.api.to_string(),
            name,
        })
    }

    fn finish(self, call: ApiCall) -> Result<ApiCall, DispatchError> {
        match self.values.keys().next() {
            Some(name) => Err(DispatchError::UnknownArgument {
                api: self.api.to_string(),
                name: name.to_string(),
            }),
            None => Ok(call),
        }
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<ApiCall>, DispatchError> {
    let mut tokens = line.split_whitespace();
    let Some(api) = tokens.next() else {
        return Ok(None);
    };
    let mut args = Args::parse(api, tokens)?;

    let call = match api {
        "play" => ApiCall::Play {
            url: args.require("url")?,
            last: args.take("last")?.unwrap_or(true),
            resume_at: args.take("resume")?,
        },
        "stop" => ApiCall::Stop {
            last: args.take("last")?.unwrap_or(true),
        },
        "pause" => ApiCall::Pause,
        "resume" => ApiCall::Resume,
        "toggle" => ApiCall::Toggle,
        "jump" => ApiCall::Jump {
            seconds: args.require("seconds")?,
        },
        "sample" => ApiCall::Sample,
        "vol_up" => ApiCall::VolUp {
            by: args.take("by")?,
        },
        "vol_down" => ApiCall::VolDown {
            by: args.take("by")?,
        },
        "vol_set" => ApiCall::VolSet {
            value: args.require("value")?,
        },
        "vol_mute_on" => ApiCall::VolMuteOn,
        "vol_mute_off" => ApiCall::VolMuteOff,
        "vol_mute_toggle" => ApiCall::VolMuteToggle,
        "next" => ApiCall::Next,
        "state" => ApiCall::State,
        "help" => ApiCall::Help,
        "quit" | "exit" => ApiCall::Quit,
        other => return Err(DispatchError::UnknownApi(other.to_string())),
    };
    args.finish(call).map(Some)
}

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::beam::BeamWindow;

/// Help text printed by the `help` command.
pub const HELP: &str = "\
/run/beamOn N                          fire N primaries
/gun/position XMIN XSPAN YMIN YSPAN    rewrite the beam window (cm)
/random/setSeeds S                     set the master seed
help                                   show this text
exit                                   leave the session";

/// Rejected session input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Command not recognised.
    #[error("command not found: `{0}`")]
    Unknown(String),
    /// Fewer arguments than the command takes.
    #[error("{command}: missing parameter `{parameter}`")]
    MissingParameter {
        /// Command path.
        command: &'static str,
        /// Parameter name.
        parameter: &'static str,
    },
    /// Argument could not be parsed.
    #[error("{command}: `{value}` is not a valid {parameter}")]
    InvalidParameter {
        /// Command path.
        command: &'static str,
        /// Parameter name.
        parameter: &'static str,
        /// Raw argument.
        value: String,
    },
    /// More arguments than the command takes.
    #[error("{command}: unexpected parameter `{value}`")]
    UnexpectedParameter {
        /// Command path.
        command: &'static str,
        /// First extra argument.
        value: String,
    },
}

/// A command of the interactive session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    /// `/run/beamOn N`
    BeamOn(u64),
    /// `/gun/position XMIN XSPAN YMIN YSPAN`
    GunPosition(BeamWindow),
    /// `/random/setSeeds S`
    SetSeed(u64),
    /// `help`
    Help,
    /// `exit`
    Exit,
}

impl SessionCommand {
    /// Parses one input line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        line.parse().map(Some)
    }

    /// Command path as typed.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::BeamOn(_) => "/run/beamOn",
            Self::GunPosition(_) => "/gun/position",
            Self::SetSeed(_) => "/random/setSeeds",
            Self::Help => "help",
            Self::Exit => "exit",
        }
    }
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeamOn(events) => write!(f, "{} {events}", self.path()),
            Self::GunPosition(window) => write!(
                f,
                "{} {} {} {} {}",
                self.path(),
                window.x_min,
                window.x_span,
                window.y_min,
                window.y_span
            ),
            Self::SetSeed(seed) => write!(f, "{} {seed}", self.path()),
            Self::Help | Self::Exit => f.write_str(self.path()),
        }
    }
}

const COMMANDS: [&str; 5] = ["/run/beamOn", "/gun/position", "/random/setSeeds", "help", "exit"];

struct Arguments<'a> {
    command: &'static str,
    words: std::str::SplitWhitespace<'a>,
}

impl Arguments<'_> {
    fn next<T: FromStr>(&mut self, parameter: &'static str) -> Result<T, CommandError> {
        let raw = self.words.next().ok_or(CommandError::MissingParameter {
            command: self.command,
            parameter,
        })?;
        raw.parse().map_err(|_| CommandError::InvalidParameter {
            command: self.command,
            parameter,
            value: raw.to_string(),
        })
    }

    fn finish(mut self) -> Result<(), CommandError> {
        match self.words.next() {
            Some(extra) => Err(CommandError::UnexpectedParameter {
                command: self.command,
                value: extra.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl FromStr for SessionCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let head = words.next().unwrap_or_default();
        let command = COMMANDS
            .into_iter()
            .find(|known| *known == head)
            .ok_or_else(|| CommandError::Unknown(head.to_string()))?;
        let mut args = Arguments { command, words };
        let parsed = match command {
            "/run/beamOn" => Self::BeamOn(args.next("N")?),
            "/gun/position" => Self::GunPosition(BeamWindow::new(
                args.next("XMIN")?,
                args.next("XSPAN")?,
                args.next("YMIN")?,
                args.next("YSPAN")?,
            )),
            "/random/setSeeds" => Self::SetSeed(args.next("S")?),
            "help" => Self::Help,
            _ => Self::Exit,
        };
        args.finish()?;
        Ok(parsed)
    }
}

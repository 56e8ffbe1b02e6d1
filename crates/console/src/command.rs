//! Operator command parsing
//!
//! One command per line, words separated by whitespace:
//!
//! ```text
//! accounts                  list accounts and their registration state
//! calls                     list calls
//! dial <account> <uri>      place a call
//! answer <id>               accept a ringing call
//! reject <id>               decline a ringing call
//! hangup <id>               end a call
//! dtmf <id> <digits>        send DTMF digits
//! transfer <id> <uri>       blind transfer
//! play <id> <path>          play a WAV file into a call
//! traces on|off             show or hide SIP trace events
//! help                      show this list
//! quit                      stop the engine and exit
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Usage text printed by `help`
pub const HELP: &str = "\
commands:
  accounts                  list accounts and their registration state
  calls                     list calls
  dial <account> <uri>      place a call
  answer <id>               accept a ringing call
  reject <id>               decline a ringing call
  hangup <id>               end a call
  dtmf <id> <digits>        send DTMF digits
  transfer <id> <uri>       blind transfer
  play <id> <path>          play a WAV file into a call
  traces on|off             show or hide SIP trace events
  help                      show this list
  quit                      stop the engine and exit";

/// Errors raised while parsing an operator command
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?} (try \"help\")")]
    Unknown(String),

    #[error("usage: {usage}")]
    Usage { usage: &'static str },

    #[error("expected \"on\" or \"off\", got {0:?}")]
    InvalidToggle(String),
}

impl CommandError {
    fn usage(usage: &'static str) -> Self {
        Self::Usage { usage }
    }
}

/// A parsed operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Accounts,
    Calls,
    Dial { account: String, uri: String },
    Answer { call_id: String },
    Reject { call_id: String },
    Hangup { call_id: String },
    Dtmf { call_id: String, digits: String },
    Transfer { call_id: String, uri: String },
    Play { call_id: String, path: PathBuf },
    Traces(bool),
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(CommandError::Empty);
        };
        let args: Vec<&str> = words.collect();

        let command = match (name.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("accounts", []) => Command::Accounts,
            ("calls", []) => Command::Calls,
            ("dial", [account, uri]) => Command::Dial {
                account: account.to_string(),
                uri: uri.to_string(),
            },
            ("dial", _) => return Err(CommandError::usage("dial <account> <uri>")),
            ("answer", [id]) => Command::Answer {
                call_id: id.to_string(),
            },
            ("answer", _) => return Err(CommandError::usage("answer <id>")),
            ("reject", [id]) => Command::Reject {
                call_id: id.to_string(),
            },
            ("reject", _) => return Err(CommandError::usage("reject <id>")),
            ("hangup", [id]) => Command::Hangup {
                call_id: id.to_string(),
            },
            ("hangup", _) => return Err(CommandError::usage("hangup <id>")),
            ("dtmf", [id, digits]) => Command::Dtmf {
                call_id: id.to_string(),
                digits: digits.to_string(),
            },
            ("dtmf", _) => return Err(CommandError::usage("dtmf <id> <digits>")),
            ("transfer", [id, uri]) => Command::Transfer {
                call_id: id.to_string(),
                uri: uri.to_string(),
            },
            ("transfer", _) => return Err(CommandError::usage("transfer <id> <uri>")),
            // Paths may contain spaces
            ("play", [id, path @ ..]) if !path.is_empty() => Command::Play {
                call_id: id.to_string(),
                path: PathBuf::from(path.join(" ")),
            },
            ("play", _) => return Err(CommandError::usage("play <id> <path>")),
            ("traces", [toggle]) => match *toggle {
                "on" => Command::Traces(true),
                "off" => Command::Traces(false),
                other => return Err(CommandError::InvalidToggle(other.to_string())),
            },
            ("traces", _) => return Err(CommandError::usage("traces on|off")),
            ("help" | "?", []) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            (other, _) => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Accounts => f.write_str("accounts"),
            Command::Calls => f.write_str("calls"),
            Command::Dial { account, uri } => write!(f, "dial {account} {uri}"),
            Command::Answer { call_id } => write!(f, "answer {call_id}"),
            Command::Reject { call_id } => write!(f, "reject {call_id}"),
            Command::Hangup { call_id } => write!(f, "hangup {call_id}"),
            Command::Dtmf { call_id, digits } => write!(f, "dtmf {call_id} {digits}"),
            Command::Transfer { call_id, uri } => write!(f, "transfer {call_id} {uri}"),
            Command::Play { call_id, path } => write!(f, "play {call_id} {}", path.display()),
            Command::Traces(on) => write!(f, "traces {}", if *on { "on" } else { "off" }),
            Command::Help => f.write_str("help"),
            Command::Quit => f.write_str("quit"),
        }
    }
}

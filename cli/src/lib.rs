//! Command-line handling for `flowcopy`
//!
//! ```text
//! flowcopy copy <src> <dst> [--read-hwm N] [--write-hwm N] [--config FILE]
//! flowcopy hash <src> [--read-hwm N] [--config FILE]
//! ```
//!
//! `-` stands for stdin as a source and stdout as a destination.

use flowio::{StreamError, StreamOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;

pub const USAGE: &str = "usage:
  flowcopy copy <src> <dst> [--read-hwm N] [--write-hwm N] [--config FILE]
  flowcopy hash <src> [--read-hwm N] [--config FILE]";

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}\n{usage}", usage = USAGE)]
    Usage(String),

    #[error("cannot read config {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Options(#[from] StreamError),
}

/// A file path or the process's standard stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Std,
    Path(PathBuf),
}

impl Endpoint {
    fn parse(arg: &str) -> Self {
        if arg == "-" {
            Self::Std
        } else {
            Self::Path(PathBuf::from(arg))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Std => f.write_str("-"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Copy { src: Endpoint, dst: Endpoint },
    Hash { src: Endpoint },
}

/// Options for both ends of a transfer, as read from `--config`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub readable: StreamOptions,
    pub writable: StreamOptions,
}

impl CopyConfig {
    /// Parse JSON such as `{"readable": {"highWaterMark": 4096}}`
    ///
    /// # Errors
    ///
    /// `InvalidOptions` if the JSON is malformed.
    pub fn from_json_reader(reader: impl io::Read) -> Result<Self, StreamError> {
        serde_json::from_reader(reader)
            .map_err(|e| StreamError::InvalidOptions(format!("failed to parse config: {e}")))
    }
}

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    pub read_hwm: Option<usize>,
    pub write_hwm: Option<usize>,
    pub config: Option<PathBuf>,
}

impl Invocation {
    /// Stream options: the config file if given, then the watermark flags
    ///
    /// # Errors
    ///
    /// If the config file cannot be read or parsed, or the resulting
    /// options do not validate.
    pub fn stream_config(&self) -> Result<CopyConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => {
                let file = File::open(path).map_err(|source| CliError::ConfigFile {
                    path: path.clone(),
                    source,
                })?;
                CopyConfig::from_json_reader(file)?
            }
            None => CopyConfig::default(),
        };
        if let Some(hwm) = self.read_hwm {
            config.readable.high_water_mark = hwm;
        }
        if let Some(hwm) = self.write_hwm {
            config.writable.high_water_mark = hwm;
        }
        config.readable.validate()?;
        config.writable.validate()?;
        Ok(config)
    }
}

fn parse_hwm(flag: &str, value: Option<String>) -> Result<usize, CliError> {
    let value = value.ok_or_else(|| CliError::Usage(format!("{flag} needs a value")))?;
    value
        .parse()
        .map_err(|_| CliError::Usage(format!("{flag}: not a byte count: {value}")))
}

/// Parse the arguments that follow the program name
///
/// # Errors
///
/// `CliError::Usage` for unknown commands or flags and missing operands.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation, CliError> {
    let mut args = args.into_iter();
    let mut positional = Vec::new();
    let mut read_hwm = None;
    let mut write_hwm = None;
    let mut config = None;

    while let Some(arg) = args.next() {
        if !arg.starts_with("--") {
            positional.push(arg);
            continue;
        }
        match arg.as_str() {
            "--read-hwm" => read_hwm = Some(parse_hwm("--read-hwm", args.next())?),
            "--write-hwm" => write_hwm = Some(parse_hwm("--write-hwm", args.next())?),
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| CliError::Usage("--config needs a value".to_string()))?;
                config = Some(PathBuf::from(path));
            }
            flag => return Err(CliError::Usage(format!("unknown option {flag}"))),
        }
    }

    let command = match positional.as_slice() {
        [cmd, src, dst] if cmd == "copy" => Command::Copy {
            src: Endpoint::parse(src),
            dst: Endpoint::parse(dst),
        },
        [cmd, src] if cmd == "hash" => {
            if write_hwm.is_some() {
                return Err(CliError::Usage("hash takes no --write-hwm".to_string()));
            }
            Command::Hash {
                src: Endpoint::parse(src),
            }
        }
        [] => return Err(CliError::Usage("missing command".to_string())),
        [cmd, ..] => {
            return Err(CliError::Usage(format!(
                "bad arguments for {cmd}: {}",
                positional.len() - 1
            )))
        }
    };

    Ok(Invocation {
        command,
        read_hwm,
        write_hwm,
        config,
    })
}

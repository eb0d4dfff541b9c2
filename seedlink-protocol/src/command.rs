use crate::error::{Result, SeedlinkError};
use crate::sequence::MessageNumber;
use crate::time::parse_time_arg;

/// A SeedLink v3 client command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Hello,
    Cat,
    Bye,
    Station {
        station: String,
        network: Option<String>,
    },
    End,
    /// Raw pattern arguments; an empty list clears the selection.
    Select {
        patterns: Vec<String>,
    },
    /// Backfill request by message number. `sequence` is `None` for a bare `DATA`.
    Data {
        sequence: Option<MessageNumber>,
        begin: Option<i64>,
    },
    Fetch,
    /// Backfill request by time window (epoch milliseconds).
    Time {
        begin: i64,
        end: Option<i64>,
    },
    Info {
        level: Option<String>,
    },
}

impl Command {
    /// Parse a command from a text line.
    ///
    /// The line should NOT include the trailing line terminator.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| SeedlinkError::InvalidCommand("empty command".into()))?;

        match keyword.to_uppercase().as_str() {
            "HELLO" => {
                reject_extra_args(&mut parts, "HELLO")?;
                Ok(Self::Hello)
            }
            "CAT" => {
                reject_extra_args(&mut parts, "CAT")?;
                Ok(Self::Cat)
            }
            "BYE" => {
                reject_extra_args(&mut parts, "BYE")?;
                Ok(Self::Bye)
            }
            "END" => {
                reject_extra_args(&mut parts, "END")?;
                Ok(Self::End)
            }
            "STATION" => {
                let station = parts
                    .next()
                    .ok_or_else(|| {
                        SeedlinkError::InvalidCommand("STATION requires a station code".into())
                    })?
                    .to_owned();
                let network = parts.next().map(str::to_owned);
                reject_extra_args(&mut parts, "STATION")?;
                Ok(Self::Station { station, network })
            }
            "SELECT" => Ok(Self::Select {
                patterns: parts.map(str::to_owned).collect(),
            }),
            "DATA" => {
                let sequence = parts.next().map(MessageNumber::from_hex).transpose()?;
                let begin = parts.next().map(parse_time_arg).transpose()?;
                reject_extra_args(&mut parts, "DATA")?;
                Ok(Self::Data { sequence, begin })
            }
            // Any arguments are accepted; the command is answered with a fixed reply.
            "FETCH" => Ok(Self::Fetch),
            "TIME" => {
                let begin = parts
                    .next()
                    .ok_or_else(|| SeedlinkError::InvalidCommand("TIME requires begin".into()))
                    .and_then(parse_time_arg)?;
                let end = parts.next().map(parse_time_arg).transpose()?;
                reject_extra_args(&mut parts, "TIME")?;
                if let Some(end) = end {
                    if begin > end {
                        return Err(SeedlinkError::InvalidCommand(
                            "TIME: begin is after end".into(),
                        ));
                    }
                }
                Ok(Self::Time { begin, end })
            }
            "INFO" => {
                let level = parts.next().map(str::to_owned);
                reject_extra_args(&mut parts, "INFO")?;
                Ok(Self::Info { level })
            }
            _ => Err(SeedlinkError::InvalidCommand(format!(
                "unknown command: {keyword:?}"
            ))),
        }
    }

    /// Upper-case command keyword, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Cat => "CAT",
            Self::Bye => "BYE",
            Self::Station { .. } => "STATION",
            Self::End => "END",
            Self::Select { .. } => "SELECT",
            Self::Data { .. } => "DATA",
            Self::Fetch => "FETCH",
            Self::Time { .. } => "TIME",
            Self::Info { .. } => "INFO",
        }
    }
}

fn reject_extra_args(parts: &mut std::str::SplitWhitespace<'_>, command: &str) -> Result<()> {
    if parts.next().is_some() {
        Err(SeedlinkError::InvalidCommand(format!(
            "{command}: unexpected extra arguments"
        )))
    } else {
        Ok(())
    }
}

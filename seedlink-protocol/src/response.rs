use crate::error::{Result, SeedlinkError};

/// Text replies a SeedLink v3 server sends on the command channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error,
    Hello {
        software: String,
        organization: String,
    },
    /// Single-station `CAT` listing. The description column repeats the station code.
    Catalog {
        network: String,
        station: String,
    },
    NotImplemented {
        command: String,
    },
    /// Transaction terminator after a bounded time window.
    End,
}

impl Response {
    /// Parse a single-line response: OK, ERROR, END.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.eq_ignore_ascii_case("OK") {
            return Ok(Self::Ok);
        }
        if line.eq_ignore_ascii_case("END") {
            return Ok(Self::End);
        }
        if line.eq_ignore_ascii_case("ERROR") {
            return Ok(Self::Error);
        }
        if let Some(command) = line.strip_suffix(" command not implemented") {
            return Ok(Self::NotImplemented {
                command: command.to_owned(),
            });
        }

        Err(SeedlinkError::InvalidResponse(format!(
            "unrecognized response: {line:?}"
        )))
    }

    /// Serialize to wire bytes.
    ///
    /// Every reply is `\r\n` terminated except `END`, which is sent bare.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ok => b"OK\r\n".to_vec(),
            Self::Error => b"ERROR\r\n".to_vec(),
            Self::Hello {
                software,
                organization,
            } => format!("{software}\r\n{organization}\r\n").into_bytes(),
            Self::Catalog { network, station } => {
                format!("{network:<2.2} {station:<5.5} {station}\nEND\r\n").into_bytes()
            }
            Self::NotImplemented { command } => {
                format!("{command} command not implemented\r\n").into_bytes()
            }
            Self::End => b"END".to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ok() {
        assert_eq!(Response::parse_line("OK").unwrap(), Response::Ok);
        assert_eq!(Response::parse_line("ok").unwrap(), Response::Ok);
        assert_eq!(Response::parse_line("OK\r\n").unwrap(), Response::Ok);
    }

    #[test]
    fn parse_end() {
        assert_eq!(Response::parse_line("END").unwrap(), Response::End);
        assert_eq!(Response::parse_line("end").unwrap(), Response::End);
    }

    #[test]
    fn parse_error() {
        assert_eq!(Response::parse_line("ERROR\r\n").unwrap(), Response::Error);
    }

    #[test]
    fn parse_not_implemented() {
        assert_eq!(
            Response::parse_line("FETCH command not implemented\r\n").unwrap(),
            Response::NotImplemented {
                command: "FETCH".into()
            }
        );
    }

    #[test]
    fn parse_unknown_response() {
        assert!(Response::parse_line("FOOBAR").is_err());
    }

    #[test]
    fn to_bytes_simple() {
        assert_eq!(Response::Ok.to_bytes(), b"OK\r\n");
        assert_eq!(Response::Error.to_bytes(), b"ERROR\r\n");
        assert_eq!(Response::End.to_bytes(), b"END");
    }

    #[test]
    fn to_bytes_hello() {
        let resp = Response::Hello {
            software: "SeedLink v3.0 (2009.260)".into(),
            organization: "IRIS DMC".into(),
        };
        assert_eq!(resp.to_bytes(), b"SeedLink v3.0 (2009.260)\r\nIRIS DMC\r\n");
    }

    #[test]
    fn to_bytes_catalog_pads_and_truncates() {
        let resp = Response::Catalog {
            network: "IU".into(),
            station: "ALT".into(),
        };
        assert_eq!(resp.to_bytes(), b"IU ALT   ALT\nEND\r\n");

        let resp = Response::Catalog {
            network: "NET".into(),
            station: "LONGSTA".into(),
        };
        assert_eq!(resp.to_bytes(), b"NE LONGS LONGSTA\nEND\r\n");
    }

    #[test]
    fn to_bytes_not_implemented() {
        let resp = Response::NotImplemented {
            command: "FETCH".into(),
        };
        assert_eq!(resp.to_bytes(), b"FETCH command not implemented\r\n");
    }

    #[test]
    fn roundtrip_line_responses() {
        for original in [Response::Ok, Response::Error, Response::End] {
            let bytes = original.to_bytes();
            let line = std::str::from_utf8(&bytes).unwrap();
            assert_eq!(Response::parse_line(line).unwrap(), original);
        }
    }
}

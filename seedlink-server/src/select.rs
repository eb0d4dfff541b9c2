/// SELECT pattern parsing and channel matching for SeedLink v3.
///
/// Pattern format: `[LL]CCC[.T]`
/// - LL = 2-char location code (optional)
/// - CCC = 3-char channel code
/// - .T = type code suffix, only `D` or `?` accepted
/// - `?` is single-char wildcard, other characters match case-insensitively
use std::collections::HashSet;

use crate::record::Scnl;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum SelectError {
    #[error("negative selectors are not supported: {0:?}")]
    Negative(String),
    #[error("unsupported type code in {0:?}")]
    TypeCode(String),
    #[error("pattern length must be 2-5: {0:?}")]
    Length(String),
    #[error("pattern matched no channel: {0:?}")]
    NoMatch(String),
    #[error("no channels available")]
    NoChannels,
}

#[derive(Clone, Debug)]
enum PatternChar {
    Literal(u8),
    Wildcard,
}

impl PatternChar {
    fn matches(&self, byte: u8) -> bool {
        match self {
            PatternChar::Literal(b) => b.eq_ignore_ascii_case(&byte),
            PatternChar::Wildcard => true,
        }
    }

    fn from_byte(b: u8) -> Self {
        if b == b'?' {
            PatternChar::Wildcard
        } else {
            PatternChar::Literal(b)
        }
    }
}

fn compile(s: &str) -> Vec<PatternChar> {
    s.bytes().map(PatternChar::from_byte).collect()
}

/// Equal-length, case-insensitive match with `?` wildcards.
fn matches_field(pattern: &[PatternChar], value: &str) -> bool {
    pattern.len() == value.len()
        && pattern
            .iter()
            .zip(value.bytes())
            .all(|(p, b)| p.matches(b))
}

/// A parsed location/channel selector (type suffix already removed).
#[derive(Clone, Debug)]
pub(crate) struct ChannelPattern {
    location: Option<Vec<PatternChar>>,
    channel: Vec<PatternChar>,
}

impl ChannelPattern {
    /// Parse a 2-5 character selector. Five characters split into location
    /// (2) and channel (3); anything shorter is a channel pattern.
    pub fn parse(pattern: &str) -> Option<Self> {
        if !pattern.is_ascii() || !(2..=5).contains(&pattern.len()) {
            return None;
        }
        if pattern.len() == 5 {
            let (loc, cha) = pattern.split_at(2);
            Some(Self {
                location: Some(compile(loc)),
                channel: compile(cha),
            })
        } else {
            Some(Self {
                location: None,
                channel: compile(pattern),
            })
        }
    }

    pub fn matches(&self, scnl: &Scnl) -> bool {
        if !matches_field(&self.channel, scnl.channel()) {
            return false;
        }
        match &self.location {
            Some(loc) => matches_field(loc, scnl.location()),
            None => true,
        }
    }
}

/// Normalise raw SELECT arguments into location/channel pattern strings.
///
/// Single-character `D`/`?` arguments are dropped, a trailing `.D`/`.?` is
/// stripped, and negative or non-data selectors are rejected.
pub(crate) fn normalize_args(args: &[String]) -> Result<Vec<String>, SelectError> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        if arg.is_empty() {
            continue;
        }
        if arg.contains('!') {
            return Err(SelectError::Negative(arg.clone()));
        }
        let bytes = arg.as_bytes();
        if bytes.len() == 1 {
            if bytes[0].eq_ignore_ascii_case(&b'D') || bytes[0] == b'?' {
                continue;
            }
            return Err(SelectError::TypeCode(arg.clone()));
        }
        let mut pattern = arg.as_str();
        if bytes.len() >= 3 && bytes[bytes.len() - 2] == b'.' {
            let tc = bytes[bytes.len() - 1];
            if !tc.eq_ignore_ascii_case(&b'D') && tc != b'?' {
                return Err(SelectError::TypeCode(arg.clone()));
            }
            pattern = &arg[..arg.len() - 2];
        }
        out.push(pattern.to_owned());
    }
    Ok(out)
}

/// The accumulated SELECT patterns and the channels they resolve to.
#[derive(Clone, Debug, Default)]
pub(crate) struct Selection {
    patterns: Vec<String>,
    channels: HashSet<Scnl>,
}

impl Selection {
    /// Resolve every pattern against `available`.
    ///
    /// Fails if a pattern is malformed or matches no available channel.
    pub fn build(patterns: Vec<String>, available: &HashSet<Scnl>) -> Result<Self, SelectError> {
        if available.is_empty() {
            return Err(SelectError::NoChannels);
        }
        let mut channels = HashSet::new();
        for raw in &patterns {
            let pattern =
                ChannelPattern::parse(raw).ok_or_else(|| SelectError::Length(raw.clone()))?;
            let before = channels.len();
            let mut matched = false;
            for scnl in available.iter().filter(|scnl| pattern.matches(scnl)) {
                channels.insert(scnl.clone());
                matched = true;
            }
            if !matched {
                return Err(SelectError::NoMatch(raw.clone()));
            }
            tracing::trace!(pattern = %raw, added = channels.len() - before, "select pattern resolved");
        }
        Ok(Self { patterns, channels })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn contains(&self, scnl: &Scnl) -> bool {
        self.channels.contains(scnl)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available() -> HashSet<Scnl> {
        [
            Scnl::new("ANMO", "BHZ", "IU", "00"),
            Scnl::new("ANMO", "BHN", "IU", "00"),
            Scnl::new("ANMO", "BHZ", "IU", "10"),
            Scnl::new("ANMO", "LHZ", "IU", "00"),
            Scnl::new("ANMO", "HHZ", "IU", ""),
        ]
        .into_iter()
        .collect()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn channel_only() {
        let pat = ChannelPattern::parse("BHZ").unwrap();
        assert!(pat.matches(&Scnl::new("ANMO", "BHZ", "IU", "00")));
        assert!(pat.matches(&Scnl::new("ANMO", "BHZ", "IU", "10")));
        assert!(!pat.matches(&Scnl::new("ANMO", "BHN", "IU", "00")));
    }

    #[test]
    fn case_insensitive() {
        let pat = ChannelPattern::parse("bhz").unwrap();
        assert!(pat.matches(&Scnl::new("ANMO", "BHZ", "IU", "00")));
    }

    #[test]
    fn location_and_channel() {
        let pat = ChannelPattern::parse("00BHZ").unwrap();
        assert!(pat.matches(&Scnl::new("ANMO", "BHZ", "IU", "00")));
        assert!(!pat.matches(&Scnl::new("ANMO", "BHZ", "IU", "10")));
    }

    #[test]
    fn wildcards() {
        let pat = ChannelPattern::parse("??BH?").unwrap();
        assert!(pat.matches(&Scnl::new("ANMO", "BHZ", "IU", "10")));
        assert!(pat.matches(&Scnl::new("ANMO", "BHN", "IU", "00")));
        assert!(!pat.matches(&Scnl::new("ANMO", "LHZ", "IU", "00")));
        // empty location never matches a 2-char pattern
        assert!(!pat.matches(&Scnl::new("ANMO", "BHZ", "IU", "")));
    }

    #[test]
    fn short_patterns_need_equal_length() {
        let pat = ChannelPattern::parse("HZ").unwrap();
        assert!(!pat.matches(&Scnl::new("ANMO", "HHZ", "IU", "")));
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert!(ChannelPattern::parse("").is_none());
        assert!(ChannelPattern::parse("Z").is_none());
        assert!(ChannelPattern::parse("00BHZX").is_none());
    }

    #[test]
    fn normalize_strips_type_suffix() {
        assert_eq!(
            normalize_args(&args(&["BHZ.D", "00BH?.?", "LHZ"])).unwrap(),
            args(&["BHZ", "00BH?", "LHZ"])
        );
    }

    #[test]
    fn normalize_drops_single_data_type() {
        assert_eq!(normalize_args(&args(&["D", "?", "d"])).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn normalize_rejects_unsupported() {
        assert_eq!(
            normalize_args(&args(&["!BHZ"])),
            Err(SelectError::Negative("!BHZ".into()))
        );
        assert_eq!(
            normalize_args(&args(&["BHZ.E"])),
            Err(SelectError::TypeCode("BHZ.E".into()))
        );
        assert_eq!(
            normalize_args(&args(&["E"])),
            Err(SelectError::TypeCode("E".into()))
        );
    }

    #[test]
    fn build_collects_matches() {
        let sel = Selection::build(args(&["BH?", "00LHZ"]), &available()).unwrap();
        assert_eq!(sel.len(), 4);
        assert!(sel.contains(&Scnl::new("ANMO", "LHZ", "IU", "00")));
        assert!(!sel.contains(&Scnl::new("ANMO", "HHZ", "IU", "")));
        assert_eq!(sel.patterns(), &args(&["BH?", "00LHZ"])[..]);
    }

    #[test]
    fn build_fails_when_a_pattern_matches_nothing() {
        assert_eq!(
            Selection::build(args(&["BHZ", "EHZ"]), &available()).unwrap_err(),
            SelectError::NoMatch("EHZ".into())
        );
    }

    #[test]
    fn build_fails_without_channels() {
        assert_eq!(
            Selection::build(args(&["BHZ"]), &HashSet::new()).unwrap_err(),
            SelectError::NoChannels
        );
    }

    #[test]
    fn build_rejects_bad_length() {
        assert_eq!(
            Selection::build(args(&["B"]), &available()).unwrap_err(),
            SelectError::Length("B".into())
        );
    }
}

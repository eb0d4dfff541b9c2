use crate::error::{Result, SeedlinkError};

/// 24-bit wrapping message number stamped on every SeedLink v3 record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageNumber(u32);

impl MessageNumber {
    /// Largest message number (6 hex digits).
    pub const MAX: u32 = 0xFF_FFFF;

    /// Distance from either end of the number space inside which a
    /// backwards step is treated as a wraparound rather than a stale record.
    pub const ROLLOVER_OFFSET: u32 = 100;

    /// Build a message number, masking to 24 bits.
    pub fn new(value: u32) -> Self {
        Self(value & Self::MAX)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// The following message number, wrapping `FFFFFF` to `000000`.
    pub fn next(self) -> Self {
        if self.0 >= Self::MAX {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }

    /// Parse the hex argument of a `DATA` command (1 to 6 hex digits).
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.is_empty() || hex.len() > 6 {
            return Err(SeedlinkError::InvalidMessageNumber(format!(
                "expected 1-6 hex digits, got {} ({hex:?})",
                hex.len()
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SeedlinkError::InvalidMessageNumber(format!(
                "invalid hex: {hex:?}"
            )));
        }
        let value = u32::from_str_radix(hex, 16)
            .map_err(|_| SeedlinkError::InvalidMessageNumber(format!("invalid hex: {hex:?}")))?;
        Ok(Self(value))
    }

    /// Serialize to 6 uppercase hex digits.
    pub fn to_hex(self) -> String {
        format!("{:06X}", self.0)
    }

    /// Whether stepping from `last` back to `current` looks like the
    /// 24-bit counter wrapping around.
    ///
    /// This only compares both values against fixed windows at the ends of
    /// the number space, so a burst of more than ~100 records between two
    /// deliveries can make it misjudge. Treat it as an approximation.
    pub fn is_rollover(last: Self, current: Self) -> bool {
        current.0 <= Self::ROLLOVER_OFFSET && last.0 >= Self::MAX - Self::ROLLOVER_OFFSET
    }
}

impl std::fmt::Display for MessageNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06X}", self.0)
    }
}

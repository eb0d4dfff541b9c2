//! Channel identity, binary records, and message-number issuance.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

use seedlink_hub_protocol::MessageNumber;

use crate::time::now_ms;

/// Station, channel, network, location identity of a data channel.
///
/// Equality and hashing use the canonical `STA.CHA.NET.LOC` string.
#[derive(Clone, Debug)]
pub struct Scnl {
    station: String,
    channel: String,
    network: String,
    location: String,
    id: String,
}

impl Scnl {
    pub fn new(station: &str, channel: &str, network: &str, location: &str) -> Self {
        let station = station.trim().to_owned();
        let channel = channel.trim().to_owned();
        let network = network.trim().to_owned();
        let location = location.trim().to_owned();
        let id = format!("{station}.{channel}.{network}.{location}");
        Self {
            station,
            channel,
            network,
            location,
            id,
        }
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Canonical dot-joined identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl PartialEq for Scnl {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Scnl {}

impl Hash for Scnl {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Scnl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// An encoded record ready for caching and delivery.
///
/// Records are immutable once built and shared behind `Arc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryRecord {
    pub scnl: Scnl,
    /// Start time of the first sample, epoch milliseconds.
    pub start_time: i64,
    pub payload: Vec<u8>,
    pub sample_count: u32,
    pub message_number: MessageNumber,
    /// Creation time, epoch milliseconds. Drives age-based cache eviction.
    pub created_at: i64,
}

impl BinaryRecord {
    pub fn new(
        scnl: Scnl,
        start_time: i64,
        payload: Vec<u8>,
        sample_count: u32,
        message_number: MessageNumber,
    ) -> Self {
        Self {
            scnl,
            start_time,
            payload,
            sample_count,
            message_number,
            created_at: now_ms(),
        }
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Issues 24-bit message numbers, wrapping `FFFFFF` to `000000`.
///
/// Share one generator (behind `Arc`) between every component that stamps
/// records for the same set of clients.
#[derive(Debug, Default)]
pub struct MessageNumberGenerator {
    next: AtomicU32,
}

impl MessageNumberGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start issuing at `first`.
    pub fn starting_at(first: MessageNumber) -> Self {
        Self {
            next: AtomicU32::new(first.value()),
        }
    }

    /// Take the next message number.
    pub fn next_number(&self) -> MessageNumber {
        let prev = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(MessageNumber::new(n).next().value())
            })
            .unwrap_or_default();
        MessageNumber::new(prev)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn scnl_trims_and_joins() {
        let scnl = Scnl::new(" ANMO ", "BHZ", "IU ", "");
        assert_eq!(scnl.station(), "ANMO");
        assert_eq!(scnl.network(), "IU");
        assert_eq!(scnl.location(), "");
        assert_eq!(scnl.to_string(), "ANMO.BHZ.IU.");
    }

    #[test]
    fn scnl_equality_by_id() {
        let a = Scnl::new("ANMO", "BHZ", "IU", "00");
        let b = Scnl::new("ANMO ", " BHZ", "IU", "00 ");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&Scnl::new("ANMO", "BHN", "IU", "00")));
    }

    #[test]
    fn record_stamps_creation_time() {
        let before = now_ms();
        let record = BinaryRecord::new(
            Scnl::new("ANMO", "BHZ", "IU", ""),
            0,
            vec![0; 512],
            0,
            MessageNumber::new(1),
        );
        assert!(record.created_at >= before);
        assert_eq!(record.with_created_at(5).created_at, 5);
    }

    #[test]
    fn generator_counts_up() {
        let numbers = MessageNumberGenerator::new();
        assert_eq!(numbers.next_number().value(), 0);
        assert_eq!(numbers.next_number().value(), 1);
        assert_eq!(numbers.next_number().value(), 2);
    }

    #[test]
    fn generator_wraps() {
        let numbers = MessageNumberGenerator::starting_at(MessageNumber::new(0xFFFFFE));
        assert_eq!(numbers.next_number().value(), 0xFFFFFE);
        assert_eq!(numbers.next_number().value(), 0xFFFFFF);
        assert_eq!(numbers.next_number().value(), 0);
    }
}

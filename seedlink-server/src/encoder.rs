//! Sample-to-record encoding.
//!
//! [`Int32Encoder`] builds uncompressed 512-byte miniSEED v2 records with
//! `miniseed-rs`:
//!
//! ```text
//! 0..48    fixed section of data header
//! 48..56   blockette 1000 (encoding, word order, record length)
//! 56..512  big-endian INT32 samples (114 per record)
//! ```
//!
//! [`log_record`] writes the same layout by hand with encoding 0 (ASCII),
//! which `miniseed-rs` does not encode.

use miniseed_rs::{EncodingFormat, MseedRecord, NanoTime, Samples};
use seedlink_hub_protocol::MessageNumber;
use seedlink_hub_protocol::frame::v3::PAYLOAD_LEN;
use tracing::warn;

use crate::record::{BinaryRecord, MessageNumberGenerator, Scnl};
use crate::time::nano_time;

const HEADER_LEN: usize = 48;
/// Uncompressed data follows blockette 1000 directly.
const DATA_OFFSET: usize = 56;
const DATA_LEN: usize = PAYLOAD_LEN - DATA_OFFSET;

/// Samples per INT32 record.
pub const SAMPLES_PER_RECORD: usize = DATA_LEN / 4;

const ENCODING_ASCII: u8 = 0;
/// log2(512)
const RECORD_LENGTH_EXP: u8 = 9;
const MAX_RECORD_SEQUENCE: u32 = 999_999;

/// A contiguous run of digitizer samples for one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBatch {
    /// Time of the first sample, epoch milliseconds.
    pub start_time: i64,
    /// Samples per second.
    pub sample_rate: f64,
    pub samples: Vec<i32>,
}

/// Turns sample batches into binary records.
///
/// One encoder instance serves one channel; stateful encoders keep their
/// per-channel counters between calls.
pub trait RecordEncoder: Send {
    fn encode(
        &mut self,
        scnl: &Scnl,
        batch: &SampleBatch,
        numbers: &MessageNumberGenerator,
    ) -> Vec<BinaryRecord>;
}

/// Uncompressed INT32 miniSEED v2 encoder.
#[derive(Debug)]
pub struct Int32Encoder {
    record_sequence: u32,
}

impl Int32Encoder {
    pub fn new() -> Self {
        Self { record_sequence: 0 }
    }

    fn next_sequence(&mut self) -> u32 {
        self.record_sequence = if self.record_sequence >= MAX_RECORD_SEQUENCE {
            1
        } else {
            self.record_sequence + 1
        };
        self.record_sequence
    }
}

impl Default for Int32Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordEncoder for Int32Encoder {
    fn encode(
        &mut self,
        scnl: &Scnl,
        batch: &SampleBatch,
        numbers: &MessageNumberGenerator,
    ) -> Vec<BinaryRecord> {
        if !is_encodable_rate(batch.sample_rate) {
            warn!(channel = %scnl, rate = batch.sample_rate, "unsupported sample rate, batch dropped");
            return Vec::new();
        }

        let mut records = Vec::with_capacity(batch.samples.len().div_ceil(SAMPLES_PER_RECORD));
        let mut offset = 0usize;
        for chunk in batch.samples.chunks(SAMPLES_PER_RECORD) {
            let start_time =
                batch.start_time + (offset as f64 * 1000.0 / batch.sample_rate).round() as i64;
            offset += chunk.len();

            let Some(start) = nano_time(start_time) else {
                warn!(channel = %scnl, start_time, "start time out of range, record dropped");
                continue;
            };
            let mut record = MseedRecord::new()
                .with_nslc(scnl.network(), scnl.station(), scnl.location(), scnl.channel())
                .with_start_time(start)
                .with_sample_rate(batch.sample_rate)
                .with_encoding(EncodingFormat::Int32)
                .with_samples(Samples::Int(chunk.to_vec()));
            record.sequence_number = format!("{:06}", self.next_sequence());

            let payload = match miniseed_rs::encode(&record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = %scnl, error = %e, "record encoding failed, record dropped");
                    continue;
                }
            };
            records.push(BinaryRecord::new(
                scnl.clone(),
                start_time,
                payload,
                chunk.len() as u32,
                numbers.next_number(),
            ));
        }
        records
    }
}

/// Whether the header can carry `rate` exactly: whole rates up to
/// `i16::MAX` Hz, or sub-hertz rates with a whole-second period.
fn is_encodable_rate(rate: f64) -> bool {
    let whole = |x: f64| (x - x.round()).abs() < 1e-9 && x.round() <= f64::from(i16::MAX);
    if !rate.is_finite() || rate <= 0.0 {
        false
    } else if rate >= 1.0 {
        whole(rate)
    } else {
        whole(1.0 / rate)
    }
}

/// Build an ASCII log record (`SL.INFO..INF`) carrying `text`.
///
/// Text beyond the data area is truncated.
pub fn log_record(text: &str, start_time: i64, number: MessageNumber) -> BinaryRecord {
    let scnl = Scnl::new("INFO", "INF", "SL", "");
    let bytes = &text.as_bytes()[..text.len().min(DATA_LEN)];
    let start = nano_time(start_time).unwrap_or_else(NanoTime::epoch).to_btime();

    let mut p = vec![0u8; PAYLOAD_LEN];
    p[0..6].copy_from_slice(b"000001");
    p[6] = b'D';
    p[7] = b' ';
    put_ascii(&mut p[8..13], scnl.station());
    put_ascii(&mut p[13..15], scnl.location());
    put_ascii(&mut p[15..18], scnl.channel());
    put_ascii(&mut p[18..20], scnl.network());
    p[20..22].copy_from_slice(&start.year.to_be_bytes());
    p[22..24].copy_from_slice(&start.day.to_be_bytes());
    p[24] = start.hour;
    p[25] = start.minute;
    p[26] = start.second;
    p[28..30].copy_from_slice(&start.fract.to_be_bytes());
    p[30..32].copy_from_slice(&(bytes.len() as u16).to_be_bytes());
    // rate factor and multiplier stay zero: no sampling
    p[39] = 1; // blockettes that follow
    p[44..46].copy_from_slice(&(DATA_OFFSET as u16).to_be_bytes());
    p[46..48].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());

    // Blockette 1000
    p[48..50].copy_from_slice(&1000u16.to_be_bytes());
    p[52] = ENCODING_ASCII;
    p[53] = 1; // big-endian
    p[54] = RECORD_LENGTH_EXP;

    p[DATA_OFFSET..DATA_OFFSET + bytes.len()].copy_from_slice(bytes);
    BinaryRecord::new(scnl, start_time, p, bytes.len() as u32, number)
}

/// Write the space-padded `text` into `dst`, truncating to its length.
fn put_ascii(dst: &mut [u8], text: &str) {
    dst.fill(b' ');
    let src = text.as_bytes();
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

#[cfg(test)]
mod tests {
    use seedlink_hub_protocol::frame::v3;

    use super::*;

    fn scnl() -> Scnl {
        Scnl::new("ANMO", "BHZ", "IU", "00")
    }

    fn batch(len: usize, rate: f64) -> SampleBatch {
        SampleBatch {
            start_time: 1_705_314_645_000,
            sample_rate: rate,
            samples: (0..len as i32).collect(),
        }
    }

    fn decode(record: &BinaryRecord) -> MseedRecord {
        miniseed_rs::decode(&record.payload).unwrap()
    }

    #[test]
    fn splits_into_full_records() {
        let numbers = MessageNumberGenerator::new();
        let records = Int32Encoder::new().encode(&scnl(), &batch(250, 100.0), &numbers);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.sample_count).collect::<Vec<_>>(),
            vec![114, 114, 22]
        );
        assert!(records.iter().all(|r| r.payload.len() == PAYLOAD_LEN));
        assert_eq!(
            records.iter().map(|r| r.message_number.value()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(decode(&records[2]).samples, Samples::Int((228..250).collect()));
    }

    #[test]
    fn start_time_advances_by_samples() {
        let numbers = MessageNumberGenerator::new();
        let records = Int32Encoder::new().encode(&scnl(), &batch(228, 20.0), &numbers);
        assert_eq!(records[0].start_time, 1_705_314_645_000);
        // 114 samples at 20 Hz = 5.7 s
        assert_eq!(records[1].start_time, 1_705_314_650_700);

        let start = decode(&records[1]).start_time;
        assert_eq!((start.year, start.day), (2024, 15));
        assert_eq!((start.hour, start.minute, start.second), (10, 30, 50));
        assert_eq!(start.nanosecond, 700_000_000);
    }

    #[test]
    fn header_fields() {
        let numbers = MessageNumberGenerator::new();
        let r = &Int32Encoder::new().encode(&scnl(), &batch(3, 40.0), &numbers)[0];
        assert_eq!(&r.payload[0..8], b"000001D ");
        assert_eq!(&r.payload[8..20], b"ANMO 00BHZIU");

        let rec = decode(r);
        assert_eq!(
            (rec.network.as_str(), rec.station.as_str(), rec.location.as_str(), rec.channel.as_str()),
            ("IU", "ANMO", "00", "BHZ")
        );
        assert_eq!(rec.sequence_number, "000001");
        assert_eq!(rec.sample_rate, 40.0);
        assert_eq!(rec.encoding, EncodingFormat::Int32);
        assert_eq!(rec.record_length, 512);
        assert_eq!(rec.samples, Samples::Int(vec![0, 1, 2]));
    }

    #[test]
    fn record_sequence_wraps() {
        let numbers = MessageNumberGenerator::new();
        let mut enc = Int32Encoder {
            record_sequence: MAX_RECORD_SEQUENCE - 1,
        };
        let records = enc.encode(&scnl(), &batch(3 * SAMPLES_PER_RECORD, 1.0), &numbers);
        let seqs: Vec<&[u8]> = records.iter().map(|r| &r.payload[0..6]).collect();
        assert_eq!(seqs, vec![&b"999999"[..], &b"000001"[..], &b"000002"[..]]);
    }

    #[test]
    fn sample_rates_survive_decoding() {
        let numbers = MessageNumberGenerator::new();
        for rate in [0.1, 1.0, 100.0, 500.0, 32_767.0] {
            let records = Int32Encoder::new().encode(&scnl(), &batch(10, rate), &numbers);
            assert_eq!(decode(&records[0]).sample_rate, rate, "rate {rate}");
        }
    }

    #[test]
    fn inexact_sample_rates_are_dropped() {
        let numbers = MessageNumberGenerator::new();
        for rate in [500.5, 12.5, 0.3, 40_000.0, 1.0 / 40_000.0] {
            assert!(
                Int32Encoder::new().encode(&scnl(), &batch(10, rate), &numbers).is_empty(),
                "rate {rate}"
            );
        }
        assert_eq!(numbers.next_number().value(), 0);
    }

    #[test]
    fn invalid_rate_is_dropped() {
        let numbers = MessageNumberGenerator::new();
        for rate in [0.0, -20.0, f64::NAN, f64::INFINITY] {
            assert!(Int32Encoder::new().encode(&scnl(), &batch(10, rate), &numbers).is_empty());
        }
        assert!(Int32Encoder::new().encode(&scnl(), &batch(0, 10.0), &numbers).is_empty());
    }

    #[test]
    fn out_of_range_start_time_is_dropped() {
        let numbers = MessageNumberGenerator::new();
        let mut b = batch(10, 10.0);
        b.start_time = i64::MAX / 2;
        assert!(Int32Encoder::new().encode(&scnl(), &b, &numbers).is_empty());
        assert_eq!(numbers.next_number().value(), 0);
    }

    #[test]
    fn log_record_is_ascii() {
        // 2024-01-15T10:30:45.123Z
        let r = log_record("hello", 1_705_314_645_123, MessageNumber::new(7));
        assert_eq!(r.scnl.id(), "INFO.INF.SL.");
        assert_eq!(r.message_number.value(), 7);
        assert_eq!(r.sample_count, 5);
        assert_eq!(&r.payload[8..20], b"INFO   INFSL");
        assert_eq!(u16::from_be_bytes([r.payload[20], r.payload[21]]), 2024);
        assert_eq!(u16::from_be_bytes([r.payload[22], r.payload[23]]), 15);
        assert_eq!(&r.payload[24..27], &[10, 30, 45]);
        assert_eq!(u16::from_be_bytes([r.payload[28], r.payload[29]]), 1230);
        assert_eq!(&r.payload[52..55], &[ENCODING_ASCII, 1, RECORD_LENGTH_EXP]);
        assert_eq!(&r.payload[56..61], b"hello");
        assert!(matches!(
            miniseed_rs::decode(&r.payload),
            Err(miniseed_rs::MseedError::UnsupportedEncoding(0))
        ));

        let long = "x".repeat(1000);
        assert_eq!(log_record(&long, 0, MessageNumber::new(8)).sample_count as usize, DATA_LEN);
    }

    #[test]
    fn fits_a_data_frame() {
        let numbers = MessageNumberGenerator::new();
        let r = &Int32Encoder::new().encode(&scnl(), &batch(114, 100.0), &numbers)[0];
        let frame = v3::write(r.message_number, &r.payload).unwrap();
        let raw = v3::parse(&frame).unwrap();
        assert_eq!(raw.payload(), &r.payload[..]);

        let decoded = raw.decode().unwrap();
        assert_eq!(decoded.sequence, Some(r.message_number));
        assert_eq!(decoded.record.channel, "BHZ");
        assert_eq!(decoded.record.samples, Samples::Int((0..114).collect()));
    }
}

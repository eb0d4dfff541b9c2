//! Publishing side of the server: encode samples, cache, fan out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use seedlink_hub_protocol::MessageNumber;
use seedlink_hub_protocol::frame::v3::PAYLOAD_LEN;
use tracing::{debug, trace};

use crate::ServerConfig;
use crate::cache::MessageCache;
use crate::encoder::{Int32Encoder, RecordEncoder, SampleBatch, log_record};
use crate::error::{Result, ServerError};
use crate::record::{BinaryRecord, MessageNumberGenerator, Scnl};
use crate::registry::ConnectionRegistry;
use crate::time::{format_started, now_ms};

/// Source of the channels a client may `SELECT`.
pub trait ChannelDirectory: Send + Sync {
    fn channels(&self) -> HashSet<Scnl>;
}

/// Builds the record answering an `INFO` request.
///
/// Returns `None` for levels the responder does not support.
pub trait InfoResponder: Send + Sync {
    fn info_record(&self, level: Option<&str>) -> Option<BinaryRecord>;
}

struct ManagerInner {
    cache: MessageCache,
    registry: ConnectionRegistry,
    numbers: Arc<MessageNumberGenerator>,
    encoders: Mutex<HashMap<Scnl, Box<dyn RecordEncoder>>>,
    known: RwLock<HashSet<Scnl>>,
    id_xml: String,
}

/// Shared handle for feeding data into the server. Clone is cheap (Arc).
///
/// Every record published here is cached and offered to each connected
/// session.
#[derive(Clone)]
pub struct MessageManager(Arc<ManagerInner>);

impl MessageManager {
    pub(crate) fn new(
        config: &ServerConfig,
        cache: MessageCache,
        registry: ConnectionRegistry,
        numbers: Arc<MessageNumberGenerator>,
        started: i64,
    ) -> Self {
        Self(Arc::new(ManagerInner {
            cache,
            registry,
            numbers,
            encoders: Mutex::new(HashMap::new()),
            known: RwLock::new(HashSet::new()),
            id_xml: id_xml(&config.software, &config.organization, &format_started(started)),
        }))
    }

    /// Use `encoder` for `scnl` instead of the default INT32 encoder.
    pub fn set_encoder(&self, scnl: Scnl, encoder: Box<dyn RecordEncoder>) {
        self.0.encoders.lock().unwrap().insert(scnl, encoder);
    }

    /// Encode a batch of samples and publish the resulting records.
    ///
    /// Returns the number of records published.
    pub fn process(&self, scnl: &Scnl, batch: &SampleBatch) -> usize {
        // Held through publish so message numbers reach sessions in order.
        let mut encoders = self.0.encoders.lock().unwrap();
        let encoder = encoders
            .entry(scnl.clone())
            .or_insert_with(|| -> Box<dyn RecordEncoder> { Box::new(Int32Encoder::new()) });
        let records = encoder.encode(scnl, batch, &self.0.numbers);
        let count = records.len();
        for record in records {
            self.distribute(Arc::new(record));
        }
        trace!(channel = %scnl, count, "batch published");
        count
    }

    /// Cache a finished record and offer it to every session.
    ///
    /// Fails if the payload is not exactly one 512-byte record.
    pub fn publish(&self, record: BinaryRecord) -> Result<()> {
        if record.payload.len() != PAYLOAD_LEN {
            return Err(ServerError::InvalidPayloadLength(record.payload.len()));
        }
        self.distribute(Arc::new(record));
        Ok(())
    }

    fn distribute(&self, record: Arc<BinaryRecord>) {
        if !self.0.known.read().unwrap().contains(&record.scnl) {
            debug!(channel = %record.scnl, "new channel");
            self.0.known.write().unwrap().insert(record.scnl.clone());
        }
        self.0.cache.insert(record.clone());
        self.0.registry.broadcast(&record);
    }

    /// Take a message number from the shared generator.
    pub fn next_message_number(&self) -> MessageNumber {
        self.0.numbers.next_number()
    }

    pub fn cache(&self) -> &MessageCache {
        &self.0.cache
    }
}

impl ChannelDirectory for MessageManager {
    fn channels(&self) -> HashSet<Scnl> {
        self.0.known.read().unwrap().clone()
    }
}

impl InfoResponder for MessageManager {
    fn info_record(&self, level: Option<&str>) -> Option<BinaryRecord> {
        match level {
            None => {}
            Some(level) if level.eq_ignore_ascii_case("ID") => {}
            Some(_) => return None,
        }
        Some(log_record(&self.0.id_xml, now_ms(), MessageNumber::new(0)))
    }
}

/// Escape XML special characters in attribute values.
fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// `INFO ID` document.
fn id_xml(software: &str, organization: &str, started: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<seedlink software=\"{}\" organization=\"{}\" started=\"{}\"/>",
        xml_escape(software),
        xml_escape(organization),
        xml_escape(started),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::DEFAULT_WAIT_TIME;

    fn manager() -> MessageManager {
        MessageManager::new(
            &ServerConfig::default(),
            MessageCache::new(Duration::ZERO, 0, DEFAULT_WAIT_TIME),
            ConnectionRegistry::new(),
            Arc::new(MessageNumberGenerator::new()),
            0,
        )
    }

    fn batch(len: usize) -> SampleBatch {
        SampleBatch {
            start_time: 1_705_314_645_000,
            sample_rate: 100.0,
            samples: vec![1; len],
        }
    }

    #[test]
    fn xml_escape_special_chars() {
        assert_eq!(xml_escape("a&b<c>d\"e'f"), "a&amp;b&lt;c&gt;d&quot;e&apos;f");
        assert_eq!(xml_escape("hello"), "hello");
    }

    #[test]
    fn info_id_document() {
        assert_eq!(
            id_xml("SeedLink v3.0", "A&B", "1970-01-01 00:00:00Z"),
            "<?xml version=\"1.0\"?>\n<seedlink software=\"SeedLink v3.0\" \
             organization=\"A&amp;B\" started=\"1970-01-01 00:00:00Z\"/>"
        );
    }

    #[test]
    fn info_levels() {
        let m = manager();
        let record = m.info_record(None).unwrap();
        assert_eq!(record.scnl.id(), "INFO.INF.SL.");
        assert!(
            record.payload[56..]
                .starts_with(b"<?xml version=\"1.0\"?>\n<seedlink software=\"SeedLink v3.0 (2009.260)\"")
        );
        assert!(m.info_record(Some("id")).is_some());
        assert!(m.info_record(Some("STREAMS")).is_none());
    }

    #[test]
    fn process_encodes_and_tracks_channels() {
        let m = manager();
        let scnl = Scnl::new("SLH", "BHZ", "XX", "00");
        assert!(m.channels().is_empty());
        assert_eq!(m.process(&scnl, &batch(300)), 3);
        assert!(m.channels().contains(&scnl));
        assert_eq!(m.next_message_number().value(), 3);
    }

    #[tokio::test]
    async fn published_records_reach_the_cache() {
        let m = manager();
        let writer = m.cache().start();
        let scnl = Scnl::new("SLH", "BHZ", "XX", "00");
        m.process(&scnl, &batch(114 * 4));
        m.cache().stop();
        writer.await.unwrap();

        let cached = m.cache().query(None, None, None);
        assert_eq!(
            cached.iter().map(|r| r.message_number.value()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    struct Fixed;

    impl RecordEncoder for Fixed {
        fn encode(
            &mut self,
            scnl: &Scnl,
            batch: &SampleBatch,
            numbers: &MessageNumberGenerator,
        ) -> Vec<BinaryRecord> {
            vec![BinaryRecord::new(
                scnl.clone(),
                batch.start_time,
                vec![0; 512],
                batch.samples.len() as u32,
                numbers.next_number(),
            )]
        }
    }

    #[test]
    fn publish_rejects_short_payload() {
        let m = manager();
        let scnl = Scnl::new("SLH", "BHZ", "XX", "");
        let short = BinaryRecord::new(scnl.clone(), 0, vec![0; 100], 0, MessageNumber::new(1));
        assert!(matches!(
            m.publish(short),
            Err(ServerError::InvalidPayloadLength(100))
        ));
        assert!(m.channels().is_empty());

        let full = BinaryRecord::new(scnl.clone(), 0, vec![0; 512], 0, MessageNumber::new(2));
        m.publish(full).unwrap();
        assert!(m.channels().contains(&scnl));
    }

    #[test]
    fn custom_encoder_per_channel() {
        let m = manager();
        let scnl = Scnl::new("SLH", "HHZ", "XX", "");
        m.set_encoder(scnl.clone(), Box::new(Fixed));
        assert_eq!(m.process(&scnl, &batch(1000)), 1);
    }
}

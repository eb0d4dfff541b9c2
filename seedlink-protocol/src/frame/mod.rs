pub mod v3;

use crate::error::Result;
use crate::sequence::MessageNumber;

/// Zero-copy frame that borrows its payload from the input buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawFrame<'a> {
    Data {
        sequence: MessageNumber,
        payload: &'a [u8],
    },
    Info {
        last: bool,
        payload: &'a [u8],
    },
}

impl<'a> RawFrame<'a> {
    /// Message number of a data frame; INFO frames carry none.
    pub fn sequence(&self) -> Option<MessageNumber> {
        match self {
            Self::Data { sequence, .. } => Some(*sequence),
            Self::Info { .. } => None,
        }
    }

    pub fn payload(&self) -> &'a [u8] {
        match self {
            Self::Data { payload, .. } | Self::Info { payload, .. } => payload,
        }
    }

    /// Decode the payload as a miniSEED record.
    pub fn decode(&self) -> Result<DataFrame> {
        let record = miniseed_rs::decode(self.payload())?;
        Ok(DataFrame {
            sequence: self.sequence(),
            record,
        })
    }
}

/// Owned frame with decoded miniSEED record.
#[derive(Debug)]
pub struct DataFrame {
    pub sequence: Option<MessageNumber>,
    pub record: miniseed_rs::MseedRecord,
}

#[cfg(test)]
mod tests {
    use miniseed_rs::{MseedRecord, Samples};

    use super::*;
    use crate::error::SeedlinkError;

    #[test]
    fn decode_data_frame() {
        let record = MseedRecord::new()
            .with_nslc("IU", "ANMO", "00", "BHZ")
            .with_sample_rate(20.0)
            .with_samples(Samples::Int(vec![1, -2, 3]));
        let payload = miniseed_rs::encode(&record).unwrap();
        let frame = v3::write(MessageNumber::new(0x2A), &payload).unwrap();

        let decoded = v3::parse(&frame).unwrap().decode().unwrap();
        assert_eq!(decoded.sequence, Some(MessageNumber::new(0x2A)));
        assert_eq!(decoded.record.station, "ANMO");
        assert_eq!(decoded.record.samples, Samples::Int(vec![1, -2, 3]));
    }

    #[test]
    fn decode_garbage_payload() {
        let payload = [0u8; v3::PAYLOAD_LEN];
        let frame = v3::write(MessageNumber::new(1), &payload).unwrap();
        let err = v3::parse(&frame).unwrap().decode().unwrap_err();
        assert!(matches!(err, SeedlinkError::Miniseed(_)));
    }
}

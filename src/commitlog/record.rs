//! Log Record Type

use serde::{Deserialize, Serialize};

/// A single log record.
///
/// The offset is assigned at append time and is the record's identity.
/// `term` and `kind` are populated only when the log serves as the
/// consensus replication log; user records leave them zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record payload
    pub value: Vec<u8>,
    /// Position in the log, assigned on append
    pub offset: u64,
    /// Consensus term (replication log only)
    pub term: u64,
    /// Consensus entry kind (replication log only)
    pub kind: u32,
}

impl Record {
    /// Create a user record carrying only a payload
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    /// Serialize the record to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a record from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_deserialize() {
        let record = Record {
            value: b"hello world".to_vec(),
            offset: 42,
            term: 3,
            kind: 1,
        };

        let bytes = record.serialize().unwrap();
        let restored = Record::deserialize(&bytes).unwrap();
        assert_eq!(restored, record);
    }
}

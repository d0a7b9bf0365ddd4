//! Subject layout for partitioned topics
//!
//! Events travel on `"<root>.<partition>"` subjects captured by one
//! JetStream stream; freeze/unfreeze notifications travel on a separate
//! `"<root>-control"` core subject so they never enter the event stream.

/// A partitioned topic root.
#[derive(Debug, Clone)]
pub struct Topic {
    root: String,
}

impl Topic {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// Subject of one partition, e.g. `"balances.3"`.
    pub fn partition(&self, partition: u32) -> String {
        format!("{}.{}", self.root, partition)
    }

    /// Wildcard capturing every partition subject.
    pub fn wildcard(&self) -> String {
        format!("{}.>", self.root)
    }

    /// Control subject for freeze/unfreeze notifications.
    pub fn control(&self) -> String {
        format!("{}-control", self.root)
    }
}

/// Encode a bus cursor (JetStream stream sequence) as a resume token.
pub(crate) fn encode_sequence(sequence: u64) -> Vec<u8> {
    sequence.to_be_bytes().to_vec()
}

/// Decode a resume token back to a stream sequence; empty means "from the
/// beginning".
pub(crate) fn decode_sequence(token: &[u8]) -> Result<u64, String> {
    if token.is_empty() {
        return Ok(0);
    }
    let bytes: [u8; 8] = token
        .try_into()
        .map_err(|_| format!("invalid resume token of {} bytes", token.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

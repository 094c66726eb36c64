//! Stream tags: positional metadata riding alongside sample streams.

#![forbid(unsafe_code)]

/// Typed payload carried by a [`Tag`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// Marker with no payload.
    None,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Text.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// An (offset, key, value) triple attached to a stream position.
///
/// `offset` is absolute in the counting of the port that produced the
/// tag. Tags are immutable once published; moving one across a rate change
/// creates a new tag via [`Tag::with_offset`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Absolute item index the tag is attached to.
    pub offset: u64,
    /// Tag key.
    pub key: String,
    /// Tag payload.
    pub value: TagValue,
    /// Name of the block that originally emitted the tag, if recorded.
    pub srcid: Option<String>,
}

impl Tag {
    /// Create a tag without a source id.
    pub fn new(offset: u64, key: impl Into<String>, value: TagValue) -> Self {
        Self {
            offset,
            key: key.into(),
            value,
            srcid: None,
        }
    }

    /// Attach the emitting block's name.
    pub fn with_srcid(mut self, srcid: impl Into<String>) -> Self {
        self.srcid = Some(srcid.into());
        self
    }

    /// Copy of this tag moved to `offset`; key, value and source id are kept.
    pub fn with_offset(&self, offset: u64) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_offset_keeps_payload() {
        let tag = Tag::new(10, "rx_time", TagValue::Int(7)).with_srcid("usrp");
        let moved = tag.with_offset(25);
        assert_eq!(moved.offset, 25);
        assert_eq!(moved.key, "rx_time");
        assert_eq!(moved.value, TagValue::Int(7));
        assert_eq!(moved.srcid.as_deref(), Some("usrp"));
        assert_eq!(tag.offset, 10);
    }
}

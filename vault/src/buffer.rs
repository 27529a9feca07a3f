//! In-memory plaintext of one unsealed dataset
//!
//! [`UnsealedBuffer`] is the only type that holds decrypted dataset bytes.
//! It cannot be cloned, serialized or written anywhere, and its backing
//! allocation is overwritten with zeros when it is dropped, whichever path
//! (success, error, panic unwind or cancellation) drops it.

use std::fmt;

use zeroize::Zeroizing;

pub struct UnsealedBuffer {
    dataset_id: String,
    bytes: Zeroizing<Vec<u8>>,
}

impl UnsealedBuffer {
    pub(crate) fn new(dataset_id: impl Into<String>, bytes: Zeroizing<Vec<u8>>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            bytes,
        }
    }

    /// Dataset this plaintext belongs to
    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Borrow the plaintext; borrows cannot outlive the buffer
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for UnsealedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealedBuffer")
            .field("dataset_id", &self.dataset_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_contents() {
        let buffer = UnsealedBuffer::new("enero", Zeroizing::new(b"sku;qty\nA1;10\n".to_vec()));
        let rendered = format!("{:?}", buffer);
        assert!(rendered.contains("enero"));
        assert!(!rendered.contains("A1"));
        assert_eq!(buffer.len(), 14);
        assert!(!buffer.is_empty());
    }
}

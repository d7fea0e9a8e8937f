//! Zeroizing plaintext returned by [`SecureChannel::recv`](crate::SecureChannel::recv).

use zeroize::Zeroizing;

/// Received plaintext that is wiped on drop.
///
/// Not `Clone`: copying plaintext out is an explicit `to_vec` or
/// `into_string` at the caller.
#[derive(Debug)]
pub struct Message(Zeroizing<Vec<u8>>);

impl Message {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self(Zeroizing::new(data))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Bytes as UTF-8.
    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.0)
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the message is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy out as a `String`; the message buffer is wiped when `self` drops.
    pub fn into_string(self) -> Result<String, std::str::Utf8Error> {
        self.as_str().map(str::to_owned)
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

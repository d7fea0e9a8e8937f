//! Dynamic buffer for variable-length attribute values.
//!
//! Values up to [`DYNBUF_EMBEDDED`] bytes live in inline storage; longer
//! ones go to a heap allocation. Either way the bytes are wiped when the
//! buffer is released.

use zeroize::{Zeroize, Zeroizing};

use crate::attribute::Attribute;
use crate::error::{Error, Result, Status};
use crate::fault::{FaultController, FaultKind};

/// Inline capacity.
pub const DYNBUF_EMBEDDED: usize = 1024;

/// An object whose variable-length attributes can be read in two calls:
/// once with no output to learn the length, once to copy the value.
pub trait AttributeSource {
    /// Copy `attr` into `out`, or report its length when `out` is `None`.
    ///
    /// `out` is always at least as long as the length reported by the
    /// probe call.
    fn read_attribute(&self, attr: Attribute, out: Option<&mut [u8]>) -> Result<usize>;

    /// Fault controller consulted for heap allocations.
    fn fault_controller(&self) -> Option<&FaultController> {
        None
    }
}

enum Storage {
    Embedded([u8; DYNBUF_EMBEDDED]),
    Heap(Zeroizing<Vec<u8>>),
}

/// A value read from an [`AttributeSource`].
pub struct DynBuf {
    storage: Storage,
    len: usize,
}

impl DynBuf {
    /// Read `attr` from `source`.
    pub fn acquire<S: AttributeSource + ?Sized>(source: &S, attr: Attribute) -> Result<Self> {
        let len = source.read_attribute(attr, None)?;
        if len <= DYNBUF_EMBEDDED {
            let mut buf = Self {
                storage: Storage::Embedded([0u8; DYNBUF_EMBEDDED]),
                len: 0,
            };
            if let Storage::Embedded(bytes) = &mut buf.storage {
                buf.len = source.read_attribute(attr, Some(&mut bytes[..len]))?;
            }
            return Ok(buf);
        }

        if source
            .fault_controller()
            .map_or(false, |faults| faults.trip(FaultKind::AllocFailure))
        {
            return Err(Error::with_detail(Status::Memory, "attribute buffer allocation failed"));
        }
        let mut heap = Vec::new();
        heap.try_reserve_exact(len)
            .map_err(|_| Error::with_detail(Status::Memory, "attribute buffer allocation failed"))?;
        heap.resize(len, 0);
        let mut heap = Zeroizing::new(heap);
        let copied = source.read_attribute(attr, Some(&mut heap[..]))?;
        Ok(Self {
            storage: Storage::Heap(heap),
            len: copied.min(len),
        })
    }

    /// The value.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Embedded(bytes) => &bytes[..self.len],
            Storage::Heap(bytes) => &bytes[..self.len],
        }
    }

    /// Value length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the value spilled to the heap.
    pub fn is_heap(&self) -> bool {
        matches!(self.storage, Storage::Heap(_))
    }

    /// Release the buffer, wiping its contents.
    pub fn release(self) {}

    fn wipe(&mut self) {
        match &mut self.storage {
            Storage::Embedded(bytes) => bytes.zeroize(),
            Storage::Heap(bytes) => bytes.zeroize(),
        }
        self.len = 0;
    }
}

impl Drop for DynBuf {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for DynBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynBuf")
            .field("len", &self.len)
            .field("heap", &self.is_heap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        value: Vec<u8>,
        faults: FaultController,
    }

    impl AttributeSource for Fixed {
        fn read_attribute(&self, attr: Attribute, out: Option<&mut [u8]>) -> Result<usize> {
            if attr != Attribute::Username {
                return Err(Error::new(Status::NotFound));
            }
            if let Some(out) = out {
                out[..self.value.len()].copy_from_slice(&self.value);
            }
            Ok(self.value.len())
        }

        fn fault_controller(&self) -> Option<&FaultController> {
            Some(&self.faults)
        }
    }

    fn source(len: usize) -> Fixed {
        Fixed {
            value: (0..len).map(|i| (i % 251) as u8 + 1).collect(),
            faults: FaultController::new(),
        }
    }

    #[test]
    fn test_small_value_stays_inline() {
        let src = source(DYNBUF_EMBEDDED);
        let buf = DynBuf::acquire(&src, Attribute::Username).unwrap();
        assert!(!buf.is_heap());
        assert_eq!(buf.as_bytes(), &src.value[..]);
    }

    #[test]
    fn test_large_value_spills_to_heap() {
        let src = source(DYNBUF_EMBEDDED + 1);
        let buf = DynBuf::acquire(&src, Attribute::Username).unwrap();
        assert!(buf.is_heap());
        assert_eq!(buf.len(), DYNBUF_EMBEDDED + 1);
        assert_eq!(buf.as_bytes(), &src.value[..]);
    }

    #[test]
    fn test_wipe_clears_both_storages() {
        for len in [16, DYNBUF_EMBEDDED * 2] {
            let src = source(len);
            let mut buf = DynBuf::acquire(&src, Attribute::Username).unwrap();
            buf.wipe();
            assert!(buf.is_empty());
            match &buf.storage {
                Storage::Embedded(bytes) => assert!(bytes.iter().all(|&b| b == 0)),
                Storage::Heap(bytes) => assert!(bytes.is_empty()),
            }
        }
    }

    #[test]
    fn test_alloc_fault_is_memory_error() {
        let src = source(DYNBUF_EMBEDDED * 4);
        src.faults.arm(FaultKind::AllocFailure);
        let err = DynBuf::acquire(&src, Attribute::Username).unwrap_err();
        assert_eq!(err.status(), Status::Memory);
        assert!(DynBuf::acquire(&src, Attribute::Username).is_ok());
    }

    #[test]
    fn test_missing_attribute_propagates() {
        let src = source(4);
        let err = DynBuf::acquire(&src, Attribute::Password).unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }
}

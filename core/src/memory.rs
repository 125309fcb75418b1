use std::sync::{Arc, RwLock};

use crate::error::DeviceError;

// MEMORY ACCESS ERROR
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryAccessError {
    #[error("window ({offset} + {length}) exceeds memory region of {size} bytes")]
    OutOfRange { offset: u32, length: u32, size: u32 },
    #[error("memory region is device-opaque and cannot be accessed by the host")]
    OpaqueRegion,
}

// DEVICE BUFFER
// ================================================================================================

/// A device-owned buffer whose contents the host cannot address directly.
///
/// The partial-fallback path moves data through `read_to_vec` / `write_all`
/// when a step that consumed or produced device-opaque memory is re-run on
/// the software back-end.
pub trait DeviceBuffer: Send + Sync {
    fn size(&self) -> u32;
    fn read_to_vec(&self) -> Result<Vec<u8>, DeviceError>;
    fn write_all(&self, data: &[u8]) -> Result<(), DeviceError>;
}

// MEMORY
// ================================================================================================

/// A shared memory region used for operand storage.
///
/// Host regions are readable and writable through explicit windows; opaque
/// regions wrap a [`DeviceBuffer`] and reject host access. Regions are always
/// shared via `Arc` and may back constants, execution arguments, or the
/// per-execution temporaries arena.
pub struct Memory {
    inner: Repr,
}

enum Repr {
    Host(RwLock<Vec<u8>>),
    Opaque(Arc<dyn DeviceBuffer>),
}

impl Memory {
    /// Allocates a zero-filled host-visible region.
    pub fn allocate(size: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Repr::Host(RwLock::new(vec![0; size as usize])),
        })
    }

    /// Wraps an existing byte buffer as a host-visible region.
    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { inner: Repr::Host(RwLock::new(bytes)) })
    }

    /// Adopts a device-owned buffer as an opaque region.
    pub fn opaque(buffer: Arc<dyn DeviceBuffer>) -> Arc<Self> {
        Arc::new(Self { inner: Repr::Opaque(buffer) })
    }

    pub fn size(&self) -> u32 {
        match &self.inner {
            Repr::Host(bytes) => bytes.read().expect("memory lock poisoned").len() as u32,
            Repr::Opaque(buffer) => buffer.size(),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.inner, Repr::Opaque(_))
    }

    /// Returns the underlying device buffer for opaque regions.
    pub fn device_buffer(&self) -> Option<&Arc<dyn DeviceBuffer>> {
        match &self.inner {
            Repr::Host(_) => None,
            Repr::Opaque(buffer) => Some(buffer),
        }
    }

    /// Copies `length` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: u32, length: u32) -> Result<Vec<u8>, MemoryAccessError> {
        match &self.inner {
            Repr::Host(bytes) => {
                let bytes = bytes.read().expect("memory lock poisoned");
                let range = self.window(bytes.len(), offset, length)?;
                Ok(bytes[range].to_vec())
            },
            Repr::Opaque(_) => Err(MemoryAccessError::OpaqueRegion),
        }
    }

    /// Writes `data` into the region starting at `offset`.
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<(), MemoryAccessError> {
        match &self.inner {
            Repr::Host(bytes) => {
                let mut bytes = bytes.write().expect("memory lock poisoned");
                let range = self.window(bytes.len(), offset, data.len() as u32)?;
                bytes[range].copy_from_slice(data);
                Ok(())
            },
            Repr::Opaque(_) => Err(MemoryAccessError::OpaqueRegion),
        }
    }

    /// Runs `f` over an immutable view of the whole region.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, MemoryAccessError> {
        match &self.inner {
            Repr::Host(bytes) => Ok(f(&bytes.read().expect("memory lock poisoned"))),
            Repr::Opaque(_) => Err(MemoryAccessError::OpaqueRegion),
        }
    }

    fn window(
        &self,
        size: usize,
        offset: u32,
        length: u32,
    ) -> Result<std::ops::Range<usize>, MemoryAccessError> {
        let end = offset as usize + length as usize;
        if end > size {
            return Err(MemoryAccessError::OutOfRange { offset, length, size: size as u32 });
        }
        Ok(offset as usize..end)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Repr::Host(_) => write!(f, "Memory::Host({} bytes)", self.size()),
            Repr::Opaque(_) => write!(f, "Memory::Opaque({} bytes)", self.size()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let memory = Memory::allocate(8);
        memory.write(2, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read(2, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(memory.read(0, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn out_of_range_window_is_rejected() {
        let memory = Memory::allocate(4);
        assert_eq!(
            memory.read(2, 4),
            Err(MemoryAccessError::OutOfRange { offset: 2, length: 4, size: 4 })
        );
    }
}

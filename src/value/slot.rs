use super::object::ObjectHandle;
use std::{ffi::CString, fmt, mem::size_of};

/// Something a slot points at that must stay alive while the slot is in use.
pub enum Anchor {
    CString(CString),
    Object(ObjectHandle),
    Buffer(Vec<u64>),
}

/// The bytes of one call argument or return value, 8-byte aligned, plus
/// whatever host-owned memory those bytes refer to.
pub struct ForeignSlot {
    storage: Vec<u64>,
    size: usize,
    anchors: Vec<Anchor>,
}

impl ForeignSlot {
    pub fn zeroed(size: usize) -> Self {
        Self {
            storage: vec![0u64; size.div_ceil(8).max(1)],
            size,
            anchors: vec![],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut slot = Self::zeroed(bytes.len());
        slot.bytes_mut().copy_from_slice(bytes);
        slot
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Grow the backing storage to at least `min` bytes without changing the
    /// logical size. libffi writes whole registers for narrow returns.
    pub fn reserve_capacity(&mut self, min: usize) {
        let words = min.div_ceil(8);
        if self.storage.len() < words {
            self.storage.resize(words, 0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len() * size_of::<u64>()
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `storage` holds at least `size` initialised bytes.
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr() as *const u8, self.size) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and we hold the only borrow of `storage`.
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_mut_ptr() as *mut u8, self.size) }
    }

    /// Full backing storage, including bytes past the logical size.
    pub fn raw_bytes(&self) -> &[u8] {
        // SAFETY: every word of `storage` is initialised.
        unsafe {
            std::slice::from_raw_parts(self.storage.as_ptr() as *const u8, self.capacity())
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr() as *mut u8
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_ptr() as *const u8
    }

    pub fn anchor(&mut self, anchor: Anchor) {
        self.anchors.push(anchor);
    }

    pub fn write_pointer(&mut self, address: usize) {
        write_pointer(self.bytes_mut(), address);
    }

    pub fn read_pointer(&self) -> usize {
        read_pointer(self.bytes())
    }
}

pub fn write_pointer(dest: &mut [u8], address: usize) {
    dest[..size_of::<usize>()].copy_from_slice(&address.to_ne_bytes());
}

pub fn read_pointer(src: &[u8]) -> usize {
    let mut buf = [0u8; size_of::<usize>()];
    buf.copy_from_slice(&src[..size_of::<usize>()]);
    usize::from_ne_bytes(buf)
}

impl fmt::Debug for ForeignSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignSlot[")?;
        for (i, b) in self.bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        write!(f, "]")?;
        if !self.anchors.is_empty() {
            write!(f, " +{} anchors", self.anchors.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_size() {
        let slot = ForeignSlot::zeroed(3);
        assert_eq!(slot.size(), 3);
        assert_eq!(slot.capacity(), 8);
        assert_eq!(slot.as_ptr() as usize % 8, 0);
        assert_eq!(ForeignSlot::zeroed(0).capacity(), 8);
    }

    #[test]
    fn test_pointer_roundtrip() {
        let mut slot = ForeignSlot::zeroed(size_of::<usize>());
        slot.write_pointer(0xdead_beef);
        assert_eq!(slot.read_pointer(), 0xdead_beef);
    }

    #[test]
    fn test_reserve_keeps_contents() {
        let mut slot = ForeignSlot::from_bytes(&[1, 2]);
        slot.reserve_capacity(16);
        assert_eq!(slot.bytes(), &[1, 2]);
        assert_eq!(slot.capacity(), 16);
    }

    #[test]
    fn test_debug_hex() {
        let slot = ForeignSlot::from_bytes(&[0xab, 0x01]);
        assert_eq!(format!("{slot:?}"), "ForeignSlot[ab 01]");
    }
}

use crate::error::{BridgeError, Result};
use std::ffi::{c_char, CStr, CString};

/// Host text as a NUL-terminated UTF-8 buffer. Interior NULs cannot be
/// represented and are rejected.
pub fn to_c_string(text: &str) -> Result<CString> {
    CString::new(text).map_err(|e| {
        BridgeError::Encoding(format!(
            "interior NUL at byte {} of {:?}",
            e.nul_position(),
            text
        ))
    })
}

pub fn bytes_to_c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| {
        BridgeError::Encoding(format!("interior NUL at byte {} of byte string", e.nul_position()))
    })
}

/// Read a foreign C string as UTF-8. Invalid sequences are an error, never
/// replaced.
///
/// # Safety
/// `ptr` must be non-null and point at a NUL-terminated buffer.
pub unsafe fn from_c_string(ptr: *const c_char) -> Result<String> {
    let s = CStr::from_ptr(ptr);
    s.to_str().map(str::to_owned).map_err(|e| {
        BridgeError::Encoding(format!(
            "invalid UTF-8 after {} valid bytes",
            e.valid_up_to()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let c = to_c_string("héllo").unwrap();
        assert_eq!(unsafe { from_c_string(c.as_ptr()) }.unwrap(), "héllo");
    }

    #[test]
    fn test_interior_nul() {
        assert!(matches!(to_c_string("a\0b"), Err(BridgeError::Encoding(_))));
        assert!(matches!(bytes_to_c_string(b"\0"), Err(BridgeError::Encoding(_))));
    }

    #[test]
    fn test_invalid_utf8_is_error() {
        let raw = CString::new(vec![0x66, 0xff, 0x66]).unwrap();
        assert!(matches!(
            unsafe { from_c_string(raw.as_ptr()) },
            Err(BridgeError::Encoding(_))
        ));
    }
}

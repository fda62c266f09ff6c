// ============================================================================
// FixedString: Zero-Allocation String Storage
// ============================================================================
//
// Flag values are resolved before the allocator shim is live, so every string
// the resolver keeps is stored inline.

use serde::{Serialize, Serializer};

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FixedString<const N: usize> {
    pub(crate) data: [u8; N],
    pub(crate) len: usize,
}

impl<const N: usize> FixedString<N> {
    pub const CAPACITY: usize = N;

    pub const fn new() -> Self {
        Self {
            data: [0u8; N],
            len: 0,
        }
    }

    /// Build from a string, truncating on a char boundary if it does not fit.
    pub fn with(s: &str) -> Self {
        let mut out = Self::new();
        out.set(s);
        out
    }

    /// Store `s`, truncating to capacity on a char boundary.
    pub fn set(&mut self, s: &str) {
        let mut to_copy = std::cmp::min(s.len(), N);
        while !s.is_char_boundary(to_copy) {
            to_copy -= 1;
        }
        self.data[..to_copy].copy_from_slice(&s.as_bytes()[..to_copy]);
        self.len = to_copy;
    }

    /// Store `s` only if it fits entirely. Returns false and leaves the
    /// current contents untouched otherwise.
    pub fn try_set(&mut self, s: &str) -> bool {
        if s.len() > N {
            return false;
        }
        self.data[..s.len()].copy_from_slice(s.as_bytes());
        self.len = s.len();
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.data[..self.len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl<const N: usize> std::fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> std::fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<const N: usize> std::ops::Deref for FixedString<N> {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl<const N: usize> AsRef<str> for FixedString<N> {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PartialEq for FixedString<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<const N: usize> Eq for FixedString<N> {}

impl<const N: usize> PartialEq<str> for FixedString<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<const N: usize> PartialEq<&str> for FixedString<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<const N: usize> Serialize for FixedString<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_read_back() {
        let mut s = FixedString::<16>::new();
        assert!(s.is_empty());
        s.set("stderr");
        assert_eq!(s.as_str(), "stderr");
        assert_eq!(s.len(), 6);
    }

    #[test]
    fn test_set_truncates_on_char_boundary() {
        let mut s = FixedString::<4>::new();
        s.set("abé"); // 'é' is two bytes, fits exactly
        assert_eq!(s.as_str(), "abé");
        s.set("abcé"); // 'é' would straddle the boundary
        assert_eq!(s.as_str(), "abc");
    }

    #[test]
    fn test_try_set_rejects_overflow() {
        let mut s = FixedString::<4>::with("ok");
        assert!(!s.try_set("too long"));
        assert_eq!(s.as_str(), "ok");
        assert!(s.try_set("four"));
        assert_eq!(s, "four");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        #[derive(Serialize)]
        struct Wrapper {
            path: FixedString<32>,
        }
        let out = toml::to_string(&Wrapper {
            path: FixedString::with("/tmp/lsan"),
        })
        .unwrap();
        assert_eq!(out.trim(), "path = \"/tmp/lsan\"");
    }
}

//! Zero-allocation reporting macros.
//!
//! Everything here formats into a stack buffer and leaves through a raw
//! `write(2)`, so it is usable from the load-time constructor and from
//! signal handlers.

/// Report a line to the resolved log destination, prefixed with `==pid==`.
///
/// # Usage:
/// ```ignore
/// rt_report!("ERROR: {}: re-entrant initialization", TOOL_NAME);
/// ```
#[macro_export]
macro_rules! rt_report {
    ($($arg:tt)*) => {{
        use std::fmt::Write;
        let mut buf = [0u8; 1024];
        let mut writer = $crate::macros::StackWriter::new(&mut buf);
        let pid = unsafe { libc::getpid() };
        let _ = write!(writer, "=={}==", pid);
        let _ = write!(writer, $($arg)*);
        let _ = writeln!(writer);
        $crate::report::write_report(writer.as_str());
    }};
}

/// `rt_report!` gated on the resolved `verbosity` flag.
#[macro_export]
macro_rules! rt_vreport {
    ($level:expr, $($arg:tt)*) => {
        if $crate::report::verbosity() >= $level {
            $crate::rt_report!($($arg)*);
        }
    };
}

/// Formats into a fixed buffer, silently truncating on overflow.
pub struct StackWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> StackWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn as_str(&self) -> &str {
        match std::str::from_utf8(&self.buf[..self.pos]) {
            Ok(s) => s,
            // Truncation can split a multi-byte char; keep the valid prefix.
            Err(e) => std::str::from_utf8(&self.buf[..e.valid_up_to()]).unwrap_or(""),
        }
    }

    pub fn is_full(&self) -> bool {
        self.pos == self.buf.len()
    }
}

impl<'a> std::fmt::Write for StackWriter<'a> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buf.len() - self.pos;
        let to_copy = std::cmp::min(bytes.len(), remaining);
        self.buf[self.pos..self.pos + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.pos += to_copy;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_stack_writer_formats() {
        let mut buf = [0u8; 64];
        let mut w = StackWriter::new(&mut buf);
        write!(w, "pc 0x{:x} depth {}", 0x1234usize, 3).unwrap();
        assert_eq!(w.as_str(), "pc 0x1234 depth 3");
        assert!(!w.is_full());
    }

    #[test]
    fn test_stack_writer_truncates() {
        let mut buf = [0u8; 8];
        let mut w = StackWriter::new(&mut buf);
        write!(w, "0123456789").unwrap();
        assert_eq!(w.as_str(), "01234567");
        assert!(w.is_full());
    }

    #[test]
    fn test_stack_writer_drops_split_char() {
        let mut buf = [0u8; 4];
        let mut w = StackWriter::new(&mut buf);
        write!(w, "abcé").unwrap();
        assert_eq!(w.as_str(), "abc");
    }
}

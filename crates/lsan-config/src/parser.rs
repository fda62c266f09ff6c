//! Zero-allocation option-string parser.
//!
//! Grammar: `name=value` tokens separated by any of `:`, `,`, space, tab,
//! CR or LF. A value may be wrapped in `'` or `"`, in which case it may
//! contain separators. Parsing works on borrowed slices and writes straight
//! into a `Flags` value, so it is usable before the allocator shim is up.

use crate::error::{ParseError, Token};
use crate::fixed::FixedString;
use crate::flags::Flags;

/// Most unknown names remembered per resolution.
pub const MAX_UNKNOWN_FLAGS: usize = 20;

#[inline]
fn is_separator(b: u8) -> bool {
    matches!(b, b' ' | b',' | b':' | b'\n' | b'\t' | b'\r')
}

/// Names seen in option strings that no flag group recognizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownFlags {
    names: [FixedString<64>; MAX_UNKNOWN_FLAGS],
    count: usize,
    dropped: usize,
}

impl UnknownFlags {
    pub fn push(&mut self, name: &str) {
        if self.count < MAX_UNKNOWN_FLAGS {
            self.names[self.count].set(name);
            self.count += 1;
        } else {
            self.dropped += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names[..self.count].iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Unknown names that did not fit in the table.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Applies option strings to a flag set.
pub struct FlagParser<'a> {
    flags: &'a mut Flags,
    unknown: &'a mut UnknownFlags,
}

impl<'a> FlagParser<'a> {
    pub fn new(flags: &'a mut Flags, unknown: &'a mut UnknownFlags) -> Self {
        Self { flags, unknown }
    }

    /// Parse one source. Tokens before the first malformed token stay
    /// applied; the malformed token and everything after it in this source
    /// are dropped. Returns the number of recognized flags applied.
    pub fn parse_str(&mut self, source: &str) -> Result<usize, ParseError> {
        let bytes = source.as_bytes();
        let mut pos = 0;
        let mut applied = 0;

        loop {
            while pos < bytes.len() && is_separator(bytes[pos]) {
                pos += 1;
            }
            if pos >= bytes.len() {
                return Ok(applied);
            }

            let name_start = pos;
            while pos < bytes.len() && bytes[pos] != b'=' && !is_separator(bytes[pos]) {
                pos += 1;
            }
            if pos >= bytes.len() || bytes[pos] != b'=' {
                return Err(ParseError::MissingEquals {
                    token: Token::with(&source[name_start..pos]),
                });
            }
            if pos == name_start {
                return Err(ParseError::EmptyName);
            }
            let name = &source[name_start..pos];
            pos += 1;

            let value = if pos < bytes.len() && (bytes[pos] == b'"' || bytes[pos] == b'\'') {
                let quote = bytes[pos];
                let value_start = pos + 1;
                let Some(len) = bytes[value_start..].iter().position(|&b| b == quote) else {
                    return Err(ParseError::UnterminatedQuote {
                        name: Token::with(name),
                    });
                };
                pos = value_start + len + 1;
                &source[value_start..value_start + len]
            } else {
                let value_start = pos;
                while pos < bytes.len() && !is_separator(bytes[pos]) {
                    pos += 1;
                }
                &source[value_start..pos]
            };

            match self.flags.set(name, value) {
                Some(result) => {
                    result?;
                    applied += 1;
                }
                None => self.unknown.push(name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(flags: &mut Flags, unknown: &mut UnknownFlags, s: &str) -> Result<usize, ParseError> {
        FlagParser::new(flags, unknown).parse_str(s)
    }

    #[test]
    fn test_colon_separated_pairs_override_defaults() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        assert_eq!(flags.common.verbosity, 0);
        assert!(flags.common.detect_leaks);

        let n = parse(&mut flags, &mut unknown, "verbosity=1:detect_leaks=0").unwrap();
        assert_eq!(n, 2);
        assert_eq!(flags.common.verbosity, 1);
        assert!(!flags.common.detect_leaks);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_mixed_separators() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        parse(
            &mut flags,
            &mut unknown,
            " exitcode=5,max_leaks=3\tcoverage=1\nverbosity=2\r",
        )
        .unwrap();
        assert_eq!(flags.common.exitcode, 5);
        assert_eq!(flags.lsan.max_leaks, 3);
        assert!(flags.common.coverage);
        assert_eq!(flags.common.verbosity, 2);
    }

    #[test]
    fn test_empty_and_separator_only_sources() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        assert_eq!(parse(&mut flags, &mut unknown, ""), Ok(0));
        assert_eq!(parse(&mut flags, &mut unknown, " :: ,, "), Ok(0));
        assert_eq!(flags, Flags::default());
    }

    #[test]
    fn test_quoted_value_keeps_separators() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        parse(
            &mut flags,
            &mut unknown,
            "log_path='/tmp/a b:c':suppressions=\"x,y\"",
        )
        .unwrap();
        assert_eq!(flags.common.log_path, "/tmp/a b:c");
        assert_eq!(flags.lsan.suppressions, "x,y");
    }

    #[test]
    fn test_empty_value_is_allowed_for_strings() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        flags.common.external_symbolizer_path.set("/bin/sym");
        parse(&mut flags, &mut unknown, "external_symbolizer_path=").unwrap();
        assert!(flags.common.external_symbolizer_path.is_empty());
    }

    #[test]
    fn test_unknown_names_are_collected_not_fatal() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        let n = parse(&mut flags, &mut unknown, "bogus=1:verbosity=3:other=x").unwrap();
        assert_eq!(n, 1);
        assert_eq!(flags.common.verbosity, 3);
        assert_eq!(unknown.iter().collect::<Vec<_>>(), vec!["bogus", "other"]);
    }

    #[test]
    fn test_unknown_table_overflow_is_counted() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        let mut s = String::new();
        for i in 0..(MAX_UNKNOWN_FLAGS + 3) {
            s.push_str(&format!("unknown_{}=1:", i));
        }
        parse(&mut flags, &mut unknown, &s).unwrap();
        assert_eq!(unknown.len(), MAX_UNKNOWN_FLAGS);
        assert_eq!(unknown.dropped(), 3);
    }

    #[test]
    fn test_missing_equals_stops_the_source() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        let err = parse(&mut flags, &mut unknown, "verbosity=1:oops:exitcode=9").unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingEquals {
                token: Token::with("oops")
            }
        );
        // Applied up to the error, nothing after it.
        assert_eq!(flags.common.verbosity, 1);
        assert_eq!(flags.common.exitcode, 1);
    }

    #[test]
    fn test_trailing_name_without_value() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        let err = parse(&mut flags, &mut unknown, "verbosity").unwrap_err();
        assert!(matches!(err, ParseError::MissingEquals { .. }));
        assert_eq!(flags.common.verbosity, 0);
    }

    #[test]
    fn test_empty_name() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        assert_eq!(
            parse(&mut flags, &mut unknown, "=1"),
            Err(ParseError::EmptyName)
        );
    }

    #[test]
    fn test_unterminated_quote() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        let err = parse(&mut flags, &mut unknown, "coverage=1:log_path='/tmp/x").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedQuote { .. }));
        assert!(flags.common.coverage);
        assert_eq!(flags.common.log_path, "stderr");
    }

    #[test]
    fn test_invalid_value_stops_the_source() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        let err = parse(&mut flags, &mut unknown, "tries=2:detect_leaks=maybe:tries=5").unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { .. }));
        assert_eq!(flags.lsan.tries, 2);
        assert!(flags.common.detect_leaks);
    }

    #[test]
    fn test_repeated_key_last_writer_wins() {
        let mut flags = Flags::default();
        let mut unknown = UnknownFlags::default();
        parse(&mut flags, &mut unknown, "verbosity=1:verbosity=4").unwrap();
        assert_eq!(flags.common.verbosity, 4);
    }
}

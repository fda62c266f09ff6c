use crate::fixed::FixedString;

/// Inline copy of the offending option text.
pub type Token = FixedString<64>;

/// A malformed token inside an option string.
///
/// Never fatal: the resolver records it and stops reading the source it came
/// from. Every variant is `Copy` so it can be kept without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected '=' after option name in '{token}'")]
    MissingEquals { token: Token },

    #[error("empty option name before '='")]
    EmptyName,

    #[error("unterminated quoted value for option '{name}'")]
    UnterminatedQuote { name: Token },

    #[error("invalid value '{value}' for {expected} option '{name}'")]
    InvalidValue {
        name: Token,
        value: Token,
        expected: &'static str,
    },

    #[error("value for option '{name}' exceeds {capacity} bytes")]
    ValueTooLong { name: Token, capacity: usize },
}

/// Errors raised by tooling that renders or persists flag snapshots.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialize error: {0}")]
    Toml(#[from] toml::ser::Error),
}

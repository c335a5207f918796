//! Correlation references.
//!
//! A reference ties one downstream request to its upstream response. Values
//! live in `1..=Reference::MAX`: 31 bits, but neither zero nor `2^31 - 1`
//! is ever issued.

use std::fmt;

/// A 31-bit, non-zero correlation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference(u32);

impl Reference {
    /// Largest issued value. The counter wraps from here back to 1.
    pub const MAX: u32 = 0x7FFF_FFFE;

    /// First value issued after start-up or wraparound.
    pub const FIRST: Self = Self(1);

    /// Build a reference from a raw value, rejecting 0 and anything above
    /// [`Reference::MAX`].
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        (1..=Self::MAX).contains(&value).then_some(Self(value))
    }

    /// The raw value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// The value after this one, wrapping from `MAX` to 1.
    #[must_use]
    pub fn next(self) -> Self {
        if self.0 >= Self::MAX {
            Self::FIRST
        } else {
            Self(self.0 + 1)
        }
    }

    /// Parse a decimal topic token. Only ASCII digits are accepted.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        token.parse::<u32>().ok().and_then(Self::new)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

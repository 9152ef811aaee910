//! Dimension keys addressing one logical counter within a counter name.

use std::fmt;

/// Separator used when a dimension key has to be flattened into a string.
pub const DIMENSION_SEPARATOR: &str = ":";

/// An ordered sequence of opaque tokens, e.g. `["shoes", "oid-001"]`.
///
/// Order matters and the empty sequence is the default key. Tokens are
/// never parsed; equality is structural so the key can be used directly
/// in maps without joining.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dimensions(Vec<String>);

impl Dimensions {
    /// Create a dimension key from a token list.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// The default ("no dimension") key.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// A new key with one more trailing token.
    pub fn child(&self, token: impl Into<String>) -> Self {
        let mut tokens = self.0.clone();
        tokens.push(token.into());
        Self(tokens)
    }

    /// Join the tokens with [`DIMENSION_SEPARATOR`].
    pub fn to_string_key(&self) -> String {
        self.0.join(DIMENSION_SEPARATOR)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

impl From<&[&str]> for Dimensions {
    fn from(tokens: &[&str]) -> Self {
        Self::new(tokens.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for Dimensions {
    fn from(tokens: [&str; N]) -> Self {
        Self::new(tokens)
    }
}

impl From<Vec<String>> for Dimensions {
    fn from(tokens: Vec<String>) -> Self {
        Self(tokens)
    }
}

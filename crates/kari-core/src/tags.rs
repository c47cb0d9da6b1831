//! # BIO Tags
//!
//! Parses tag strings of the BIO (Begin-Inside-Outside) scheme, e.g.
//! `B-PER`, `I-PER` and `O`. Tags without a recognised prefix are treated
//! as single-token labels of their own type.

use std::fmt;

/// A parsed BIO tag borrowing its entity type from the tag string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioTag<'a> {
    Begin(&'a str),
    Inside(&'a str),
    /// A label with no BIO prefix.
    Single(&'a str),
    Outside,
}

impl<'a> BioTag<'a> {
    /// Parse a tag string. Both `-` and `_` separate prefix and type.
    pub fn parse(tag: &'a str) -> Self {
        if tag == "O" || tag.is_empty() {
            return BioTag::Outside;
        }
        let split = tag
            .split_once('-')
            .or_else(|| tag.split_once('_'))
            .filter(|(_, kind)| !kind.is_empty());
        match split {
            Some(("B", kind)) => BioTag::Begin(kind),
            Some(("I", kind)) => BioTag::Inside(kind),
            _ => BioTag::Single(tag),
        }
    }

    /// Entity type, `None` for `O`.
    pub fn entity(&self) -> Option<&'a str> {
        match self {
            BioTag::Begin(kind) | BioTag::Inside(kind) | BioTag::Single(kind) => Some(kind),
            BioTag::Outside => None,
        }
    }

    /// Check if this is a "Begin" tag.
    pub fn is_begin(&self) -> bool {
        matches!(self, BioTag::Begin(_))
    }

    /// Check if this is an "Inside" tag.
    pub fn is_inside(&self) -> bool {
        matches!(self, BioTag::Inside(_))
    }
}

impl fmt::Display for BioTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BioTag::Begin(kind) => write!(f, "B-{kind}"),
            BioTag::Inside(kind) => write!(f, "I-{kind}"),
            BioTag::Single(kind) => f.write_str(kind),
            BioTag::Outside => f.write_str("O"),
        }
    }
}

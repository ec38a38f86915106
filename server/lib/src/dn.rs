//! Distinguished names. The engine only ever compares names in their
//! normalised form: attribute types and values are lowercased, and the
//! whitespace around `=`, `,` and `+` is removed. Parents and ancestors are
//! computed syntactically, so nothing here touches the entry store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::prelude::*;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Dn(String);

impl Dn {
    /// The root DSE, which has an empty name.
    pub fn root() -> Self {
        Dn(String::new())
    }

    pub fn new(raw: &str) -> Result<Self, OperationError> {
        normalise(raw).map(Dn)
    }

    /// Wrap a string that is already normalised, such as a value produced by
    /// slicing another `Dn`.
    pub(crate) fn from_normalised(ndn: String) -> Self {
        Dn(ndn)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The syntactic parent. The parent of a single component name is the
    /// root DSE, and the root DSE has no parent.
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            return None;
        }
        match find_comp_end(&self.0, 0) {
            Some(idx) => Some(Dn(self.0[idx..].to_string())),
            None => Some(Dn::root()),
        }
    }

    /// The ancestor `level` steps above this name. Level zero is the name
    /// itself.
    pub fn ancestor(&self, level: usize) -> Option<Dn> {
        let mut current = self.clone();
        for _ in 0..level {
            current = current.parent()?;
        }
        Some(current)
    }

    /// Iterate from this name up to, and including, the root DSE.
    pub fn ancestors_inclusive(&self) -> impl Iterator<Item = Dn> {
        std::iter::successors(Some(self.clone()), |dn| dn.parent())
    }

    /// True when `self` equals `other` or is one of its ancestors. The root
    /// DSE is a suffix of every name.
    pub fn is_suffix_of(&self, other: &Dn) -> bool {
        is_suffix(&self.0, &other.0)
    }

    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        other.is_suffix_of(self) && self != other
    }

    /// The first relative name, such as `uid=bob`.
    pub fn rdn(&self) -> &str {
        match find_comp_end(&self.0, 0) {
            Some(idx) => &self.0[..idx - 1],
            None => &self.0,
        }
    }

    /// The `(type, value)` pairs of the first relative name. Multi valued
    /// names produce more than one pair.
    pub fn rdn_pairs(&self) -> Vec<(&str, &str)> {
        split_unescaped(self.rdn(), '+')
            .into_iter()
            .filter_map(|ava| ava.split_once('='))
            .collect()
    }

    pub fn components(&self) -> Vec<&str> {
        if self.is_root() {
            Vec::new()
        } else {
            split_unescaped(&self.0, ',')
        }
    }

    /// Replace the `old` suffix of this name with `new`. Returns None when
    /// `old` is not a suffix.
    pub fn rebase(&self, old: &Dn, new: &Dn) -> Option<Dn> {
        if self == old {
            return Some(new.clone());
        }
        if !old.is_suffix_of(self) {
            return None;
        }
        let head = if old.is_root() {
            self.0.as_str()
        } else {
            &self.0[..self.0.len() - old.0.len() - 1]
        };
        Some(Dn::join(head, new))
    }

    /// Build `rdn,parent` from an already normalised head.
    pub(crate) fn join(head: &str, parent: &Dn) -> Dn {
        if parent.is_root() {
            Dn(head.to_string())
        } else if head.is_empty() {
            parent.clone()
        } else {
            Dn(format!("{},{}", head, parent.0))
        }
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("(root dse)")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({:?})", self.0)
    }
}

impl FromStr for Dn {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::new(s)
    }
}

impl AsRef<str> for Dn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalise a textual name. Every component must be an `attr=value`
/// assertion; the empty string is the root DSE.
pub fn normalise(raw: &str) -> Result<String, OperationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    let mut out = String::with_capacity(trimmed.len());
    for (i, rdn) in split_unescaped(trimmed, ',').into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        for (j, ava) in split_unescaped(rdn, '+').into_iter().enumerate() {
            if j > 0 {
                out.push('+');
            }
            let Some((attr, value)) = ava.split_once('=') else {
                return Err(OperationError::InvalidDn(raw.to_string()));
            };
            let attr = attr.trim();
            let value = value.trim();
            if attr.is_empty() || attr.contains(char::is_whitespace) {
                return Err(OperationError::InvalidDn(raw.to_string()));
            }
            out.push_str(&attr.to_lowercase());
            out.push('=');
            out.push_str(&value.to_lowercase());
        }
    }
    Ok(out)
}

/// Normalise where a failure should simply mean "no match". Used by subject
/// predicates where the value came from an entry or a rule.
pub fn normalise_lossy(raw: &str) -> Option<String> {
    normalise(raw).ok()
}

/// Case insensitive suffix test over normalised names, respecting component
/// boundaries.
pub fn is_suffix(suffix: &str, ndn: &str) -> bool {
    if suffix.is_empty() {
        return true;
    }
    let Some(off) = ndn.len().checked_sub(suffix.len()) else {
        return false;
    };
    // The tail is compared as bytes; `off` may fall inside a character.
    if !ndn.is_char_boundary(off)
        || !ndn.as_bytes()[off..].eq_ignore_ascii_case(suffix.as_bytes())
    {
        return false;
    }
    if off == 0 {
        return true;
    }
    let sep = off - 1;
    ndn.as_bytes()[sep] == b',' && !is_escaped(ndn, sep)
}

/// Returns the index just past the next unescaped `,` at or after `start`,
/// which is where the following component begins.
pub fn find_comp_end(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b',' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn is_escaped(s: &str, idx: usize) -> bool {
    let bytes = s.as_bytes();
    let mut count = 0;
    let mut i = idx;
    while i > 0 && bytes[i - 1] == b'\\' {
        count += 1;
        i -= 1;
    }
    count % 2 == 1
}

fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut begin = 0;
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[begin..idx]);
            begin = idx + c.len_utf8();
        }
    }
    parts.push(&s[begin..]);
    parts
}

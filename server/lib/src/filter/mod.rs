//! LDAP search filters as used by rule targets, attribute value filters and
//! dynamic group urls. Filters are parsed from their RFC 4515 string form and
//! tested against a single in memory [`Entry`].

use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::prelude::*;

pub mod ldapurl;

pub use self::ldapurl::LdapUrl;

/// A compiled wildcard pattern, such as `uid=*,ou=people,dc=example,dc=com`
/// or the assertion of a substring filter. Matching is anchored at both ends
/// and ignores case.
#[derive(Clone)]
pub struct SubstringPattern {
    text: String,
    re: Regex,
}

impl SubstringPattern {
    pub fn new(
        initial: Option<&str>,
        any: &[&str],
        fin: Option<&str>,
    ) -> Result<Self, OperationError> {
        let mut text = String::new();
        let mut re = String::from("^");
        if let Some(i) = initial {
            text.push_str(i);
            re.push_str(&regex::escape(i));
        }
        text.push('*');
        re.push_str(".*");
        for a in any {
            text.push_str(a);
            text.push('*');
            re.push_str(&regex::escape(a));
            re.push_str(".*");
        }
        if let Some(f) = fin {
            text.push_str(f);
            re.push_str(&regex::escape(f));
        }
        re.push('$');

        Self::compile(text, &re)
    }

    /// Build from text where every `*` is a wildcard.
    pub fn from_wildcard(text: &str) -> Result<Self, OperationError> {
        let parts: Vec<&str> = text.split('*').collect();
        match parts.as_slice() {
            [first, middle @ .., last] => {
                let initial = (!first.is_empty()).then_some(*first);
                let fin = (!last.is_empty()).then_some(*last);
                let any: Vec<&str> = middle.iter().copied().filter(|s| !s.is_empty()).collect();
                Self::new(initial, &any, fin)
            }
            _ => Self::compile(text.to_string(), &format!("^{}$", regex::escape(text))),
        }
    }

    fn compile(text: String, re: &str) -> Result<Self, OperationError> {
        match RegexBuilder::new(re)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
        {
            Ok(re) => Ok(SubstringPattern { text, re }),
            Err(e) => {
                admin_error!(?e, "unable to compile wildcard pattern");
                Err(OperationError::InvalidFilter(text))
            }
        }
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.re.is_match(value)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Debug for SubstringPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubstringPattern({:?})", self.text)
    }
}

impl PartialEq for SubstringPattern {
    fn eq(&self, other: &Self) -> bool {
        self.text.eq_ignore_ascii_case(&other.text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    Present(String),
    Substring(String, SubstringPattern),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Approx(String, String),
}

impl Filter {
    pub fn eq(attr: &str, value: &str) -> Self {
        Filter::Equality(attr.to_lowercase(), value.to_string())
    }

    pub fn pres(attr: &str) -> Self {
        Filter::Present(attr.to_lowercase())
    }

    /// `(objectclass=*)`, which every entry matches.
    pub fn everything() -> Self {
        Filter::pres(ATTR_OBJECTCLASS)
    }

    /// Parse the string form of a filter. The outer parentheses may be
    /// omitted for a single item, as administrators often do in rules.
    pub fn parse(text: &str) -> Result<Self, OperationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(OperationError::InvalidFilter(text.to_string()));
        }
        let wrapped;
        let input = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            wrapped.as_str()
        };

        let mut parser = Parser {
            src: input,
            bytes: input.as_bytes(),
            pos: 0,
        };
        let f = parser.parse_filter()?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(OperationError::InvalidFilter(text.to_string()));
        }
        Ok(f)
    }

    /// Test the filter against an entry. Filters have no error channel, so an
    /// assertion that can not be evaluated is simply not matched.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::And(fs) => fs.iter().all(|f| f.matches(entry)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(entry)),
            Filter::Not(f) => !f.matches(entry),
            Filter::Present(attr) => entry.has_attribute(attr),
            Filter::Equality(attr, value) => values_of(entry, attr)
                .iter()
                .any(|v| value_eq(v, value)),
            Filter::Substring(attr, pat) => values_of(entry, attr)
                .iter()
                .any(|v| pat.is_match(v)),
            Filter::GreaterOrEqual(attr, value) => values_of(entry, attr)
                .iter()
                .any(|v| ordering(v, value) != std::cmp::Ordering::Less),
            Filter::LessOrEqual(attr, value) => values_of(entry, attr)
                .iter()
                .any(|v| ordering(v, value) != std::cmp::Ordering::Greater),
            Filter::Approx(attr, value) => values_of(entry, attr)
                .iter()
                .any(|v| squash(v) == squash(value)),
        }
    }

    /// True if the filter references `attr` anywhere.
    pub fn references(&self, attr: &str) -> bool {
        match self {
            Filter::And(fs) | Filter::Or(fs) => fs.iter().any(|f| f.references(attr)),
            Filter::Not(f) => f.references(attr),
            Filter::Present(a)
            | Filter::Equality(a, _)
            | Filter::Substring(a, _)
            | Filter::GreaterOrEqual(a, _)
            | Filter::LessOrEqual(a, _)
            | Filter::Approx(a, _) => a.eq_ignore_ascii_case(attr),
        }
    }
}

/// Values of the attribute, with the entry's own DN available as `entrydn`
/// so targets can be expressed as filters.
fn values_of(entry: &Entry, attr: &str) -> Vec<String> {
    if attr == "entrydn" {
        return vec![entry.dn().as_str().to_string()];
    }
    entry.values(attr).to_vec()
}

fn value_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn ordering(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(fs) => {
                f.write_str("(&")?;
                for x in fs {
                    write!(f, "{}", x)?;
                }
                f.write_str(")")
            }
            Filter::Or(fs) => {
                f.write_str("(|")?;
                for x in fs {
                    write!(f, "{}", x)?;
                }
                f.write_str(")")
            }
            Filter::Not(x) => write!(f, "(!{})", x),
            Filter::Equality(a, v) => write!(f, "({}={})", a, escape(v)),
            Filter::Present(a) => write!(f, "({}=*)", a),
            Filter::Substring(a, p) => write!(f, "({}={})", a, p.as_str()),
            Filter::GreaterOrEqual(a, v) => write!(f, "({}>={})", a, escape(v)),
            Filter::LessOrEqual(a, v) => write!(f, "({}<={})", a, escape(v)),
            Filter::Approx(a, v) => write!(f, "({}~={})", a, escape(v)),
        }
    }
}

fn escape(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self) -> OperationError {
        OperationError::InvalidFilter(self.src.to_string())
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), OperationError> {
        self.skip_ws();
        if self.bytes.get(self.pos) == Some(&b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err())
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, OperationError> {
        self.expect(b'(')?;
        self.skip_ws();
        let f = match self.bytes.get(self.pos) {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.err()),
        };
        self.expect(b')')?;
        Ok(f)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, OperationError> {
        let mut list = Vec::new();
        loop {
            self.skip_ws();
            match self.bytes.get(self.pos) {
                Some(b'(') => list.push(self.parse_filter()?),
                Some(b')') if !list.is_empty() => return Ok(list),
                _ => return Err(self.err()),
            }
        }
    }

    fn parse_item(&mut self) -> Result<Filter, OperationError> {
        let start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'=' | b'~' | b'<' | b'>' | b'(' | b')' => break,
                _ => self.pos += 1,
            }
        }
        let attr = self.src[start..self.pos].trim().to_lowercase();
        if attr.is_empty() || attr.contains(':') || attr.contains(char::is_whitespace) {
            return Err(self.err());
        }

        let op = match (self.bytes.get(self.pos), self.bytes.get(self.pos + 1)) {
            (Some(b'='), _) => {
                self.pos += 1;
                b'='
            }
            (Some(c @ (b'~' | b'<' | b'>')), Some(b'=')) => {
                self.pos += 2;
                *c
            }
            _ => return Err(self.err()),
        };

        let vstart = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b')' {
            if self.bytes[self.pos] == b'(' {
                return Err(self.err());
            }
            self.pos += 1;
        }
        let raw = &self.src[vstart..self.pos];

        match op {
            b'=' => {
                if raw == "*" {
                    return Ok(Filter::Present(attr));
                }
                let pieces = split_raw_wildcards(raw);
                if pieces.len() == 1 {
                    Ok(Filter::Equality(attr, unescape(raw).ok_or_else(|| self.err())?))
                } else {
                    let mut decoded = Vec::with_capacity(pieces.len());
                    for p in pieces {
                        decoded.push(unescape(p).ok_or_else(|| self.err())?);
                    }
                    let (first, rest) = decoded.split_first().ok_or_else(|| self.err())?;
                    let (last, middle) = rest.split_last().ok_or_else(|| self.err())?;
                    let any: Vec<&str> = middle
                        .iter()
                        .map(|s| s.as_str())
                        .filter(|s| !s.is_empty())
                        .collect();
                    let pat = SubstringPattern::new(
                        (!first.is_empty()).then_some(first.as_str()),
                        &any,
                        (!last.is_empty()).then_some(last.as_str()),
                    )?;
                    Ok(Filter::Substring(attr, pat))
                }
            }
            b'~' => Ok(Filter::Approx(attr, unescape(raw).ok_or_else(|| self.err())?)),
            b'>' => Ok(Filter::GreaterOrEqual(
                attr,
                unescape(raw).ok_or_else(|| self.err())?,
            )),
            _ => Ok(Filter::LessOrEqual(
                attr,
                unescape(raw).ok_or_else(|| self.err())?,
            )),
        }
    }
}

/// Split an assertion value on literal `*`. Escaped stars are `\2a` so a
/// plain split is enough.
fn split_raw_wildcards(raw: &str) -> Vec<&str> {
    raw.split('*').collect()
}

/// Decode RFC 4515 `\XX` escapes. Invalid UTF-8 is replaced rather than
/// rejected.
fn unescape(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = raw.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

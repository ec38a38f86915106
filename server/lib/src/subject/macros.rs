//! Parameterised rules.
//!
//! A macro target such as `ou=($dn),dc=example,dc=com` captures part of the
//! entry DN. Subjects and target filters of the same rule may then use:
//!
//! * `($dn)` - replaced by the captured value,
//! * `[$dn]` - replaced by the captured value and by each of its suffixes in
//!   turn, one candidate per level,
//! * `($attr.name)` - replaced by each value of `name` on the target entry.
//!
//! Several attribute placeholders produce the cross product of their values.
//! [`MacroExpansion`] generates the candidates lazily.

use regex::RegexBuilder;

use super::{evaluate_literal, SubjectContext, Truth};
use crate::dn;
use crate::prelude::*;
use crate::rule::{Comparator, SubjectAtom};

const DN_MACRO: &str = "($dn)";
const DN_LEVEL_MACRO: &str = "[$dn]";
const ATTR_MACRO: &str = "($attr.";

pub fn has_dn_macro(s: &str) -> bool {
    let l = s.to_lowercase();
    l.contains(DN_MACRO) || l.contains(DN_LEVEL_MACRO)
}

pub fn has_attr_macro(s: &str) -> bool {
    s.to_lowercase().contains(ATTR_MACRO)
}

pub fn has_any_macro(s: &str) -> bool {
    has_dn_macro(s) || has_attr_macro(s)
}

/// Match a macro target against a normalised entry DN and return the
/// captured value, or None when the entry is not covered by the target.
pub fn match_macro_in_target(target: &str, ndn: &str) -> Option<String> {
    let target = target.to_lowercase();
    let (pos, len) = target
        .find(DN_MACRO)
        .map(|p| (p, DN_MACRO.len()))
        .or_else(|| target.find(DN_LEVEL_MACRO).map(|p| (p, DN_LEVEL_MACRO.len())))?;

    let prefix = &target[..pos];
    let suffix = &target[pos + len..];
    let suffix = suffix.strip_prefix(',').unwrap_or(suffix);

    // The entry must sit strictly below the fixed suffix.
    if !dn::is_suffix(suffix, ndn) || ndn.len() <= suffix.len() {
        return None;
    }
    let end = ndn.len() - suffix.len();

    let start = if prefix.is_empty() {
        0
    } else if prefix.contains("=*") {
        match_wildcard_prefix(prefix, ndn)?
    } else {
        ndn.find(prefix)? + prefix.len()
    };
    if start > end {
        return None;
    }

    let matched = ndn[start..end].trim_end_matches(',');
    if matched.is_empty() {
        None
    } else {
        Some(matched.to_string())
    }
}

/// Match a prefix like `uid=*,ou=` at the start of `ndn`, where each `*`
/// covers one component value. Returns the end of the match.
fn match_wildcard_prefix(prefix: &str, ndn: &str) -> Option<usize> {
    let pattern = prefix
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"(?:[^,\\]|\\.)*");
    let re = RegexBuilder::new(&format!("^{}", pattern))
        .case_insensitive(true)
        .build()
        .ok()?;
    re.find(ndn).map(|m| m.end())
}

#[derive(Debug, Clone)]
enum Segment {
    Lit(String),
    Attr(String),
}

/// Byte offset of the next ASCII `needle` in `haystack` at or after `from`,
/// ignoring ASCII case. Offsets always fall on character boundaries.
fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    (from..=hay.len() - needle.len())
        .find(|&i| hay[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

fn parse_segments(template: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut rest = template;
    loop {
        let Some(start) = find_ci(rest, ATTR_MACRO, 0) else {
            if !rest.is_empty() {
                out.push(Segment::Lit(rest.to_string()));
            }
            return out;
        };
        let name_start = start + ATTR_MACRO.len();
        let Some(close) = rest[name_start..].find(')') else {
            out.push(Segment::Lit(rest.to_string()));
            return out;
        };
        if start > 0 {
            out.push(Segment::Lit(rest[..start].to_string()));
        }
        out.push(Segment::Attr(
            rest[name_start..name_start + close].trim().to_lowercase(),
        ));
        rest = &rest[name_start + close + 1..];
    }
}

fn replace_ci(haystack: &str, needle: &str, with: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    while let Some(idx) = find_ci(haystack, needle, last) {
        out.push_str(&haystack[last..idx]);
        out.push_str(with);
        last = idx + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

/// Lazily produce every literal string a template expands to.
pub struct MacroExpansion<'e> {
    entry: &'e Entry,
    dn_candidates: Vec<String>,
    next_dn: usize,
    segments: Vec<Segment>,
    odometer: Vec<usize>,
    exhausted: bool,
}

impl<'e> MacroExpansion<'e> {
    /// With a DN placeholder and no captured value the expansion is empty.
    pub fn new(template: &str, matched: Option<&str>, entry: &'e Entry) -> Self {
        let lower = template.to_lowercase();
        let dn_candidates = if lower.contains(DN_LEVEL_MACRO) {
            match matched {
                Some(m) => {
                    let full = replace_ci(template, DN_MACRO, m);
                    level_suffixes(m)
                        .into_iter()
                        .map(|s| replace_ci(&full, DN_LEVEL_MACRO, s))
                        .collect()
                }
                None => Vec::new(),
            }
        } else if lower.contains(DN_MACRO) {
            match matched {
                Some(m) => vec![replace_ci(template, DN_MACRO, m)],
                None => Vec::new(),
            }
        } else {
            vec![template.to_string()]
        };

        MacroExpansion {
            entry,
            dn_candidates,
            next_dn: 0,
            segments: Vec::new(),
            odometer: Vec::new(),
            exhausted: true,
        }
    }

    /// Start again from the first candidate.
    pub fn restart(&mut self) {
        self.next_dn = 0;
        self.exhausted = true;
    }

    fn load(&mut self, template_idx: usize) {
        self.segments = parse_segments(&self.dn_candidates[template_idx]);
        self.odometer = vec![0; self.segments.len()];
        // An absent attribute makes this template produce nothing.
        self.exhausted = self.segments.iter().any(|s| match s {
            Segment::Attr(name) => self.entry.values(name).is_empty(),
            Segment::Lit(_) => false,
        });
    }

    fn emit(&self) -> String {
        let mut out = String::new();
        for (seg, idx) in self.segments.iter().zip(self.odometer.iter()) {
            match seg {
                Segment::Lit(s) => out.push_str(s),
                Segment::Attr(name) => {
                    if let Some(v) = self.entry.values(name).get(*idx) {
                        out.push_str(v);
                    }
                }
            }
        }
        out
    }

    fn advance(&mut self) {
        for i in (0..self.segments.len()).rev() {
            if let Segment::Attr(name) = &self.segments[i] {
                self.odometer[i] += 1;
                if self.odometer[i] < self.entry.values(name).len() {
                    return;
                }
                self.odometer[i] = 0;
            }
        }
        self.exhausted = true;
    }
}

impl Iterator for MacroExpansion<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if !self.exhausted {
                let s = self.emit();
                self.advance();
                return Some(s);
            }
            if self.next_dn >= self.dn_candidates.len() {
                return None;
            }
            let idx = self.next_dn;
            self.next_dn += 1;
            self.load(idx);
        }
    }
}

/// `ou=a,ou=b,dc=c` yields itself, `ou=b,dc=c` and `dc=c`.
fn level_suffixes(value: &str) -> Vec<&str> {
    let mut out = vec![value];
    let mut idx = 0;
    while let Some(next) = dn::find_comp_end(value, idx) {
        out.push(&value[next..]);
        idx = next;
    }
    out
}

/// Evaluate an atom whose value carries placeholders. True as soon as any
/// candidate is true, otherwise undefined if any candidate was undefined.
pub(super) fn evaluate_macro(ctx: &SubjectContext<'_>, atom: &SubjectAtom) -> Truth {
    let expansion = MacroExpansion::new(&atom.value, ctx.matched, ctx.entry);
    if atom.op.is_ordering() {
        Truth::any(expansion.map(|c| evaluate_literal(ctx, atom.kind, atom.op, &c)))
    } else {
        Truth::any(expansion.map(|c| evaluate_literal(ctx, atom.kind, Comparator::Eq, &c)))
            .apply(atom.op)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_match_macro_in_target() {
        let ndn = "uid=bob,ou=sales,ou=west,dc=example,dc=com";
        assert_eq!(
            match_macro_in_target("($dn),dc=example,dc=com", ndn).as_deref(),
            Some("uid=bob,ou=sales,ou=west")
        );
        assert_eq!(
            match_macro_in_target("ou=($dn),dc=example,dc=com", ndn).as_deref(),
            Some("sales,ou=west")
        );
        assert_eq!(
            match_macro_in_target("uid=*,ou=($dn),dc=example,dc=com", ndn).as_deref(),
            Some("sales,ou=west")
        );
        assert_eq!(
            match_macro_in_target("ou=($dn),dc=other,dc=com", ndn),
            None
        );
        // The entry must be strictly below the suffix.
        assert_eq!(
            match_macro_in_target("($dn),dc=example,dc=com", "dc=example,dc=com"),
            None
        );
        assert_eq!(
            match_macro_in_target("cn=($dn),dc=example,dc=com", ndn),
            None
        );
    }

    #[test]
    fn test_expansion_dn_levels() {
        let e = Entry::try_new("cn=x,dc=com").unwrap();
        let got: Vec<String> = MacroExpansion::new(
            "ldap:///cn=admins,[$dn]",
            Some("ou=a,ou=b,dc=c"),
            &e,
        )
        .collect();
        assert_eq!(
            got,
            vec![
                "ldap:///cn=admins,ou=a,ou=b,dc=c",
                "ldap:///cn=admins,ou=b,dc=c",
                "ldap:///cn=admins,dc=c",
            ]
        );
        assert_eq!(
            MacroExpansion::new("ldap:///($dn)", None, &e).count(),
            0
        );
    }

    #[test]
    fn test_expansion_cross_product_is_deterministic() {
        let e1 = Entry::try_new("cn=x,dc=com")
            .unwrap()
            .with_values("l", ["paris", "oslo"])
            .with_values("ou", ["eng", "ops", "qa"]);
        let e2 = Entry::try_new("cn=x,dc=com")
            .unwrap()
            .with_values("ou", ["qa", "eng", "ops"])
            .with_values("l", ["oslo", "paris"]);
        let template = "ldap:///cn=($attr.ou)-($attr.L),ou=($dn),dc=com";

        let mut a = MacroExpansion::new(template, Some("groups"), &e1);
        let first: BTreeSet<String> = a.by_ref().collect();
        a.restart();
        let again: BTreeSet<String> = a.collect();
        let other: BTreeSet<String> = MacroExpansion::new(template, Some("groups"), &e2).collect();

        assert_eq!(first.len(), 6);
        assert_eq!(first, again);
        assert_eq!(first, other);
        assert!(first.contains("ldap:///cn=ops-oslo,ou=groups,dc=com"));
    }

    #[test]
    fn test_expansion_missing_attribute() {
        let e = Entry::try_new("cn=x,dc=com").unwrap();
        assert_eq!(
            MacroExpansion::new("ldap:///cn=($attr.manager)", None, &e).count(),
            0
        );
        assert_eq!(
            MacroExpansion::new("ldap:///cn=plain", None, &e).collect::<Vec<_>>(),
            vec!["ldap:///cn=plain"]
        );
    }

    #[test]
    fn test_macros_after_non_ascii_text() {
        // `İ` grows by a byte when lowercased.
        assert_eq!(replace_ci("cn=İ,($DN)", DN_MACRO, "uid=x"), "cn=İ,uid=x");
        assert_eq!(
            replace_ci("cn=Zoë,($dn),($dn)", DN_MACRO, "ou=a"),
            "cn=Zoë,ou=a,ou=a"
        );

        let e = Entry::try_new("cn=x,dc=com")
            .unwrap()
            .with_value("cn", "José");
        let got: Vec<String> =
            MacroExpansion::new("ldap:///cn=İ,cn=($Attr.cn),ou=($dn)", Some("people"), &e)
                .collect();
        assert_eq!(got, vec!["ldap:///cn=İ,cn=José,ou=people"]);
    }

    #[test]
    fn test_match_macro_in_target_non_ascii() {
        let ndn = "uid=zoë,ou=josé,dc=example,dc=com";
        assert_eq!(
            match_macro_in_target("ou=($dn),dc=example,dc=com", ndn).as_deref(),
            Some("josé")
        );
        assert_eq!(
            match_macro_in_target("($dn),dc=éxample,dc=com", "cn=éxxxxxxxxx,dc=com"),
            None
        );
    }
}

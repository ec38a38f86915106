//! The resource side of a rule: which entries and attributes it applies to.

use crate::filter::{Filter, SubstringPattern};
use crate::prelude::*;
use crate::subject::macros;

#[derive(Debug, Clone, PartialEq)]
pub enum TargetKind {
    /// The named entry and everything below it.
    Dn(Dn),
    /// A wildcard match against the whole normalised DN of the entry.
    Pattern(SubstringPattern),
    /// A DN containing `($dn)` or `[$dn]`. The portion of the entry DN the
    /// placeholder covers is captured for substitution into the subject.
    Macro(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub kind: TargetKind,
    pub negated: bool,
}

impl Target {
    /// Classify a target DN. Text carrying a macro placeholder becomes a
    /// macro target, text with a `*` becomes a pattern, and anything else
    /// must be a valid DN.
    pub fn parse(text: &str, negated: bool) -> Result<Self, RuleSyntaxError> {
        let kind = if macros::has_dn_macro(text) {
            TargetKind::Macro(text.trim().to_lowercase())
        } else if text.contains('*') {
            let normalised: String = text
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .collect::<Vec<_>>()
                .join(",");
            TargetKind::Pattern(
                SubstringPattern::from_wildcard(&normalised)
                    .map_err(|_| RuleSyntaxError::TargetFilter)?,
            )
        } else {
            TargetKind::Dn(Dn::new(text).map_err(|_| RuleSyntaxError::TargetFilter)?)
        };
        Ok(Target { kind, negated })
    }

    pub fn is_macro(&self) -> bool {
        matches!(self.kind, TargetKind::Macro(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrMatcher {
    Exact(String),
    Pattern(SubstringPattern),
    All,
}

impl AttrMatcher {
    pub fn parse(text: &str) -> Result<Self, RuleSyntaxError> {
        let t = text.trim().to_lowercase();
        if t == "*" {
            Ok(AttrMatcher::All)
        } else if t.is_empty() {
            Err(RuleSyntaxError::Syntax)
        } else if t.contains('*') {
            SubstringPattern::from_wildcard(&t)
                .map(AttrMatcher::Pattern)
                .map_err(|_| RuleSyntaxError::Syntax)
        } else {
            Ok(AttrMatcher::Exact(t))
        }
    }

    pub fn matches(&self, attr: &str) -> bool {
        match self {
            AttrMatcher::Exact(name) => name.eq_ignore_ascii_case(attr),
            AttrMatcher::Pattern(p) => p.is_match(attr),
            AttrMatcher::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetAttrs {
    pub names: Vec<AttrMatcher>,
    pub negated: bool,
}

impl TargetAttrs {
    /// Parse a `||` separated list such as `cn || sn || mail`.
    pub fn parse(text: &str, negated: bool) -> Result<Self, RuleSyntaxError> {
        let names = text
            .split("||")
            .map(AttrMatcher::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TargetAttrs { names, negated })
    }

    /// Which matcher, if any, covers `attr`. Negation is applied by the
    /// caller.
    pub fn find(&self, attr: &str) -> Option<&AttrMatcher> {
        self.names.iter().find(|m| m.matches(attr))
    }

    pub fn is_star(&self) -> bool {
        self.names.iter().any(|m| matches!(m, AttrMatcher::All))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetFilter {
    pub text: String,
    /// Parsed once when the text has no macro placeholder.
    pub filter: Option<Filter>,
    pub negated: bool,
}

impl TargetFilter {
    pub fn parse(text: &str, negated: bool) -> Result<Self, RuleSyntaxError> {
        let filter = if macros::has_any_macro(text) {
            None
        } else {
            Some(Filter::parse(text).map_err(|_| RuleSyntaxError::TargetFilterParse)?)
        };
        Ok(TargetFilter {
            text: text.trim().to_string(),
            filter,
            negated,
        })
    }

    pub fn is_macro(&self) -> bool {
        self.filter.is_none()
    }
}

/// One `attr:filter` element of `targattrfilters`. Every value of `attr`
/// added or deleted must satisfy `filter`.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrFilter {
    pub attr: String,
    pub filter: Filter,
}

impl AttrFilter {
    pub fn parse(text: &str) -> Result<Self, RuleSyntaxError> {
        let (attr, filter) = text
            .split_once(':')
            .ok_or(RuleSyntaxError::TargetAttrFilter)?;
        let attr = attr.trim().to_lowercase();
        if attr.is_empty() {
            return Err(RuleSyntaxError::TargetAttrFilter);
        }
        let filter = Filter::parse(filter).map_err(|_| RuleSyntaxError::TargetAttrFilter)?;
        Ok(AttrFilter { attr, filter })
    }

    /// Parse the `attr:filter && attr:filter` list of one operation.
    pub fn parse_list(text: &str) -> Result<Vec<Self>, RuleSyntaxError> {
        text.split("&&").map(AttrFilter::parse).collect()
    }
}

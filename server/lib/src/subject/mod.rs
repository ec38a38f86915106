//! Subject predicate evaluation.
//!
//! Every atom of a rule's subject evaluates to a [`Truth`]. `Undefined` means
//! the answer could not be determined, because of a lookup error, a resource
//! limit or malformed data, and is never flipped by negation. The rights
//! tester turns the per clause truths into a [`Verdict`].

use std::cell::OnceCell;
use std::ops::Deref;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::groupcache::GroupMembershipCache;
use crate::prelude::*;
use crate::rule::{Comparator, SubjectAtom, SubjectExpr, SubjectKind};

mod attr;
mod auth;
mod clock;
mod group;
pub mod macros;
mod network;
mod role;
mod userdn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Undefined,
}

impl Truth {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    pub fn is_true(self) -> bool {
        self == Truth::True
    }

    /// Logical not. Undefined stays undefined.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Undefined => Truth::Undefined,
        }
    }

    /// Apply an equality comparator to a positive result.
    pub fn apply(self, op: Comparator) -> Self {
        match op {
            Comparator::Ne => self.not(),
            _ => self,
        }
    }

    /// Disjunction: true if any is true, otherwise undefined if any is
    /// undefined, otherwise false. Stops at the first true.
    pub fn any<I: IntoIterator<Item = Truth>>(iter: I) -> Self {
        let mut undefined = false;
        for t in iter {
            match t {
                Truth::True => return Truth::True,
                Truth::Undefined => undefined = true,
                Truth::False => {}
            }
        }
        if undefined {
            Truth::Undefined
        } else {
            Truth::False
        }
    }

    /// Conjunction: false if any is false, otherwise undefined if any is
    /// undefined, otherwise true. Stops at the first false.
    pub fn all<I: IntoIterator<Item = Truth>>(iter: I) -> Self {
        let mut undefined = false;
        for t in iter {
            match t {
                Truth::False => return Truth::False,
                Truth::Undefined => undefined = true,
                Truth::True => {}
            }
        }
        if undefined {
            Truth::Undefined
        } else {
            Truth::True
        }
    }
}

/// The outcome of testing one rule's clauses for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    Undefined,
}

/// Everything a predicate may look at while deciding.
pub struct SubjectContext<'a> {
    pub principal: &'a Principal,
    pub entry: &'a Entry,
    pub attr: Option<&'a str>,
    pub now: OffsetDateTime,
    pub directory: &'a dyn Directory,
    pub groups: &'a GroupMembershipCache,
    /// The value a macro target captured from the entry DN, if any.
    pub matched: Option<&'a str>,
    client_entry: OnceCell<Result<Option<Arc<Entry>>, OperationError>>,
}

impl<'a> SubjectContext<'a> {
    pub fn new(
        principal: &'a Principal,
        entry: &'a Entry,
        attr: Option<&'a str>,
        now: OffsetDateTime,
        directory: &'a dyn Directory,
        groups: &'a GroupMembershipCache,
    ) -> Self {
        SubjectContext {
            principal,
            entry,
            attr,
            now,
            directory,
            groups,
            matched: None,
            client_entry: OnceCell::new(),
        }
    }

    pub fn with_matched(mut self, matched: Option<&'a str>) -> Self {
        self.matched = matched;
        self
    }

    /// The principal's own entry, fetched at most once per context.
    pub fn client_entry(&self) -> Result<Option<Arc<Entry>>, OperationError> {
        self.client_entry
            .get_or_init(|| match self.principal.dn() {
                Some(dn) => self.directory.get_entry(dn),
                None => Ok(None),
            })
            .clone()
    }
}

/// Evaluate a subject expression.
pub fn evaluate_expr(ctx: &SubjectContext<'_>, expr: &SubjectExpr) -> Truth {
    match expr {
        SubjectExpr::Atom(atom) => evaluate_atom(ctx, atom),
        SubjectExpr::And(v) => Truth::all(v.iter().map(|e| evaluate_expr(ctx, e))),
        SubjectExpr::Or(v) => Truth::any(v.iter().map(|e| evaluate_expr(ctx, e))),
        SubjectExpr::Not(e) => evaluate_expr(ctx, e).not(),
    }
}

pub fn evaluate_atom(ctx: &SubjectContext<'_>, atom: &SubjectAtom) -> Truth {
    let t = if atom.has_macro() {
        macros::evaluate_macro(ctx, atom)
    } else {
        evaluate_literal(ctx, atom.kind, atom.op, &atom.value)
    };
    subject_trace!(atom = %atom, result = ?t, "subject atom evaluated");
    t
}

/// Evaluate one atom whose value holds no placeholders. Equality kinds
/// compute the positive answer and then apply the comparator.
pub(crate) fn evaluate_literal(
    ctx: &SubjectContext<'_>,
    kind: SubjectKind,
    op: Comparator,
    value: &str,
) -> Truth {
    match kind {
        SubjectKind::UserDn => userdn::evaluate(ctx, value).apply(op),
        SubjectKind::GroupDn => group::evaluate_groupdn(ctx, value).apply(op),
        SubjectKind::RoleDn => role::evaluate(ctx, value).apply(op),
        SubjectKind::UserDnAttr => attr::evaluate_userdnattr(ctx, value).apply(op),
        SubjectKind::GroupDnAttr => group::evaluate_groupdnattr(ctx, value).apply(op),
        SubjectKind::UserAttr => attr::evaluate_userattr(ctx, value).apply(op),
        SubjectKind::Ip => network::evaluate_ip(ctx, value).apply(op),
        SubjectKind::Dns => network::evaluate_dns(ctx, value).apply(op),
        SubjectKind::TimeOfDay => clock::evaluate_timeofday(ctx, op, value),
        SubjectKind::DayOfWeek => clock::evaluate_dayofweek(ctx, value).apply(op),
        SubjectKind::AuthMethod => auth::evaluate_authmethod(ctx, value).apply(op),
        SubjectKind::Ssf => auth::evaluate_ssf(ctx, op, value),
    }
}

/// Split a `||` separated list of subject values.
pub(crate) fn split_values(value: &str) -> impl Iterator<Item = &str> {
    value.split("||").map(str::trim).filter(|s| !s.is_empty())
}

/// Parse `parent[0,1,2].attr` into its levels and attribute. A plain
/// attribute name is level zero only.
pub(crate) fn parse_inheritance(spec: &str) -> Option<(Vec<usize>, String)> {
    let spec = spec.trim();
    let lower = spec.to_lowercase();
    if let Some(rest) = lower.strip_prefix("parent[") {
        let (levels, attr) = rest.split_once("].")?;
        let levels = levels
            .split(',')
            .map(|l| l.trim().parse::<usize>().ok().filter(|l| *l <= 4))
            .collect::<Option<Vec<_>>>()?;
        let attr = attr.trim().to_string();
        if attr.is_empty() || levels.is_empty() {
            return None;
        }
        Some((levels, attr))
    } else if lower.is_empty() || lower.contains(['[', ']', '=']) {
        None
    } else {
        Some((vec![0], lower))
    }
}

/// An entry the inheritance forms of `userdnattr` and `userattr` look at.
pub(crate) enum LevelEntry<'a> {
    Target(&'a Entry),
    Ancestor(Arc<Entry>),
}

impl Deref for LevelEntry<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        match self {
            LevelEntry::Target(e) => e,
            LevelEntry::Ancestor(e) => e,
        }
    }
}

/// The entry at `level` above the target, level zero being the target
/// itself. A missing ancestor yields `Ok(None)`.
pub(crate) fn entry_at_level<'a>(
    ctx: &SubjectContext<'a>,
    level: usize,
) -> Result<Option<LevelEntry<'a>>, OperationError> {
    if level == 0 {
        return Ok(Some(LevelEntry::Target(ctx.entry)));
    }
    match ctx.entry.dn().ancestor(level) {
        Some(dn) if !dn.is_root() => Ok(ctx.directory.get_entry(&dn)?.map(LevelEntry::Ancestor)),
        _ => Ok(None),
    }
}

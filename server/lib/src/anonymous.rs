//! The anonymous access profile.
//!
//! Unauthenticated reads are common and only `anyone` rules can grant them,
//! so the engine keeps a flat summary of those rules and answers anonymous
//! search and read requests from it without scanning the index. The profile
//! is rebuilt whenever the index signature moves. Any rule whose effect on
//! an anonymous client can not be summarised exactly empties the profile,
//! which sends every anonymous request through full evaluation.

use std::sync::RwLock;

use crate::filter::Filter;
use crate::index::{RuleIndexTransaction, Signature};
use crate::prelude::*;
use crate::rule::{
    ClauseKind, Comparator, RuleId, RuleRecord, SubjectAtom, SubjectExpr, SubjectKind,
    TargetAttrs, TargetKind,
};
use crate::subject::{split_values, Truth};

/// One `anyone` allow, reduced to what matching an entry needs.
#[derive(Debug, Clone)]
pub struct AnonSummary {
    pub rule: RuleId,
    pub base: Dn,
    pub filter: Option<Filter>,
    /// None covers every attribute.
    pub target_attrs: Option<TargetAttrs>,
    pub rights: AccessRights,
}

impl AnonSummary {
    fn covers(&self, entry: &Entry, attr: Option<&str>, access: AccessRights) -> bool {
        if !self.rights.intersects(access & AccessRights::READ_OR_SEARCH) {
            return false;
        }
        if !self.base.is_suffix_of(entry.dn()) {
            return false;
        }
        if let Some(f) = &self.filter {
            if !f.matches(entry) {
                return false;
            }
        }
        match (attr, &self.target_attrs) {
            (None, _) | (_, None) => true,
            (Some(a), Some(ta)) => ta.find(a).is_some() != ta.negated,
        }
    }
}

#[derive(Debug, Default)]
struct ProfileInner {
    signature: Option<Signature>,
    summaries: Vec<AnonSummary>,
    disqualified: bool,
}

pub struct AnonymousProfile {
    inner: RwLock<ProfileInner>,
    max: usize,
}

impl Default for AnonymousProfile {
    fn default() -> Self {
        AnonymousProfile::new(DEFAULT_ANON_PROFILE_MAX)
    }
}

/// How an atom evaluates for a client with no identity. None when that
/// depends on something other than identity.
fn anonymous_atom(atom: &SubjectAtom) -> Option<bool> {
    if atom.has_macro() {
        return None;
    }
    let positive = match atom.kind {
        SubjectKind::UserDn => split_values(&atom.value).any(|v| {
            v.to_lowercase()
                .strip_prefix("ldap:///")
                .map(|b| b.trim() == SUBJECT_ANYONE)
                .unwrap_or(false)
        }),
        SubjectKind::GroupDn
        | SubjectKind::RoleDn
        | SubjectKind::UserDnAttr
        | SubjectKind::GroupDnAttr
        | SubjectKind::UserAttr => {
            if atom.op == Comparator::Eq {
                return Some(false);
            }
            return None;
        }
        _ => return None,
    };
    match atom.op {
        Comparator::Eq => Some(positive),
        Comparator::Ne => Some(!positive),
        _ => None,
    }
}

fn anonymous_match(expr: &SubjectExpr) -> Option<bool> {
    match expr {
        SubjectExpr::Atom(a) => anonymous_atom(a),
        SubjectExpr::And(v) => {
            let r: Vec<_> = v.iter().map(anonymous_match).collect();
            if r.contains(&Some(false)) {
                Some(false)
            } else if r.iter().all(|x| *x == Some(true)) {
                Some(true)
            } else {
                None
            }
        }
        SubjectExpr::Or(v) => {
            let r: Vec<_> = v.iter().map(anonymous_match).collect();
            if r.contains(&Some(true)) {
                Some(true)
            } else if r.iter().all(|x| *x == Some(false)) {
                Some(false)
            } else {
                None
            }
        }
        SubjectExpr::Not(e) => anonymous_match(e).map(|b| !b),
    }
}

/// Why a rule stops the profile from being used.
fn summarise(rule: &RuleRecord, out: &mut Vec<AnonSummary>) -> Result<(), &'static str> {
    for clause in rule
        .clauses
        .iter()
        .filter(|c| c.rights.intersects(AccessRights::READ_OR_SEARCH))
    {
        let applies = anonymous_match(&clause.subject);
        match (clause.kind, applies) {
            (_, Some(false)) => {}
            (ClauseKind::Deny, _) => return Err("deny rule may apply to anonymous clients"),
            (ClauseKind::Allow, None) => return Err("allow rule depends on more than identity"),
            (ClauseKind::Allow, Some(true)) => {
                if !rule.add_attr_filters.is_empty() || !rule.del_attr_filters.is_empty() {
                    return Err("attribute filter target");
                }
                if clause.subject.depth() > 1 {
                    return Err("subject nested too deeply");
                }
                let base = match &rule.target {
                    None => rule.owner.clone(),
                    Some(t) if t.negated => return Err("negated target"),
                    Some(t) => match &t.kind {
                        TargetKind::Dn(dn) => dn.clone(),
                        TargetKind::Pattern(_) => return Err("pattern target"),
                        TargetKind::Macro(_) => return Err("macro target"),
                    },
                };
                let filter = match &rule.target_filter {
                    None => None,
                    Some(tf) if tf.negated => return Err("negated target filter"),
                    Some(tf) => match &tf.filter {
                        Some(f) => Some(f.clone()),
                        None => return Err("macro target filter"),
                    },
                };
                out.push(AnonSummary {
                    rule: rule.id,
                    base,
                    filter,
                    target_attrs: rule.target_attrs.clone(),
                    rights: clause.rights & AccessRights::READ_OR_SEARCH,
                });
            }
        }
    }
    Ok(())
}

impl AnonymousProfile {
    pub fn new(max: usize) -> Self {
        AnonymousProfile {
            inner: RwLock::new(ProfileInner::default()),
            max,
        }
    }

    /// Force a rebuild on next use.
    pub fn invalidate(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.signature = None;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.summaries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disqualified(&self) -> bool {
        self.inner.read().map(|i| i.disqualified).unwrap_or(true)
    }

    /// Rebuild from the index if it changed since the last build.
    #[instrument(level = "trace", skip_all)]
    pub fn refresh<T: RuleIndexTransaction>(&self, txn: &T) {
        let signature = txn.signature();
        match self.inner.read() {
            Ok(inner) if inner.signature == Some(signature) => return,
            Ok(_) => {}
            Err(_) => return,
        }

        let mut summaries = Vec::new();
        let mut disqualified = false;
        'outer: for container in txn.containers() {
            for rule in container.rules.iter() {
                if let Err(why) = summarise(rule, &mut summaries) {
                    admin_debug!(rule = %rule, why, "anonymous profile disabled");
                    disqualified = true;
                    break 'outer;
                }
                if summaries.len() > self.max {
                    admin_debug!(max = self.max, "too many anonymous rules for the profile");
                    disqualified = true;
                    break 'outer;
                }
            }
        }
        if disqualified {
            summaries.clear();
        }

        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        admin_debug!(%signature, summaries = summaries.len(), disqualified, "anonymous profile rebuilt");
        *inner = ProfileInner {
            signature: Some(signature),
            summaries,
            disqualified,
        };
    }

    /// True or false when the profile decides the request, undefined when
    /// full evaluation is required.
    pub fn evaluate<T: RuleIndexTransaction>(
        &self,
        txn: &T,
        entry: &Entry,
        attr: Option<&str>,
        access: AccessRights,
    ) -> Truth {
        if !access.is_read_or_search() {
            return Truth::Undefined;
        }
        self.refresh(txn);
        let Ok(inner) = self.inner.read() else {
            return Truth::Undefined;
        };
        if inner.disqualified || inner.summaries.is_empty() {
            return Truth::Undefined;
        }
        match inner
            .summaries
            .iter()
            .find(|s| s.covers(entry, attr, access))
        {
            Some(s) => {
                cache_trace!(rule = %s.rule, dn = %entry.dn(), ?attr, "anonymous profile allows");
                Truth::True
            }
            None => Truth::False,
        }
    }
}

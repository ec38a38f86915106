//! Deny before allow.

use std::sync::Arc;

use crate::context::{CacheKind, Cached, ContextState};
use crate::prelude::*;
use crate::rule::{ClauseKind, RuleRecord};
use crate::subject::{evaluate_expr, SubjectContext, Verdict};

use super::{AccessOperation, DecisionReason};

/// Test the subject side of one rule. A deny clause that holds wins over any
/// allow clause of the same rule.
pub(super) fn rule_verdict(
    sctx: &SubjectContext<'_>,
    rule: &RuleRecord,
    access: AccessRights,
) -> Verdict {
    if rule
        .clauses_for(ClauseKind::Deny, access)
        .any(|c| evaluate_expr(sctx, &c.subject).is_true())
    {
        Verdict::Deny
    } else if rule
        .clauses_for(ClauseKind::Allow, access)
        .any(|c| evaluate_expr(sctx, &c.subject).is_true())
    {
        Verdict::Allow
    } else {
        Verdict::Undefined
    }
}

impl AccessOperation<'_> {
    fn evaluate_rule(
        &mut self,
        rule: &RuleRecord,
        entry: &Entry,
        attr: Option<&str>,
        access: AccessRights,
    ) -> Verdict {
        let verdict = {
            let matched = self.ctx.macro_values.get(&rule.id).cloned().flatten();
            let sctx = SubjectContext::new(
                &self.principal,
                entry,
                attr,
                self.op.now,
                self.engine.directory.as_ref(),
                &self.engine.groups,
            )
            .with_matched(matched.as_deref());
            rule_verdict(&sctx, rule, access)
        };
        self.ctx.stats.subject_evaluations += 1;
        if rule.is_entry_relative() {
            self.ctx.state |= ContextState::ATTR_RULE_EVALUATED;
        }
        subject_trace!(rule = %rule, ?verdict, "evaluated rule subject");
        verdict
    }

    fn remember(&mut self, rule: &RuleRecord, kind: Option<CacheKind>, result: Cached) {
        if let Some(kind) = kind {
            self.ctx.results.record(rule, kind, result);
        }
    }

    /// Walk the selected deny rules, then the selected allow rules. Returns
    /// whether access is granted and why.
    pub(super) fn test_rights(
        &mut self,
        entry: &Entry,
        attr: Option<&str>,
        access: AccessRights,
    ) -> (bool, DecisionReason) {
        if self.ctx.candidates.allow.is_empty() {
            return (false, DecisionReason::NoMatchedResourceAllows);
        }
        let deny: Vec<Arc<RuleRecord>> = self.ctx.candidates.deny.iter().cloned().collect();
        let allow: Vec<Arc<RuleRecord>> = self.ctx.candidates.allow.iter().cloned().collect();
        let kind = CacheKind::for_access(access);

        self.ctx.state |= ContextState::EXECUTING_DENY_HANDLES;
        for rule in deny.iter() {
            if let Some(kind) = kind {
                match self.ctx.results.lookup(rule.id, kind) {
                    Some(Cached::Deny) => {
                        return (false, DecisionReason::CachedDeny(rule.id));
                    }
                    Some(Cached::Skip) => continue,
                    // An allow only proves this rule has no deny for a
                    // search; reads must look again.
                    Some(Cached::Allow) if kind == CacheKind::Search => continue,
                    _ => {}
                }
            }
            match self.evaluate_rule(rule, entry, attr, access) {
                Verdict::Deny => {
                    self.remember(rule, kind, Cached::Deny);
                    security_info!(rule = %rule, dn = %entry.dn(), ?attr, "denied by rule");
                    return (false, DecisionReason::EvaluatedDeny(rule.id));
                }
                Verdict::Allow => self.remember(rule, kind, Cached::Allow),
                Verdict::Undefined => self.remember(rule, kind, Cached::Skip),
            }
        }
        self.ctx.state.remove(ContextState::EXECUTING_DENY_HANDLES);

        for rule in allow.iter() {
            if let Some(kind) = kind {
                match self.ctx.results.lookup(rule.id, kind) {
                    Some(Cached::Allow) => {
                        return (true, DecisionReason::CachedAllow(rule.id));
                    }
                    Some(Cached::Skip) | Some(Cached::Deny) => continue,
                    None => {}
                }
            }
            match self.evaluate_rule(rule, entry, attr, access) {
                Verdict::Allow => {
                    self.remember(rule, kind, Cached::Allow);
                    return (true, DecisionReason::EvaluatedAllow(rule.id));
                }
                _ => self.remember(rule, kind, Cached::Skip),
            }
        }

        (false, DecisionReason::NoMatchedSubjectAllows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Comparator, SubjectExpr, SubjectKind};
    use crate::testkit::*;

    #[test]
    fn test_rule_verdict_deny_clause_wins() {
        sketching::test_init();
        let fx = Fixture::new();
        let owner = Dn::new("dc=example,dc=com").unwrap();
        let rule = RuleRecord::builder(&owner, "mixed")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
            .deny(
                AccessRights::READ,
                SubjectExpr::userdn("ldap:///uid=bob,dc=example,dc=com"),
            )
            .build()
            .unwrap();
        let entry = fx.entry("cn=x,dc=example,dc=com");

        let bob = fx.user("uid=bob,dc=example,dc=com");
        let ctx = fx.subject_ctx(&bob, &entry);
        assert_eq!(rule_verdict(&ctx, &rule, AccessRights::READ), Verdict::Deny);

        let alice = fx.user("uid=alice,dc=example,dc=com");
        let ctx = fx.subject_ctx(&alice, &entry);
        assert_eq!(rule_verdict(&ctx, &rule, AccessRights::READ), Verdict::Allow);
        // Clauses for other rights are not consulted.
        assert_eq!(
            rule_verdict(&ctx, &rule, AccessRights::WRITE),
            Verdict::Undefined
        );

        let anon = Principal::anonymous();
        let ctx = fx.subject_ctx(&anon, &entry);
        assert_eq!(
            rule_verdict(&ctx, &rule, AccessRights::READ),
            Verdict::Undefined
        );
    }

    #[test]
    fn test_rule_verdict_negated_userdn() {
        sketching::test_init();
        let fx = Fixture::new();
        let owner = Dn::new("dc=example,dc=com").unwrap();
        let rule = RuleRecord::builder(&owner, "not-bob")
            .allow(
                AccessRights::READ,
                SubjectExpr::atom(
                    SubjectKind::UserDn,
                    Comparator::Ne,
                    "ldap:///uid=bob,dc=example,dc=com",
                ),
            )
            .build()
            .unwrap();
        let entry = fx.entry("cn=x,dc=example,dc=com");
        let alice = fx.user("uid=alice,dc=example,dc=com");
        let bob = fx.user("uid=bob,dc=example,dc=com");
        assert_eq!(
            rule_verdict(&fx.subject_ctx(&alice, &entry), &rule, AccessRights::READ),
            Verdict::Allow
        );
        assert_eq!(
            rule_verdict(&fx.subject_ctx(&bob, &entry), &rule, AccessRights::READ),
            Verdict::Undefined
        );
    }
}

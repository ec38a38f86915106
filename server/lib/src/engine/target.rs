//! Does a rule's target cover the entry, attribute and value in question?

use crate::context::ContextState;
use crate::filter::Filter;
use crate::prelude::*;
use crate::rule::{AttrFilter, AttrMatcher, RuleRecord, TargetKind};
use crate::subject::macros::{self, MacroExpansion};

use super::AccessOperation;

/// Rights for which an attribute list is meaningless.
const TARGETATTR_NOT_NEEDED: AccessRights = AccessRights::ADD
    .union(AccessRights::DELETE)
    .union(AccessRights::PROXY);

impl AccessOperation<'_> {
    /// Test the resource side of `rule`. With `skip_attr_eval` only the
    /// entry level parts are tested and the rights check is relaxed, which
    /// is how cache reuse finds every rule touching the entry.
    pub(super) fn resource_matches(
        &mut self,
        rule: &RuleRecord,
        entry: &Entry,
        attr: Option<&str>,
        value: Option<&str>,
        access: AccessRights,
        skip_attr_eval: bool,
    ) -> bool {
        let rights = rule.rights();
        if !rights.intersects(access) {
            // A read rule may still decide a search, so keep looking at its
            // target so it is remembered as matching the entry.
            let read_or_search = AccessRights::READ_OR_SEARCH;
            if !(access.intersects(read_or_search) && rights.intersects(read_or_search)) {
                return false;
            }
        }

        // Rules never reach above the entry holding them, and rules on the
        // root DSE only apply to the root DSE.
        if !rule.owner.is_suffix_of(entry.dn()) || (rule.owner.is_root() && !entry.dn().is_root())
        {
            return false;
        }

        if let Some(target) = &rule.target {
            let hit = match &target.kind {
                TargetKind::Dn(dn) => dn.is_suffix_of(entry.dn()),
                TargetKind::Pattern(p) => p.is_match(entry.dn().as_str()),
                TargetKind::Macro(template) => self.macro_target(rule, template, entry).is_some(),
            };
            if hit == target.negated {
                return false;
            }
        }

        if let Some(tf) = &rule.target_filter {
            let hit = match &tf.filter {
                Some(f) => f.matches(entry),
                None => {
                    let matched = self.ctx.macro_values.get(&rule.id).cloned().flatten();
                    MacroExpansion::new(&tf.text, matched.as_deref(), entry).any(|text| {
                        Filter::parse(&text)
                            .map(|f| f.matches(entry))
                            .unwrap_or(false)
                    })
                }
            };
            if hit == tf.negated {
                return false;
            }
        }

        let mut attr_matched_in_filters = false;
        if let Some(filters) = entry_filters(rule, access) {
            // Every value of every filtered attribute in the entry must pass.
            let all_pass = filters
                .iter()
                .filter(|af| entry.has_attribute(&af.attr))
                .all(|af| {
                    entry.values(&af.attr).iter().all(|v| {
                        af.filter
                            .matches(&Entry::synthesize(entry.dn(), &af.attr, v))
                    })
                });
            if !all_pass {
                return false;
            }
        } else if let Some(filters) = value_filters(rule, access) {
            if let (Some(a), Some(v)) = (attr, value) {
                if let Some(af) = filters.iter().find(|af| af.attr.eq_ignore_ascii_case(a)) {
                    if !af.filter.matches(&Entry::synthesize(entry.dn(), a, v)) {
                        return false;
                    }
                    attr_matched_in_filters = true;
                }
            }
        }

        if access.contains(AccessRights::SEARCH)
            && !skip_attr_eval
            && self.ctx.state.contains(ContextState::NEW_ENTRY)
        {
            self.ctx
                .curr
                .record_matched(rule.id, DEFAULT_TARGET_MATCHED_MAX);
        }

        if skip_attr_eval {
            return true;
        }

        if !rights.intersects(access) {
            return false;
        }

        let mut matches = true;
        if !attr_matched_in_filters {
            match (attr, &rule.target_attrs) {
                (Some(a), Some(ta)) => {
                    let found = ta.names.iter().position(|m| m.matches(a));
                    matches = found.is_some() != ta.negated;
                    let star_first = found == Some(0)
                        && matches!(ta.names.first(), Some(AttrMatcher::All));
                    self.ctx.state.remove(ContextState::ATTR_STAR_MATCHED);
                    if matches
                        && star_first
                        && !self.ctx.state.contains(ContextState::FOUND_ATTR_RULE)
                    {
                        self.ctx.state |= ContextState::ATTR_STAR_MATCHED;
                    } else {
                        // A named attribute rule rules out the star shortcut.
                        self.ctx.state |= ContextState::FOUND_ATTR_RULE;
                    }
                }
                (Some(_), None) | (None, Some(_)) => {
                    let not_needed = rights.intersects(TARGETATTR_NOT_NEEDED)
                        && access.intersects(TARGETATTR_NOT_NEEDED);
                    // A rename names no attribute but write rules with an
                    // attribute list still apply to it.
                    let rename = rights.contains(AccessRights::WRITE)
                        && rule.target_attrs.is_some()
                        && attr.is_none();
                    matches = not_needed || rename;
                }
                (None, None) => {}
            }
        }

        if rule.target_attrs.is_none()
            && self
                .ctx
                .state
                .contains(ContextState::EVALUATING_FIRST_ATTR)
        {
            self.ctx.state |= ContextState::FOUND_A_ENTRY_TEST_RULE;
        }

        matches
    }

    /// The portion of the entry DN a macro target captured. Computed once
    /// per entry and rule.
    fn macro_target(&mut self, rule: &RuleRecord, template: &str, entry: &Entry) -> Option<String> {
        if !self.ctx.state.contains(ContextState::NEW_ENTRY) {
            if let Some(v) = self.ctx.macro_values.get(&rule.id) {
                return v.clone();
            }
        }
        let captured = macros::match_macro_in_target(template, entry.dn().as_str());
        cache_trace!(rule = %rule.id, dn = %entry.dn(), ?captured, "evaluated macro target");
        self.ctx.macro_values.insert(rule.id, captured.clone());
        captured
    }
}

/// Filters applying to a whole entry being added or deleted.
fn entry_filters(rule: &RuleRecord, access: AccessRights) -> Option<&[AttrFilter]> {
    if access.contains(AccessRights::ADD) && !rule.add_attr_filters.is_empty() {
        Some(&rule.add_attr_filters)
    } else if access.contains(AccessRights::DELETE) && !rule.del_attr_filters.is_empty() {
        Some(&rule.del_attr_filters)
    } else {
        None
    }
}

/// Filters applying to one value added to or removed from an attribute.
fn value_filters(rule: &RuleRecord, access: AccessRights) -> Option<&[AttrFilter]> {
    if access.contains(AccessRights::WRITE_ADD) && !rule.add_attr_filters.is_empty() {
        Some(&rule.add_attr_filters)
    } else if access.contains(AccessRights::WRITE_DEL) && !rule.del_attr_filters.is_empty() {
        Some(&rule.del_attr_filters)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AclConfig;
    use crate::context::ContextState;
    use crate::prelude::*;
    use crate::rule::SubjectExpr;
    use crate::testkit::*;

    const BASE: &str = "dc=example,dc=com";

    fn modify_op() -> OperationInfo {
        OperationInfo::new(1, 1, OperationKind::Modify)
    }

    #[test]
    fn test_rules_do_not_reach_above_their_owner() {
        let fx = setup_engine(AclConfig::default());
        fx.rule("ou=people,dc=example,dc=com", "people", |b| {
            b.targetattr("*")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        fx.load(BASE);

        let mut op = fx.begin(fx.user("uid=alice,dc=example,dc=com"), modify_op());
        let inside = fx.entry("uid=bob,ou=people,dc=example,dc=com");
        let outside = fx.entry("ou=groups,dc=example,dc=com");
        assert!(op
            .access_allowed(&inside, Some("cn"), None, AccessRights::READ)
            .is_success());
        assert!(!op
            .access_allowed(&outside, Some("cn"), None, AccessRights::READ)
            .is_success());
    }

    #[test]
    fn test_target_and_negated_target() {
        let fx = setup_engine(AclConfig::default());
        fx.rule(BASE, "not-admins", |b| {
            b.target_not("ou=admins,dc=example,dc=com")
                .targetattr("*")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        fx.load(BASE);

        let mut op = fx.begin(fx.user("uid=alice,dc=example,dc=com"), modify_op());
        assert!(op
            .access_allowed(&fx.entry("uid=x,ou=people,dc=example,dc=com"), Some("cn"), None, AccessRights::READ)
            .is_success());
        assert!(!op
            .access_allowed(&fx.entry("uid=y,ou=admins,dc=example,dc=com"), Some("cn"), None, AccessRights::READ)
            .is_success());
    }

    #[test]
    fn test_targetfilter() {
        let fx = setup_engine(AclConfig::default());
        fx.rule(BASE, "people-only", |b| {
            b.targetfilter("(objectclass=person)")
                .targetattr("*")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        fx.load(BASE);

        let mut op = fx.begin(fx.user("uid=alice,dc=example,dc=com"), modify_op());
        let person = fx
            .entry("uid=bob,dc=example,dc=com")
            .with_value("objectclass", "person");
        let device = fx
            .entry("cn=printer,dc=example,dc=com")
            .with_value("objectclass", "device");
        assert!(op
            .access_allowed(&person, Some("cn"), None, AccessRights::READ)
            .is_success());
        assert!(!op
            .access_allowed(&device, Some("cn"), None, AccessRights::READ)
            .is_success());
    }

    #[test]
    fn test_macro_target_captures_entry_dn() {
        let fx = setup_engine(AclConfig::default());
        fx.rule(BASE, "macro", |b| {
            b.target("uid=*,ou=($dn),dc=example,dc=com")
                .targetattr("*")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        fx.load(BASE);

        let mut op = fx.begin(fx.user("uid=alice,dc=example,dc=com"), modify_op());
        let sales = fx.entry("uid=bob,ou=sales,dc=example,dc=com");
        assert!(op
            .access_allowed(&sales, Some("cn"), None, AccessRights::READ)
            .is_success());
        let top = fx.entry("cn=config,dc=example,dc=com");
        assert!(!op
            .access_allowed(&top, Some("cn"), None, AccessRights::READ)
            .is_success());
    }

    #[test]
    fn test_value_filters_on_modify() {
        let fx = setup_engine(AclConfig::default());
        fx.rule(BASE, "titles", |b| {
            b.add_attr_filters("title:(title=engineer*)").allow(
                AccessRights::WRITE,
                SubjectExpr::userdn("ldap:///all"),
            )
        });
        fx.load(BASE);

        let mut op = fx.begin(fx.user("uid=alice,dc=example,dc=com"), modify_op());
        let bob = fx.entry("uid=bob,dc=example,dc=com");
        assert!(op
            .access_allowed(&bob, Some("title"), Some("Engineer II"), AccessRights::WRITE_ADD)
            .is_success());
        assert!(!op
            .access_allowed(&bob, Some("title"), Some("Manager"), AccessRights::WRITE_ADD)
            .is_success());
        // Without a targetattr the rule says nothing about other attributes.
        assert!(!op
            .access_allowed(&bob, Some("mail"), Some("b@example.com"), AccessRights::WRITE_ADD)
            .is_success());
    }

    #[test]
    fn test_entry_filters_on_add() {
        let fx = setup_engine(AclConfig::default());
        fx.rule(BASE, "add-staff", |b| {
            b.add_attr_filters("employeetype:(employeetype=staff)")
                .allow(AccessRights::ADD, SubjectExpr::userdn("ldap:///all"))
        });
        fx.load(BASE);

        let mut op = fx.begin(
            fx.user("uid=alice,dc=example,dc=com"),
            OperationInfo::new(1, 1, OperationKind::Add),
        );
        let staff = fx
            .entry("uid=s,dc=example,dc=com")
            .with_value("employeetype", "staff");
        let contractor = fx
            .entry("uid=c,dc=example,dc=com")
            .with_values("employeetype", ["staff", "contractor"]);
        assert!(op
            .access_allowed(&staff, None, None, AccessRights::ADD)
            .is_success());
        assert!(!op
            .access_allowed(&contractor, None, None, AccessRights::ADD)
            .is_success());
    }

    #[test]
    fn test_targetattr_star_and_named_rules() {
        let fx = setup_engine(AclConfig::default());
        fx.rule(BASE, "uid", |b| {
            b.targetattr("uid")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        fx.rule(BASE, "star", |b| {
            b.targetattr("*")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        fx.load(BASE);

        let mut op = fx.begin(
            fx.user("uid=alice,dc=example,dc=com"),
            OperationInfo::new(1, 1, OperationKind::Search),
        );
        let bob = fx.entry("uid=bob,dc=example,dc=com").with_value("uid", "bob");
        assert!(op
            .access_allowed(&bob, Some("uid"), None, AccessRights::READ)
            .is_success());
        // A named rule was seen, so the star shortcut is not safe.
        assert!(op.state().contains(ContextState::FOUND_ATTR_RULE));
        assert!(!op.state().contains(ContextState::ATTR_STAR_MATCHED));
    }
}

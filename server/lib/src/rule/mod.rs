//! Parsed access control rules.
//!
//! A [`RuleRecord`] is immutable once built. The text grammar lives outside
//! this crate: a [`RuleParser`] turns the raw value of an `aci` attribute into
//! a record, usually by way of [`RuleBuilder`], which derives the rule class,
//! type and tier from the parts it is given.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::prelude::*;

mod subject;
mod target;

pub use self::subject::{Comparator, SubjectAtom, SubjectExpr, SubjectKind, Tier, TIER_COUNT};
pub use self::target::{AttrFilter, AttrMatcher, Target, TargetAttrs, TargetFilter, TargetKind};

static NEXT_RULE_ID: AtomicU64 = AtomicU64::new(1);

/// Process wide, strictly increasing identity of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u64);

impl RuleId {
    fn next() -> Self {
        RuleId(NEXT_RULE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Shape of a rule. Used when choosing fast paths and when deciding
    /// whether a rule may be summarised for anonymous access.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RuleType: u32 {
        const TARGET_DN = 0x0001;
        const TARGET_PATTERN = 0x0002;
        const TARGET_MACRO = 0x0004;
        const TARGET_NOT = 0x0008;
        const TARGET_ATTR = 0x0010;
        const TARGET_ATTR_NOT = 0x0020;
        const TARGET_FILTER = 0x0040;
        const TARGET_FILTER_NOT = 0x0080;
        const TARGET_FILTER_MACRO = 0x0100;
        const ADD_ATTR_FILTERS = 0x0200;
        const DEL_ATTR_FILTERS = 0x0400;
        const ALLOW = 0x1000;
        const DENY = 0x2000;
        const SUBJECT_MACRO = 0x4000;
    }
}

bitflags::bitflags! {
    /// Which predicate kinds a rule's subject contains.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RuleClass: u32 {
        const USERDN = 0x0000_0001;
        const USERDNATTR = 0x0000_0002;
        const GROUPDN = 0x0000_0004;
        const GROUPDNATTR = 0x0000_0008;
        const ROLEDN = 0x0000_0010;
        const USERATTR = 0x0000_0020;
        const IP = 0x0000_0040;
        const DNS = 0x0000_0080;
        const TIMEOFDAY = 0x0000_0100;
        const DAYOFWEEK = 0x0000_0200;
        const AUTHMETHOD = 0x0000_0400;
        const SSF = 0x0000_0800;
        const SELF_RULE = 0x0000_1000;
        const PARAM = 0x0000_2000;
        const NOT_USERDN = 0x0000_4000;
        const NOT_GROUPDN = 0x0000_8000;
        const NOT_ROLEDN = 0x0001_0000;
        const ANYONE = 0x0002_0000;
        /// `userdn = "ldap:///parent"`.
        const PARENT = 0x0004_0000;

        /// Results depend on the target entry, so they can not be reused for
        /// another entry or attribute.
        const ENTRY_RELATIVE = Self::USERDNATTR.bits()
            | Self::GROUPDNATTR.bits()
            | Self::USERATTR.bits()
            | Self::PARAM.bits()
            | Self::SELF_RULE.bits()
            | Self::PARENT.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    Allow,
    Deny,
}

/// One `allow (rights) subject;` or `deny (rights) subject;` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub kind: ClauseKind,
    pub rights: AccessRights,
    pub subject: SubjectExpr,
}

impl Clause {
    /// Whether this clause speaks about the requested access. A clause
    /// granting `write` covers per value writes. A `selfwrite` clause carries
    /// the write bit too, but only covers requests carrying the self bit.
    pub fn covers(&self, access: AccessRights) -> bool {
        let wanted = access.normalise() & (AccessRights::ALL | AccessRights::PROXY);
        // `all` names every right, plain write included.
        if self.rights.contains(AccessRights::ALL) {
            return self.rights.intersects(wanted);
        }
        if wanted.contains(AccessRights::SELF) {
            return self.rights.contains(AccessRights::SELF);
        }
        let granted = if self.rights.contains(AccessRights::SELF) {
            self.rights - (AccessRights::SELF | AccessRights::WRITE)
        } else {
            self.rights
        };
        granted.intersects(wanted)
    }
}

#[derive(Debug, Clone)]
pub struct RuleRecord {
    pub id: RuleId,
    pub name: String,
    /// The entry holding the rule value.
    pub owner: Dn,
    /// The raw value, used when removing rules by value.
    pub text: String,
    pub target: Option<Target>,
    pub target_attrs: Option<TargetAttrs>,
    pub target_filter: Option<TargetFilter>,
    pub add_attr_filters: Vec<AttrFilter>,
    pub del_attr_filters: Vec<AttrFilter>,
    pub clauses: Vec<Clause>,
    pub rule_type: RuleType,
    pub class: RuleClass,
    pub tier: Tier,
    pub allow_rights: AccessRights,
    pub deny_rights: AccessRights,
}

impl RuleRecord {
    pub fn builder(owner: &Dn, name: &str) -> RuleBuilder {
        RuleBuilder::new(owner, name)
    }

    pub fn rights(&self) -> AccessRights {
        self.allow_rights | self.deny_rights
    }

    pub fn is_allow(&self) -> bool {
        self.rule_type.contains(RuleType::ALLOW)
    }

    pub fn is_deny(&self) -> bool {
        self.rule_type.contains(RuleType::DENY)
    }

    pub fn is_entry_relative(&self) -> bool {
        self.class.intersects(RuleClass::ENTRY_RELATIVE)
    }

    pub fn clauses_for(
        &self,
        kind: ClauseKind,
        access: AccessRights,
    ) -> impl Iterator<Item = &Clause> {
        self.clauses
            .iter()
            .filter(move |c| c.kind == kind && c.covers(access))
    }

    /// The same rule, owned by `new` instead of `old`. Target DNs at or below
    /// `old` are moved along with it. The id is kept so cached handles stay
    /// valid.
    pub fn relocated(&self, old: &Dn, new: &Dn) -> RuleRecord {
        let mut r = self.clone();
        if let Some(owner) = r.owner.rebase(old, new) {
            r.owner = owner;
        }
        if let Some(Target {
            kind: TargetKind::Dn(ref mut dn),
            ..
        }) = r.target
        {
            if let Some(moved) = dn.rebase(old, new) {
                *dn = moved;
            }
        }
        r
    }
}

impl fmt::Display for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" ({}) at {}", self.name, self.id, self.owner)
    }
}

/// Assembles a [`RuleRecord`] and derives the computed fields.
pub struct RuleBuilder {
    owner: Dn,
    name: String,
    text: Option<String>,
    target: Option<Result<Target, RuleSyntaxError>>,
    target_attrs: Option<Result<TargetAttrs, RuleSyntaxError>>,
    target_filter: Option<Result<TargetFilter, RuleSyntaxError>>,
    add_attr_filters: Result<Vec<AttrFilter>, RuleSyntaxError>,
    del_attr_filters: Result<Vec<AttrFilter>, RuleSyntaxError>,
    clauses: Vec<Clause>,
}

impl RuleBuilder {
    fn new(owner: &Dn, name: &str) -> Self {
        RuleBuilder {
            owner: owner.clone(),
            name: name.to_string(),
            text: None,
            target: None,
            target_attrs: None,
            target_filter: None,
            add_attr_filters: Ok(Vec::new()),
            del_attr_filters: Ok(Vec::new()),
            clauses: Vec::new(),
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn target(mut self, dn: &str) -> Self {
        self.target = Some(Target::parse(dn, false));
        self
    }

    pub fn target_not(mut self, dn: &str) -> Self {
        self.target = Some(Target::parse(dn, true));
        self
    }

    pub fn targetattr(mut self, attrs: &str) -> Self {
        self.target_attrs = Some(TargetAttrs::parse(attrs, false));
        self
    }

    pub fn targetattr_not(mut self, attrs: &str) -> Self {
        self.target_attrs = Some(TargetAttrs::parse(attrs, true));
        self
    }

    pub fn targetfilter(mut self, filter: &str) -> Self {
        self.target_filter = Some(TargetFilter::parse(filter, false));
        self
    }

    pub fn targetfilter_not(mut self, filter: &str) -> Self {
        self.target_filter = Some(TargetFilter::parse(filter, true));
        self
    }

    pub fn add_attr_filters(mut self, list: &str) -> Self {
        self.add_attr_filters = AttrFilter::parse_list(list);
        self
    }

    pub fn del_attr_filters(mut self, list: &str) -> Self {
        self.del_attr_filters = AttrFilter::parse_list(list);
        self
    }

    pub fn allow(mut self, rights: AccessRights, subject: SubjectExpr) -> Self {
        self.clauses.push(Clause {
            kind: ClauseKind::Allow,
            rights,
            subject,
        });
        self
    }

    pub fn deny(mut self, rights: AccessRights, subject: SubjectExpr) -> Self {
        self.clauses.push(Clause {
            kind: ClauseKind::Deny,
            rights,
            subject,
        });
        self
    }

    pub fn build(self) -> Result<RuleRecord, RuleSyntaxError> {
        let target = self.target.transpose()?;
        let target_attrs = self.target_attrs.transpose()?;
        let target_filter = self.target_filter.transpose()?;
        let add_attr_filters = self.add_attr_filters?;
        let del_attr_filters = self.del_attr_filters?;

        if self.clauses.is_empty() {
            return Err(RuleSyntaxError::Syntax);
        }

        let mut rule_type = RuleType::empty();
        let mut class = RuleClass::empty();
        let mut tier = Tier::Default;
        let mut allow_rights = AccessRights::empty();
        let mut deny_rights = AccessRights::empty();
        let mut authmethods = 0;

        for clause in &self.clauses {
            if clause.rights.is_empty()
                || !(AccessRights::ALL | AccessRights::PROXY).contains(clause.rights)
            {
                return Err(RuleSyntaxError::InvalidAuthorization);
            }
            match clause.kind {
                ClauseKind::Allow => {
                    rule_type |= RuleType::ALLOW;
                    allow_rights |= clause.rights;
                }
                ClauseKind::Deny => {
                    rule_type |= RuleType::DENY;
                    deny_rights |= clause.rights;
                }
            }
            let mut clause_authmethods = 0;
            for atom in clause.subject.atoms() {
                class |= atom_class(atom);
                tier = tier.min(atom.tier());
                if atom.has_macro() {
                    rule_type |= RuleType::SUBJECT_MACRO;
                }
                if atom.kind == SubjectKind::AuthMethod {
                    clause_authmethods += 1;
                }
                if atom.op.is_ordering()
                    && !matches!(atom.kind, SubjectKind::Ssf | SubjectKind::TimeOfDay)
                {
                    return Err(RuleSyntaxError::Syntax);
                }
            }
            authmethods = authmethods.max(clause_authmethods);
        }
        if authmethods > 1 {
            return Err(RuleSyntaxError::InvalidAuthMethod);
        }

        if let Some(t) = &target {
            rule_type |= match &t.kind {
                TargetKind::Dn(dn) => {
                    if !self.owner.is_suffix_of(dn) {
                        return Err(RuleSyntaxError::InvalidTarget);
                    }
                    RuleType::TARGET_DN
                }
                TargetKind::Pattern(_) => RuleType::TARGET_PATTERN,
                TargetKind::Macro(_) => RuleType::TARGET_MACRO,
            };
            if t.negated {
                rule_type |= RuleType::TARGET_NOT;
            }
        }

        // A subject placeholder needs a macro target to capture a value from.
        let uses_dn_macro = self
            .clauses
            .iter()
            .flat_map(|c| c.subject.atoms())
            .any(|a| crate::subject::macros::has_dn_macro(&a.value));
        let target_is_macro = target.as_ref().map(|t| t.is_macro()).unwrap_or(false);
        if uses_dn_macro && !target_is_macro {
            return Err(RuleSyntaxError::Syntax);
        }

        if let Some(ta) = &target_attrs {
            rule_type |= RuleType::TARGET_ATTR;
            if ta.negated {
                rule_type |= RuleType::TARGET_ATTR_NOT;
            }
        }
        if let Some(tf) = &target_filter {
            rule_type |= RuleType::TARGET_FILTER;
            if tf.negated {
                rule_type |= RuleType::TARGET_FILTER_NOT;
            }
            if tf.is_macro() {
                if !target_is_macro {
                    return Err(RuleSyntaxError::TargetFilterParse);
                }
                rule_type |= RuleType::TARGET_FILTER_MACRO;
            }
        }
        if !add_attr_filters.is_empty() {
            rule_type |= RuleType::ADD_ATTR_FILTERS;
        }
        if !del_attr_filters.is_empty() {
            rule_type |= RuleType::DEL_ATTR_FILTERS;
        }

        Ok(RuleRecord {
            id: RuleId::next(),
            text: self.text.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            owner: self.owner,
            target,
            target_attrs,
            target_filter,
            add_attr_filters,
            del_attr_filters,
            clauses: self.clauses,
            rule_type,
            class,
            tier,
            allow_rights,
            deny_rights,
        })
    }
}

fn atom_class(atom: &SubjectAtom) -> RuleClass {
    let negated = atom.op == Comparator::Ne;
    let lower = atom.value.to_lowercase();
    let mut class = match atom.kind {
        SubjectKind::UserDn => {
            let mut c = RuleClass::USERDN;
            if lower.contains("ldap:///self") {
                c |= RuleClass::SELF_RULE;
            }
            if lower.contains("ldap:///parent") {
                c |= RuleClass::PARENT;
            }
            if lower.contains("ldap:///anyone") && !negated {
                c |= RuleClass::ANYONE;
            }
            if negated {
                c |= RuleClass::NOT_USERDN;
            }
            c
        }
        SubjectKind::GroupDn if negated => RuleClass::GROUPDN | RuleClass::NOT_GROUPDN,
        SubjectKind::GroupDn => RuleClass::GROUPDN,
        SubjectKind::RoleDn if negated => RuleClass::ROLEDN | RuleClass::NOT_ROLEDN,
        SubjectKind::RoleDn => RuleClass::ROLEDN,
        SubjectKind::UserDnAttr => RuleClass::USERDNATTR,
        SubjectKind::GroupDnAttr => RuleClass::GROUPDNATTR,
        SubjectKind::UserAttr => RuleClass::USERATTR,
        SubjectKind::Ip => RuleClass::IP,
        SubjectKind::Dns => RuleClass::DNS,
        SubjectKind::TimeOfDay => RuleClass::TIMEOFDAY,
        SubjectKind::DayOfWeek => RuleClass::DAYOFWEEK,
        SubjectKind::AuthMethod => RuleClass::AUTHMETHOD,
        SubjectKind::Ssf => RuleClass::SSF,
    };
    if atom.has_macro() {
        class |= RuleClass::PARAM;
    }
    class
}

/// Turns the raw text of a rule value into a record. Implemented by the
/// server embedding the engine.
pub trait RuleParser: Send + Sync {
    fn parse(&self, owner: &Dn, text: &str) -> Result<RuleRecord, RuleSyntaxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Dn {
        Dn::new("dc=example,dc=com").unwrap()
    }

    #[test]
    fn test_rule_derived_fields() {
        let r = RuleRecord::builder(&base(), "mixed")
            .targetattr("cn || sn")
            .deny(
                AccessRights::WRITE,
                SubjectExpr::atom(SubjectKind::UserDn, Comparator::Ne, "ldap:///self"),
            )
            .allow(
                AccessRights::READ | AccessRights::SEARCH,
                SubjectExpr::groupdn("ldap:///cn=admins,dc=example,dc=com")
                    .or(SubjectExpr::userdn("ldap:///anyone")),
            )
            .build()
            .unwrap();
        assert!(r.is_allow() && r.is_deny());
        assert_eq!(r.tier, Tier::Anyone);
        assert!(r.class.contains(RuleClass::SELF_RULE | RuleClass::NOT_USERDN));
        assert!(r.class.contains(RuleClass::ANYONE | RuleClass::GROUPDN));
        assert!(r.is_entry_relative());
        assert_eq!(r.deny_rights, AccessRights::WRITE);
        assert!(r.rule_type.contains(RuleType::TARGET_ATTR));
        assert_eq!(
            r.clauses_for(ClauseKind::Allow, AccessRights::READ).count(),
            1
        );
        assert_eq!(
            r.clauses_for(ClauseKind::Deny, AccessRights::WRITE_ADD).count(),
            1
        );
        assert_eq!(
            r.clauses_for(ClauseKind::Deny, AccessRights::READ).count(),
            0
        );
    }

    #[test]
    fn test_rule_parent_is_entry_relative() {
        let parent = RuleRecord::builder(&base(), "parent")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///parent"))
            .build()
            .unwrap();
        assert!(parent.class.contains(RuleClass::USERDN | RuleClass::PARENT));
        assert!(parent.is_entry_relative());

        let plain = RuleRecord::builder(&base(), "plain")
            .allow(
                AccessRights::READ,
                SubjectExpr::userdn("ldap:///uid=bob,dc=example,dc=com"),
            )
            .build()
            .unwrap();
        assert!(!plain.is_entry_relative());
    }

    #[test]
    fn test_rule_ids_increase() {
        let a = RuleRecord::builder(&base(), "a")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
            .build()
            .unwrap();
        let b = RuleRecord::builder(&base(), "b")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
            .build()
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.tier, Tier::All);
    }

    #[test]
    fn test_rule_validation_errors() {
        let outside = RuleRecord::builder(&base(), "x")
            .target("dc=other,dc=com")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
            .build();
        assert_eq!(outside.err(), Some(RuleSyntaxError::InvalidTarget));

        let no_clause = RuleRecord::builder(&base(), "x").build();
        assert_eq!(no_clause.err(), Some(RuleSyntaxError::Syntax));

        let no_rights = RuleRecord::builder(&base(), "x")
            .allow(AccessRights::empty(), SubjectExpr::userdn("ldap:///all"))
            .build();
        assert_eq!(no_rights.err(), Some(RuleSyntaxError::InvalidAuthorization));

        let two_methods = RuleRecord::builder(&base(), "x")
            .allow(
                AccessRights::READ,
                SubjectExpr::atom(SubjectKind::AuthMethod, Comparator::Eq, "simple").and(
                    SubjectExpr::atom(SubjectKind::AuthMethod, Comparator::Eq, "ssl"),
                ),
            )
            .build();
        assert_eq!(two_methods.err(), Some(RuleSyntaxError::InvalidAuthMethod));

        let dangling_macro = RuleRecord::builder(&base(), "x")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///cn=x,($dn)"))
            .build();
        assert_eq!(dangling_macro.err(), Some(RuleSyntaxError::Syntax));

        let bad_filter = RuleRecord::builder(&base(), "x")
            .targetfilter("(cn=")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
            .build();
        assert_eq!(bad_filter.err(), Some(RuleSyntaxError::TargetFilterParse));
    }

    #[test]
    fn test_rule_macro_class() {
        let r = RuleRecord::builder(&base(), "macro")
            .target("ou=($dn),dc=example,dc=com")
            .allow(
                AccessRights::READ,
                SubjectExpr::groupdn("ldap:///cn=admins,ou=($dn),dc=example,dc=com"),
            )
            .build()
            .unwrap();
        assert!(r.class.contains(RuleClass::PARAM));
        assert!(r.is_entry_relative());
        assert!(r
            .rule_type
            .contains(RuleType::TARGET_MACRO | RuleType::SUBJECT_MACRO));
    }

    #[test]
    fn test_rule_relocated() {
        let old = Dn::new("ou=people,dc=example,dc=com").unwrap();
        let new = Dn::new("ou=staff,dc=example,dc=com").unwrap();
        let r = RuleRecord::builder(&old, "moved")
            .target("ou=contractors,ou=people,dc=example,dc=com")
            .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
            .build()
            .unwrap();
        let m = r.relocated(&old, &new);
        assert_eq!(m.id, r.id);
        assert_eq!(m.owner, new);
        match &m.target.as_ref().unwrap().kind {
            TargetKind::Dn(dn) => {
                assert_eq!(dn.as_str(), "ou=contractors,ou=staff,dc=example,dc=com")
            }
            _ => panic!("expected dn target"),
        }
    }
}

//! The subject side of a rule: a boolean expression over predicate atoms.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::subject::macros;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    UserDn,
    GroupDn,
    RoleDn,
    UserDnAttr,
    GroupDnAttr,
    UserAttr,
    Ip,
    Dns,
    TimeOfDay,
    DayOfWeek,
    AuthMethod,
    Ssf,
}

impl SubjectKind {
    pub fn keyword(self) -> &'static str {
        match self {
            SubjectKind::UserDn => "userdn",
            SubjectKind::GroupDn => "groupdn",
            SubjectKind::RoleDn => "roledn",
            SubjectKind::UserDnAttr => "userdnattr",
            SubjectKind::GroupDnAttr => "groupdnattr",
            SubjectKind::UserAttr => "userattr",
            SubjectKind::Ip => "ip",
            SubjectKind::Dns => "dns",
            SubjectKind::TimeOfDay => "timeofday",
            SubjectKind::DayOfWeek => "dayofweek",
            SubjectKind::AuthMethod => "authmethod",
            SubjectKind::Ssf => "ssf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }

    pub fn is_ordering(self) -> bool {
        !matches!(self, Comparator::Eq | Comparator::Ne)
    }

    /// Apply an ordering comparator to `lhs op rhs`.
    pub fn compare<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectAtom {
    pub kind: SubjectKind,
    pub op: Comparator,
    /// The value as written, without the surrounding quotes.
    pub value: String,
}

impl SubjectAtom {
    pub fn new(kind: SubjectKind, op: Comparator, value: &str) -> Self {
        SubjectAtom {
            kind,
            op,
            value: value.trim().to_string(),
        }
    }

    pub fn has_macro(&self) -> bool {
        macros::has_any_macro(&self.value)
    }

    /// The tier this atom would place a rule in.
    pub fn tier(&self) -> Tier {
        match self.kind {
            SubjectKind::UserDn => {
                let v = self.value.to_lowercase();
                if v.contains("ldap:///anyone") {
                    Tier::Anyone
                } else if v.contains("ldap:///all") {
                    Tier::All
                } else {
                    Tier::UserDn
                }
            }
            SubjectKind::UserDnAttr | SubjectKind::UserAttr => Tier::UserDnAttr,
            SubjectKind::GroupDnAttr => {
                if crate::filter::ldapurl::is_ldap_url(&self.value) {
                    Tier::GroupDnAttrUrl
                } else {
                    Tier::GroupDnAttr
                }
            }
            SubjectKind::GroupDn => Tier::GroupDn,
            _ => Tier::Default,
        }
    }
}

impl fmt::Display for SubjectAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}\"{}\"",
            self.kind.keyword(),
            self.op.as_str(),
            self.value
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectExpr {
    Atom(SubjectAtom),
    And(Vec<SubjectExpr>),
    Or(Vec<SubjectExpr>),
    Not(Box<SubjectExpr>),
}

impl SubjectExpr {
    pub fn atom(kind: SubjectKind, op: Comparator, value: &str) -> Self {
        SubjectExpr::Atom(SubjectAtom::new(kind, op, value))
    }

    pub fn userdn(value: &str) -> Self {
        Self::atom(SubjectKind::UserDn, Comparator::Eq, value)
    }

    pub fn groupdn(value: &str) -> Self {
        Self::atom(SubjectKind::GroupDn, Comparator::Eq, value)
    }

    pub fn and(self, other: SubjectExpr) -> Self {
        match self {
            SubjectExpr::And(mut v) => {
                v.push(other);
                SubjectExpr::And(v)
            }
            s => SubjectExpr::And(vec![s, other]),
        }
    }

    pub fn or(self, other: SubjectExpr) -> Self {
        match self {
            SubjectExpr::Or(mut v) => {
                v.push(other);
                SubjectExpr::Or(v)
            }
            s => SubjectExpr::Or(vec![s, other]),
        }
    }

    pub fn negate(self) -> Self {
        SubjectExpr::Not(Box::new(self))
    }

    pub fn atoms(&self) -> Vec<&SubjectAtom> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a SubjectAtom>) {
        match self {
            SubjectExpr::Atom(a) => out.push(a),
            SubjectExpr::And(v) | SubjectExpr::Or(v) => {
                v.iter().for_each(|e| e.collect_atoms(out));
            }
            SubjectExpr::Not(e) => e.collect_atoms(out),
        }
    }

    /// Depth of boolean operators above the atoms. A bare atom is depth 0.
    pub fn depth(&self) -> usize {
        match self {
            SubjectExpr::Atom(_) => 0,
            SubjectExpr::And(v) | SubjectExpr::Or(v) => {
                1 + v.iter().map(|e| e.depth()).max().unwrap_or(0)
            }
            SubjectExpr::Not(e) => 1 + e.depth(),
        }
    }
}

impl fmt::Display for SubjectExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectExpr::Atom(a) => write!(f, "{}", a),
            SubjectExpr::And(v) | SubjectExpr::Or(v) => {
                let sep = if matches!(self, SubjectExpr::And(_)) {
                    " and "
                } else {
                    " or "
                };
                f.write_str("(")?;
                for (i, e) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str(")")
            }
            SubjectExpr::Not(e) => write!(f, "not {}", e),
        }
    }
}

/// Evaluation order of rules inside a candidate set. Lower tiers are cheap
/// and selective, so they are tried first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Tier {
    Anyone = 0,
    All = 1,
    UserDn = 2,
    UserDnAttr = 3,
    GroupDnAttrUrl = 4,
    GroupDnAttr = 5,
    GroupDn = 6,
    Default = 7,
}

pub const TIER_COUNT: usize = 8;

impl Tier {
    pub fn slot(self) -> usize {
        u8::from(self) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_atom_tiers() {
        let a = SubjectAtom::new(SubjectKind::UserDn, Comparator::Eq, "ldap:///anyone");
        assert_eq!(a.tier(), Tier::Anyone);
        let a = SubjectAtom::new(SubjectKind::UserDn, Comparator::Eq, "ldap:///all");
        assert_eq!(a.tier(), Tier::All);
        let a = SubjectAtom::new(SubjectKind::UserDn, Comparator::Eq, "ldap:///uid=a,dc=com");
        assert_eq!(a.tier(), Tier::UserDn);
        let a = SubjectAtom::new(
            SubjectKind::GroupDnAttr,
            Comparator::Eq,
            "ldap:///dc=com?manager",
        );
        assert_eq!(a.tier(), Tier::GroupDnAttrUrl);
        let a = SubjectAtom::new(SubjectKind::GroupDnAttr, Comparator::Eq, "owner");
        assert_eq!(a.tier(), Tier::GroupDnAttr);
        let a = SubjectAtom::new(SubjectKind::Ssf, Comparator::Ge, "128");
        assert_eq!(a.tier(), Tier::Default);
        assert_eq!(Tier::try_from(6u8).ok(), Some(Tier::GroupDn));
    }

    #[test]
    fn test_subject_expr_shape() {
        let e = SubjectExpr::userdn("ldap:///self")
            .or(SubjectExpr::groupdn("ldap:///cn=admins,dc=com"))
            .and(SubjectExpr::atom(SubjectKind::Ssf, Comparator::Ge, "56").negate());
        assert_eq!(e.atoms().len(), 3);
        assert_eq!(e.depth(), 2);
        assert_eq!(SubjectExpr::userdn("ldap:///anyone").depth(), 0);
        assert_eq!(
            SubjectExpr::userdn("ldap:///anyone").to_string(),
            "userdn=\"ldap:///anyone\""
        );
        assert!(Comparator::Ge.compare(128, 56));
        assert!(!Comparator::Lt.compare(128, 56));
    }
}

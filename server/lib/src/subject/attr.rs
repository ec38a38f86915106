//! Subjects derived from attribute values of the target entry: `userdnattr`
//! and `userattr`.

use super::{entry_at_level, parse_inheritance, role, SubjectContext, Truth};
use crate::dn;
use crate::filter::LdapUrl;
use crate::prelude::*;

/// `userdnattr="manager"` or `userdnattr="parent[0,1].manager"`: the
/// principal's DN is a value of the attribute on the entry, or on one of the
/// listed ancestors.
pub(super) fn evaluate_userdnattr(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    let Some(client) = ctx.principal.dn() else {
        return Truth::False;
    };
    let Some((levels, attr)) = parse_inheritance(value) else {
        subject_error!(%value, "userdnattr value is invalid");
        return Truth::False;
    };
    Truth::any(levels.into_iter().map(|level| match entry_at_level(ctx, level) {
        Ok(Some(e)) => Truth::from_bool(e.has_dn_value(&attr, client)),
        Ok(None) => Truth::False,
        Err(e) => {
            subject_warn!(?e, level, "unable to fetch ancestor for userdnattr");
            Truth::Undefined
        }
    }))
}

#[derive(Debug, PartialEq, Eq)]
enum BindType {
    UserDn,
    GroupDn,
    RoleDn,
    LdapUrl,
    Value(String),
}

/// `userattr="attr#BINDTYPE"`. The bind types USERDN and GROUPDN accept the
/// `parent[...]` inheritance form. Any other bind type is a literal value that
/// both the target entry and the principal's entry must hold.
pub(super) fn evaluate_userattr(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    let Some(client) = ctx.principal.dn() else {
        return Truth::False;
    };
    let Some((spec, bind)) = value.rsplit_once('#') else {
        subject_error!(%value, "userattr value has no bind type");
        return Truth::False;
    };
    let bind = match bind.trim().to_uppercase().as_str() {
        "USERDN" => BindType::UserDn,
        "GROUPDN" => BindType::GroupDn,
        "ROLEDN" => BindType::RoleDn,
        "LDAPURL" => BindType::LdapUrl,
        _ => BindType::Value(bind.trim().to_string()),
    };
    let Some((levels, attr)) = parse_inheritance(spec) else {
        subject_error!(%value, "userattr attribute is invalid");
        return Truth::False;
    };
    if levels != [0] && !matches!(bind, BindType::UserDn | BindType::GroupDn) {
        subject_error!(%value, "inheritance is only valid for USERDN and GROUPDN");
        return Truth::False;
    }

    match bind {
        BindType::UserDn => Truth::any(levels.into_iter().map(|level| {
            match entry_at_level(ctx, level) {
                Ok(Some(e)) => Truth::from_bool(e.has_dn_value(&attr, client)),
                Ok(None) => Truth::False,
                Err(_) => Truth::Undefined,
            }
        })),
        BindType::GroupDn => Truth::any(levels.into_iter().map(|level| {
            match entry_at_level(ctx, level) {
                Ok(Some(e)) => Truth::any(
                    e.values(&attr)
                        .iter()
                        .filter_map(|v| dn::normalise_lossy(v))
                        .map(|g| ctx.groups.is_member(ctx, &Dn::from_normalised(g))),
                ),
                Ok(None) => Truth::False,
                Err(_) => Truth::Undefined,
            }
        })),
        BindType::RoleDn => with_client(ctx, |c| {
            Truth::from_bool(
                ctx.entry
                    .values(&attr)
                    .iter()
                    .filter_map(|v| Dn::new(v).ok())
                    .any(|role| role::has_role(c, &role)),
            )
        }),
        BindType::LdapUrl => with_client(ctx, |c| {
            Truth::from_bool(
                ctx.entry
                    .values(&attr)
                    .iter()
                    .filter_map(|v| LdapUrl::parse(v).ok())
                    .any(|u| u.matches_entry(c)),
            )
        }),
        BindType::Value(v) => {
            if !ctx.entry.has_value(&attr, &v) {
                return Truth::False;
            }
            with_client(ctx, |c| Truth::from_bool(c.has_value(&attr, &v)))
        }
    }
}

fn with_client<F>(ctx: &SubjectContext<'_>, f: F) -> Truth
where
    F: FnOnce(&Entry) -> Truth,
{
    match ctx.client_entry() {
        Ok(Some(c)) => f(&c),
        Ok(None) => Truth::False,
        Err(e) => {
            subject_warn!(?e, "unable to fetch client entry for userattr");
            Truth::Undefined
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::rule::{Comparator, SubjectKind};
    use crate::subject::{evaluate_literal, Truth};
    use crate::testkit::*;

    #[test]
    fn test_userdnattr_levels() {
        sketching::test_init();
        let fx = Fixture::new();
        fx.dir.add(
            fx.entry("ou=lab,dc=example,dc=com")
                .with_value("manager", "uid=erin,ou=people,dc=example,dc=com"),
        );
        let erin = fx.user("uid=erin,ou=people,dc=example,dc=com");
        let target = fx
            .entry("cn=scope,ou=lab,dc=example,dc=com")
            .with_value("owner", "UID=Erin,ou=people,dc=example,dc=com");
        let ctx = fx.subject_ctx(&erin, &target);
        let eval = |v: &str| evaluate_literal(&ctx, SubjectKind::UserDnAttr, Comparator::Eq, v);

        assert_eq!(eval("owner"), Truth::True);
        assert_eq!(eval("manager"), Truth::False);
        assert_eq!(eval("parent[1].manager"), Truth::True);
        assert_eq!(eval("parent[0].manager"), Truth::False);
        assert_eq!(eval("parent[bad].manager"), Truth::False);
    }

    #[test]
    fn test_userattr_bind_types() {
        sketching::test_init();
        let fx = Fixture::new();
        fx.dir.add(
            fx.entry("uid=erin,ou=people,dc=example,dc=com")
                .with_value("departmentnumber", "42")
                .with_value("nsroledn", "cn=auditors,dc=example,dc=com"),
        );
        fx.dir.add(fx.group(
            "cn=lab-admins,dc=example,dc=com",
            &["uid=erin,ou=people,dc=example,dc=com"],
        ));
        let erin = fx.user("uid=erin,ou=people,dc=example,dc=com");
        let target = fx
            .entry("cn=scope,ou=lab,dc=example,dc=com")
            .with_value("owner", "uid=erin,ou=people,dc=example,dc=com")
            .with_value("admins", "cn=lab-admins,dc=example,dc=com")
            .with_value("auditrole", "cn=auditors,dc=example,dc=com")
            .with_value("viewers", "ldap:///ou=people,dc=example,dc=com??sub?(departmentnumber=42)")
            .with_value("departmentnumber", "42");
        let ctx = fx.subject_ctx(&erin, &target);
        let eval = |v: &str| evaluate_literal(&ctx, SubjectKind::UserAttr, Comparator::Eq, v);

        assert_eq!(eval("owner#USERDN"), Truth::True);
        assert_eq!(eval("admins#GROUPDN"), Truth::True);
        assert_eq!(eval("auditrole#ROLEDN"), Truth::True);
        assert_eq!(eval("viewers#LDAPURL"), Truth::True);
        assert_eq!(eval("departmentnumber#42"), Truth::True);
        assert_eq!(eval("departmentnumber#7"), Truth::False);
        assert_eq!(eval("parent[1].owner#ROLEDN"), Truth::False);
        assert_eq!(eval("owner"), Truth::False);
    }
}

//! `userdn` subjects: a `||` list of ldap urls naming the principal.

use super::{split_values, SubjectContext, Truth};
use crate::dn;
use crate::filter::{LdapUrl, SubstringPattern};
use crate::prelude::*;

pub(super) fn evaluate(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    Truth::any(split_values(value).map(|url| evaluate_one(ctx, url)))
}

fn evaluate_one(ctx: &SubjectContext<'_>, raw: &str) -> Truth {
    let url = match LdapUrl::parse(raw) {
        Ok(u) => u,
        Err(e) => {
            subject_error!(?e, value = %raw, "userdn value is not an ldap url");
            return Truth::False;
        }
    };
    let base = url.base.to_lowercase();

    let Some(client) = ctx.principal.dn() else {
        // Only "anyone" can name an unauthenticated client.
        return Truth::from_bool(base == SUBJECT_ANYONE);
    };

    match base.as_str() {
        SUBJECT_ANYONE => Truth::True,
        SUBJECT_ALL => Truth::True,
        SUBJECT_SELF => Truth::from_bool(client == ctx.entry.dn()),
        SUBJECT_PARENT => Truth::from_bool(ctx.entry.dn().parent().as_ref() == Some(client)),
        _ if !url.is_plain() => match ctx.client_entry() {
            Ok(Some(e)) => Truth::from_bool(url.matches_entry(&e)),
            Ok(None) => Truth::False,
            Err(e) => {
                subject_warn!(?e, "unable to fetch client entry for userdn url");
                Truth::Undefined
            }
        },
        b if b.contains('*') => {
            let pattern: String = b
                .split(',')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join(",");
            match SubstringPattern::from_wildcard(&pattern) {
                Ok(p) => Truth::from_bool(p.is_match(client.as_str())),
                Err(_) => Truth::False,
            }
        }
        b => match dn::normalise_lossy(b) {
            Some(ndn) => Truth::from_bool(ndn == client.as_str()),
            None => Truth::False,
        },
    }
}

#[cfg(test)]
mod tests {
    use crate::subject::{evaluate_literal, Truth};
    use crate::rule::{Comparator, SubjectKind};
    use crate::testkit::*;

    #[test]
    fn test_userdn_keywords() {
        sketching::test_init();
        let fx = Fixture::new();
        let bob = fx.user("uid=bob,ou=people,dc=example,dc=com");
        let entry = fx.entry("uid=bob,ou=people,dc=example,dc=com");
        let child = fx.entry("cn=device,uid=bob,ou=people,dc=example,dc=com");

        let ctx = fx.subject_ctx(&bob, &entry);
        let eval = |v: &str| evaluate_literal(&ctx, SubjectKind::UserDn, Comparator::Eq, v);
        assert_eq!(eval("ldap:///anyone"), Truth::True);
        assert_eq!(eval("ldap:///all"), Truth::True);
        assert_eq!(eval("ldap:///self"), Truth::True);
        assert_eq!(eval("ldap:///parent"), Truth::False);
        assert_eq!(
            eval("ldap:///uid=alice,dc=example,dc=com || ldap:///UID=Bob, ou=People,dc=example,dc=com"),
            Truth::True
        );
        assert_eq!(eval("ldap:///uid=*,ou=people,dc=example,dc=com"), Truth::True);
        assert_eq!(eval("uid=bob,ou=people,dc=example,dc=com"), Truth::False);
        assert_eq!(
            evaluate_literal(&ctx, SubjectKind::UserDn, Comparator::Ne, "ldap:///self"),
            Truth::False
        );

        let ctx = fx.subject_ctx(&bob, &child);
        assert_eq!(
            evaluate_literal(&ctx, SubjectKind::UserDn, Comparator::Eq, "ldap:///parent"),
            Truth::True
        );
    }

    #[test]
    fn test_userdn_anonymous() {
        sketching::test_init();
        let fx = Fixture::new();
        let anon = crate::identity::Principal::anonymous();
        let entry = fx.entry("uid=bob,ou=people,dc=example,dc=com");
        let ctx = fx.subject_ctx(&anon, &entry);
        let eval = |v: &str| evaluate_literal(&ctx, SubjectKind::UserDn, Comparator::Eq, v);
        assert_eq!(eval("ldap:///anyone"), Truth::True);
        assert_eq!(eval("ldap:///all"), Truth::False);
        assert_eq!(eval("ldap:///self"), Truth::False);
    }

    #[test]
    fn test_userdn_url_filter() {
        sketching::test_init();
        let fx = Fixture::new();
        fx.dir.add(
            fx.entry("uid=carol,ou=people,dc=example,dc=com")
                .with_value("departmentnumber", "42"),
        );
        let carol = fx.user("uid=carol,ou=people,dc=example,dc=com");
        let entry = fx.entry("ou=people,dc=example,dc=com");
        let ctx = fx.subject_ctx(&carol, &entry);
        assert_eq!(
            evaluate_literal(
                &ctx,
                SubjectKind::UserDn,
                Comparator::Eq,
                "ldap:///dc=example,dc=com??sub?(departmentnumber=42)"
            ),
            Truth::True
        );
        assert_eq!(
            evaluate_literal(
                &ctx,
                SubjectKind::UserDn,
                Comparator::Eq,
                "ldap:///dc=example,dc=com??sub?(departmentnumber=7)"
            ),
            Truth::False
        );
    }
}

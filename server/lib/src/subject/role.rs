use super::{split_values, SubjectContext, Truth};
use crate::filter::LdapUrl;
use crate::prelude::*;

/// `roledn`: the principal's entry lists the role in `nsrole` (computed) or
/// `nsroledn` (managed).
pub(super) fn evaluate(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    if ctx.principal.dn().is_none() {
        return Truth::False;
    }
    let client = match ctx.client_entry() {
        Ok(Some(e)) => e,
        Ok(None) => return Truth::False,
        Err(e) => {
            subject_warn!(?e, "unable to fetch client entry for roledn");
            return Truth::Undefined;
        }
    };
    Truth::any(split_values(value).map(|raw| {
        match LdapUrl::parse(raw).and_then(|u| u.base_dn()) {
            Ok(role) => Truth::from_bool(has_role(&client, &role)),
            Err(e) => {
                subject_error!(?e, value = %raw, "roledn value is invalid");
                Truth::False
            }
        }
    }))
}

pub(crate) fn has_role(client: &Entry, role: &Dn) -> bool {
    client.has_dn_value(ATTR_NSROLE, role) || client.has_dn_value(ATTR_NSROLEDN, role)
}

#[cfg(test)]
mod tests {
    use crate::rule::{Comparator, SubjectKind};
    use crate::subject::{evaluate_literal, Truth};
    use crate::testkit::*;

    #[test]
    fn test_roledn() {
        sketching::test_init();
        let fx = Fixture::new();
        fx.dir.add(
            fx.entry("uid=dana,ou=people,dc=example,dc=com")
                .with_value("nsroledn", "cn=helpdesk,dc=example,dc=com"),
        );
        let dana = fx.user("uid=dana,ou=people,dc=example,dc=com");
        let ghost = fx.user("uid=ghost,ou=people,dc=example,dc=com");
        let entry = fx.entry("ou=people,dc=example,dc=com");

        let ctx = fx.subject_ctx(&dana, &entry);
        assert_eq!(
            evaluate_literal(
                &ctx,
                SubjectKind::RoleDn,
                Comparator::Eq,
                "ldap:///cn=other,dc=example,dc=com || ldap:///cn=HelpDesk,dc=example,dc=com"
            ),
            Truth::True
        );
        let ctx = fx.subject_ctx(&ghost, &entry);
        assert_eq!(
            evaluate_literal(
                &ctx,
                SubjectKind::RoleDn,
                Comparator::Eq,
                "ldap:///cn=helpdesk,dc=example,dc=com"
            ),
            Truth::False
        );
    }
}

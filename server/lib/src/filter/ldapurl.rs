//! RFC 4516 LDAP urls, as found in rule subjects (`userdn`, `groupdn`,
//! `groupdnattr`) and in the `memberURL` values of dynamic groups.
//!
//! Only the `ldap:///` host-less form carries meaning for access control. A
//! host part is accepted and ignored. The base is kept as text since subjects
//! use wildcard bases (`ldap:///uid=*,dc=example,dc=com`) and keywords such as
//! `ldap:///self` that are not distinguished names.

use std::fmt;

use crate::entry::SearchScope;
use crate::filter::Filter;
use crate::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct LdapUrl {
    pub secure: bool,
    pub base: String,
    pub attrs: Vec<String>,
    pub scope: SearchScope,
    pub filter: Option<Filter>,
}

impl LdapUrl {
    pub fn parse(text: &str) -> Result<Self, OperationError> {
        let err = || OperationError::InvalidLdapUrl(text.to_string());
        let t = text.trim();

        let (secure, rest) = if let Some(r) = strip_prefix_ci(t, "ldap://") {
            (false, r)
        } else if let Some(r) = strip_prefix_ci(t, "ldaps://") {
            (true, r)
        } else {
            return Err(err());
        };

        // Skip the host part.
        let slash = rest.find('/').ok_or_else(err)?;
        let rest = &rest[slash + 1..];

        let mut parts = rest.splitn(5, '?');
        let base = percent_decode(parts.next().unwrap_or("")).ok_or_else(err)?;

        let attrs: Vec<String> = match parts.next() {
            Some(a) if !a.is_empty() => percent_decode(a)
                .ok_or_else(err)?
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let scope = match parts.next().map(|s| s.trim().to_lowercase()) {
            None => SearchScope::Base,
            Some(s) => match s.as_str() {
                "" | "base" => SearchScope::Base,
                "one" | "onelevel" => SearchScope::OneLevel,
                "sub" | "subtree" => SearchScope::Subtree,
                _ => return Err(err()),
            },
        };

        let filter = match parts.next() {
            Some(f) if !f.trim().is_empty() => {
                let decoded = percent_decode(f).ok_or_else(err)?;
                Some(Filter::parse(&decoded).map_err(|_| err())?)
            }
            _ => None,
        };

        Ok(LdapUrl {
            secure,
            base: base.trim().to_string(),
            attrs,
            scope,
            filter,
        })
    }

    pub fn base_dn(&self) -> Result<Dn, OperationError> {
        Dn::new(&self.base)
    }

    /// True when the url carries nothing but a base, so it names a DN rather
    /// than describing a search.
    pub fn is_plain(&self) -> bool {
        self.attrs.is_empty() && self.filter.is_none() && self.scope == SearchScope::Base
    }

    pub fn filter_or_everything(&self) -> Filter {
        self.filter.clone().unwrap_or_else(Filter::everything)
    }

    /// Whether `entry` would be returned by the search this url describes.
    pub fn matches_entry(&self, entry: &Entry) -> bool {
        let Ok(base) = self.base_dn() else {
            return false;
        };
        self.scope.contains(&base, entry.dn())
            && self
                .filter
                .as_ref()
                .map(|f| f.matches(entry))
                .unwrap_or(true)
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:///{}",
            if self.secure { "ldaps" } else { "ldap" },
            self.base
        )?;
        if self.is_plain() {
            return Ok(());
        }
        let scope = match self.scope {
            SearchScope::Base => "base",
            SearchScope::OneLevel => "one",
            SearchScope::Subtree => "sub",
        };
        write!(f, "?{}?{}", self.attrs.join(","), scope)?;
        if let Some(filter) = &self.filter {
            write!(f, "?{}", filter)?;
        }
        Ok(())
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match (s.get(..prefix.len()), s.get(prefix.len()..)) {
        (Some(head), Some(rest)) if head.eq_ignore_ascii_case(prefix) => Some(rest),
        _ => None,
    }
}

pub(crate) fn is_ldap_url(s: &str) -> bool {
    let t = s.trim();
    strip_prefix_ci(t, "ldap://").is_some() || strip_prefix_ci(t, "ldaps://").is_some()
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ldapurl_forms() {
        let u = LdapUrl::parse("ldap:///anyone").unwrap();
        assert_eq!(u.base, "anyone");
        assert!(u.is_plain());

        let u = LdapUrl::parse("LDAP:///dc=example,dc=com??sub?(uid=bob)").unwrap();
        assert_eq!(u.scope, SearchScope::Subtree);
        assert!(u.filter.is_some());
        assert!(!u.is_plain());

        let u = LdapUrl::parse("ldaps://host:636/ou=People,dc=example,dc=com?manager,cn?one")
            .unwrap();
        assert!(u.secure);
        assert_eq!(u.attrs, vec!["manager", "cn"]);
        assert_eq!(u.scope, SearchScope::OneLevel);
        assert_eq!(u.base_dn().unwrap().as_str(), "ou=people,dc=example,dc=com");

        let u = LdapUrl::parse("ldap:///cn=a%20b,dc=com").unwrap();
        assert_eq!(u.base, "cn=a b,dc=com");
    }

    #[test]
    fn test_ldapurl_errors() {
        assert!(LdapUrl::parse("uid=bob,dc=com").is_err());
        assert!(LdapUrl::parse("ldap:///dc=com??weird").is_err());
        assert!(LdapUrl::parse("ldap:///dc=com??sub?(bad").is_err());
        assert!(LdapUrl::parse("ldap:///dc=%zz").is_err());
        // The scheme length falls inside `é`.
        assert!(LdapUrl::parse("cn=josé").is_err());
        assert!(!is_ldap_url("uid=é"));
    }

    #[test]
    fn test_ldapurl_matches_entry() {
        let u = LdapUrl::parse("ldap:///dc=example,dc=com??sub?(objectclass=person)").unwrap();
        let person = Entry::try_new("uid=a,ou=people,dc=example,dc=com")
            .unwrap()
            .with_value("objectclass", "person");
        let elsewhere = Entry::try_new("uid=a,dc=other,dc=com")
            .unwrap()
            .with_value("objectclass", "person");
        assert!(u.matches_entry(&person));
        assert!(!u.matches_entry(&elsewhere));
        assert_eq!(
            u.to_string(),
            "ldap:///dc=example,dc=com??sub?(objectclass=person)"
        );
    }
}

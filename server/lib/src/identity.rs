//! Who is asking, and how they connected.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::context::ConnectionCache;
use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalKind {
    /// The directory manager. Never subject to access control.
    Root,
    /// Operations the server performs on its own behalf.
    Internal,
    Anonymous,
    User(Dn),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Simple,
    Ssl,
    Sasl(String),
}

impl AuthMethod {
    /// Compare with the value of an `authmethod` subject. `none` places no
    /// restriction on how the client bound.
    pub fn satisfies(&self, wanted: &str) -> bool {
        let wanted = wanted.trim().to_lowercase();
        match (self, wanted.as_str()) {
            (_, "none") => true,
            (AuthMethod::Simple, "simple") => true,
            (AuthMethod::Ssl, "ssl") => true,
            (AuthMethod::Sasl(mech), w) => w
                .strip_prefix("sasl")
                .map(|m| m.trim().eq_ignore_ascii_case(mech))
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub auth_method: AuthMethod,
    /// Security strength factor of the connection.
    pub ssf: u32,
    pub client_ip: Option<IpAddr>,
    pub client_dns: Option<String>,
    /// Subject DN of the client certificate, for certificate groups.
    pub client_cert_subject: Option<String>,
    /// Set when this principal is acting through proxied authorisation. The
    /// value is the identity that actually bound.
    pub proxied_by: Option<Dn>,
}

impl Principal {
    fn with_kind(kind: PrincipalKind) -> Self {
        Principal {
            kind,
            auth_method: AuthMethod::None,
            ssf: 0,
            client_ip: None,
            client_dns: None,
            client_cert_subject: None,
            proxied_by: None,
        }
    }

    pub fn root() -> Self {
        Self::with_kind(PrincipalKind::Root)
    }

    pub fn internal() -> Self {
        Self::with_kind(PrincipalKind::Internal)
    }

    pub fn anonymous() -> Self {
        Self::with_kind(PrincipalKind::Anonymous)
    }

    pub fn user(dn: Dn) -> Self {
        let mut p = Self::with_kind(PrincipalKind::User(dn));
        p.auth_method = AuthMethod::Simple;
        p
    }

    pub fn with_auth_method(mut self, m: AuthMethod) -> Self {
        self.auth_method = m;
        self
    }

    pub fn with_ssf(mut self, ssf: u32) -> Self {
        self.ssf = ssf;
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_client_dns(mut self, name: &str) -> Self {
        self.client_dns = Some(name.to_lowercase());
        self
    }

    pub fn with_cert_subject(mut self, subject: &str) -> Self {
        self.client_cert_subject = Some(subject.to_string());
        self
    }

    pub fn proxied_by(mut self, binder: Dn) -> Self {
        self.proxied_by = Some(binder);
        self
    }

    pub fn dn(&self) -> Option<&Dn> {
        match &self.kind {
            PrincipalKind::User(dn) => Some(dn),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == PrincipalKind::Anonymous
    }

    /// Root and internal operations skip access control entirely.
    pub fn bypasses_access(&self) -> bool {
        matches!(self.kind, PrincipalKind::Root | PrincipalKind::Internal)
    }

    /// The identity that bound, when this principal is proxied. Connection
    /// facts are shared with the proxied identity.
    pub fn binder(&self) -> Option<Principal> {
        self.proxied_by.as_ref().map(|dn| {
            let mut p = self.clone();
            p.kind = PrincipalKind::User(dn.clone());
            p.proxied_by = None;
            p
        })
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PrincipalKind::Root => f.write_str("root"),
            PrincipalKind::Internal => f.write_str("internal"),
            PrincipalKind::Anonymous => f.write_str("anonymous"),
            PrincipalKind::User(dn) => write!(f, "{}", dn),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Search,
    Compare,
    Add,
    Delete,
    Modify,
    ModRdn,
    Other,
}

/// Per operation facts supplied by the dispatch layer.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub eventid: Uuid,
    pub conn_id: u64,
    pub op_id: u64,
    pub kind: OperationKind,
    pub now: OffsetDateTime,
    /// The search returns entries from a precomputed candidate list rather
    /// than walking the tree, so the search base handles are not used.
    pub search_list_based: bool,
    /// The backend serving this operation refuses writes.
    pub read_only: bool,
    pub connection: Option<Arc<ConnectionCache>>,
}

impl OperationInfo {
    pub fn new(conn_id: u64, op_id: u64, kind: OperationKind) -> Self {
        OperationInfo {
            eventid: Uuid::new_v4(),
            conn_id,
            op_id,
            kind,
            now: OffsetDateTime::now_utc(),
            search_list_based: false,
            read_only: false,
            connection: None,
        }
    }

    pub fn with_time(mut self, now: OffsetDateTime) -> Self {
        self.now = now;
        self
    }

    pub fn with_connection(mut self, cache: Arc<ConnectionCache>) -> Self {
        self.connection = Some(cache);
        self
    }

    pub fn read_only(mut self, ro: bool) -> Self {
        self.read_only = ro;
        self
    }

    pub fn list_based(mut self, lb: bool) -> Self {
        self.search_list_based = lb;
        self
    }

    pub fn is_search(&self) -> bool {
        self.kind == OperationKind::Search
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authmethod_satisfies() {
        assert!(AuthMethod::Simple.satisfies("none"));
        assert!(AuthMethod::Simple.satisfies("SIMPLE"));
        assert!(!AuthMethod::Simple.satisfies("ssl"));
        assert!(AuthMethod::Sasl("GSSAPI".into()).satisfies("sasl gssapi"));
        assert!(!AuthMethod::Sasl("EXTERNAL".into()).satisfies("sasl gssapi"));
        assert!(!AuthMethod::None.satisfies("simple"));
    }

    #[test]
    fn test_principal_binder() {
        let alice = Dn::new("uid=alice,dc=example,dc=com").unwrap();
        let proxy = Dn::new("cn=proxy,dc=example,dc=com").unwrap();
        let p = Principal::user(alice.clone()).with_ssf(128).proxied_by(proxy.clone());
        let b = p.binder().unwrap();
        assert_eq!(b.dn(), Some(&proxy));
        assert_eq!(b.ssf, 128);
        assert!(b.binder().is_none());
        assert_eq!(p.to_string(), "uid=alice,dc=example,dc=com");
        assert!(Principal::root().bypasses_access());
        assert!(Principal::anonymous().dn().is_none());
    }
}

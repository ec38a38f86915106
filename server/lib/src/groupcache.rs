//! Nested group membership resolution with a per-principal LRU cache.
//!
//! Each cached principal holds the groups it is known to be a member of and
//! known not to be. Entries are shared: a lookup clones the `Arc` out of the
//! map and releases the lock before reading, so an entry that is evicted or
//! marked stale stays valid for anyone still holding it and is freed with the
//! last reference. The LRU list only holds weak references.
//!
//! Any membership change to a group-like entry bumps the cache signature,
//! after which every existing entry is ignored and replaced on the next
//! write back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use hashbrown::{HashMap, HashSet};

use crate::config::AclConfig;
use crate::dn;
use crate::filter::LdapUrl;
use crate::prelude::*;
use crate::subject::{SubjectContext, Truth};

#[derive(Debug, Default)]
struct Known {
    member_of: Vec<Dn>,
    not_member_of: Vec<Dn>,
}

#[derive(Debug)]
pub struct MembershipEntry {
    principal: Dn,
    signature: u64,
    stale: AtomicBool,
    known: RwLock<Known>,
}

impl MembershipEntry {
    fn new(principal: Dn, signature: u64) -> Self {
        MembershipEntry {
            principal,
            signature,
            stale: AtomicBool::new(false),
            known: RwLock::new(Known::default()),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn lookup(&self, group: &Dn) -> Option<bool> {
        let known = self.known.read().ok()?;
        if known.member_of.contains(group) {
            Some(true)
        } else if known.not_member_of.contains(group) {
            Some(false)
        } else {
            None
        }
    }

    fn record(&self, groups: Vec<Dn>, member: bool) {
        let Ok(mut known) = self.known.write() else {
            return;
        };
        let list = if member {
            &mut known.member_of
        } else {
            &mut known.not_member_of
        };
        for g in groups {
            if !list.contains(&g) {
                list.push(g);
            }
        }
    }
}

#[derive(Default)]
struct GroupCacheInner {
    entries: HashMap<Dn, Arc<MembershipEntry>>,
    // Most recently used at the front.
    lru: VecDeque<Weak<MembershipEntry>>,
}

impl GroupCacheInner {
    fn touch(&mut self, entry: &Arc<MembershipEntry>) {
        let weak = Arc::downgrade(entry);
        self.lru.retain(|w| w.strong_count() > 0 && !w.ptr_eq(&weak));
        self.lru.push_front(weak);
    }

    fn evict(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some(weak) = self.lru.pop_back() else {
                break;
            };
            if let Some(e) = weak.upgrade() {
                cache_trace!(principal = %e.principal, "evicting group membership entry");
                self.entries.remove(&e.principal);
            }
        }
    }
}

pub struct GroupMembershipCache {
    inner: RwLock<GroupCacheInner>,
    signature: AtomicU64,
    nesting_limit: Option<u32>,
    visit_limit: Option<u32>,
    capacity: usize,
}

impl Default for GroupMembershipCache {
    fn default() -> Self {
        GroupMembershipCache::new(
            Some(DEFAULT_GROUP_NESTING_LIMIT),
            Some(DEFAULT_GROUP_VISIT_LIMIT),
            DEFAULT_GROUP_CACHE_SIZE,
        )
    }
}

/// Why a traversal could not reach a definite answer.
enum Abort {
    Nesting,
    Visits,
    Lookup(OperationError),
}

impl GroupMembershipCache {
    pub fn new(nesting_limit: Option<u32>, visit_limit: Option<u32>, capacity: usize) -> Self {
        GroupMembershipCache {
            inner: RwLock::new(GroupCacheInner::default()),
            signature: AtomicU64::new(1),
            nesting_limit,
            visit_limit,
            capacity,
        }
    }

    pub fn from_config(config: &AclConfig) -> Self {
        GroupMembershipCache::new(
            config.group_nesting_limit,
            config.group_visit_limit,
            config.group_cache_size,
        )
    }

    pub fn signature(&self) -> u64 {
        self.signature.load(Ordering::Acquire)
    }

    /// Invalidate every cached membership.
    pub fn bump_signature(&self) {
        let s = self.signature.fetch_add(1, Ordering::AcqRel);
        cache_trace!(signature = s + 1, "group cache signature bumped");
    }

    /// Drop the cached entry of one principal. Holders keep their copy.
    pub fn mark_stale(&self, principal: &Dn) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        if let Some(e) = inner.entries.remove(principal) {
            e.stale.store(true, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, principal: &Dn) -> Option<Arc<MembershipEntry>> {
        let inner = self.inner.read().ok()?;
        let e = inner.entries.get(principal)?;
        if e.is_stale() || e.signature != self.signature() {
            None
        } else {
            Some(e.clone())
        }
    }

    /// Is the principal of `ctx` a member of `group`, directly or through
    /// nested groups?
    #[instrument(level = "trace", skip_all)]
    pub fn is_member(&self, ctx: &SubjectContext<'_>, group: &Dn) -> Truth {
        let Some(principal) = ctx.principal.dn() else {
            return Truth::False;
        };

        if let Some(hit) = self.cached(principal).and_then(|e| e.lookup(group)) {
            cache_trace!(%principal, %group, member = hit, "group cache hit");
            return Truth::from_bool(hit);
        }

        let signature = self.signature();
        match self.traverse(ctx, principal, group) {
            Ok((member, chain)) => {
                self.write_back(principal, signature, chain, member);
                subject_trace!(%principal, %group, member, "group membership resolved");
                Truth::from_bool(member)
            }
            Err(Abort::Nesting) => {
                security_critical!(%principal, %group, limit = ?self.nesting_limit, "group nesting limit exceeded");
                Truth::Undefined
            }
            Err(Abort::Visits) => {
                security_critical!(%principal, %group, limit = ?self.visit_limit, "group visit limit exceeded");
                Truth::Undefined
            }
            Err(Abort::Lookup(e)) => {
                subject_warn!(?e, %group, "unable to resolve group membership");
                Truth::Undefined
            }
        }
    }

    /// Breadth first walk from `group`, which is level one. On a hit the
    /// chain is the path of groups down to the one holding the principal,
    /// otherwise it is every group visited.
    fn traverse(
        &self,
        ctx: &SubjectContext<'_>,
        principal: &Dn,
        group: &Dn,
    ) -> Result<(bool, Vec<Dn>), Abort> {
        let mut queue: VecDeque<(Dn, u32)> = VecDeque::from([(group.clone(), 1)]);
        let mut seen: HashSet<Dn> = HashSet::from_iter([group.clone()]);
        let mut parents: HashMap<Dn, Dn> = HashMap::new();
        let mut visited: Vec<Dn> = Vec::new();

        while let Some((gdn, level)) = queue.pop_front() {
            let Some(g) = ctx.directory.get_entry(&gdn).map_err(Abort::Lookup)? else {
                continue;
            };
            if !g.is_group_like() {
                continue;
            }
            if self.nesting_limit.is_some_and(|l| level > l) {
                return Err(Abort::Nesting);
            }
            visited.push(gdn.clone());
            if self
                .visit_limit
                .is_some_and(|l| visited.len() > l as usize)
            {
                return Err(Abort::Visits);
            }

            if direct_member(ctx, principal, &g).map_err(Abort::Lookup)? {
                let mut chain = vec![gdn.clone()];
                let mut cur = &gdn;
                while let Some(p) = parents.get(cur) {
                    chain.push(p.clone());
                    cur = p;
                }
                return Ok((true, chain));
            }

            for m in static_members(&g) {
                if seen.insert(m.clone()) {
                    parents.insert(m.clone(), gdn.clone());
                    queue.push_back((m, level + 1));
                }
            }
        }
        Ok((false, visited))
    }

    fn write_back(&self, principal: &Dn, signature: u64, chain: Vec<Dn>, member: bool) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        // A bump during the traversal makes the result unusable.
        if signature != self.signature() {
            return;
        }
        let entry = match inner.entries.get(principal) {
            Some(e) if !e.is_stale() && e.signature == signature => e.clone(),
            _ => {
                let e = Arc::new(MembershipEntry::new(principal.clone(), signature));
                inner.entries.insert(principal.clone(), e.clone());
                e
            }
        };
        entry.record(chain, member);
        inner.touch(&entry);
        inner.evict(self.capacity);
    }
}

fn static_members(group: &Entry) -> impl Iterator<Item = Dn> + '_ {
    group
        .values(ATTR_MEMBER)
        .iter()
        .chain(group.values(ATTR_UNIQUEMEMBER).iter())
        .filter_map(|v| dn::normalise_lossy(strip_uid(v)))
        .map(Dn::from_normalised)
}

/// `uniqueMember` values may carry a trailing `#'0101'B` unique identifier.
fn strip_uid(v: &str) -> &str {
    match v.rfind("#'") {
        Some(idx) => &v[..idx],
        None => v,
    }
}

/// Does `group` list the principal itself, by DN, by member URL, or by
/// certificate description?
fn direct_member(
    ctx: &SubjectContext<'_>,
    principal: &Dn,
    group: &Entry,
) -> Result<bool, OperationError> {
    if static_members(group).any(|m| &m == principal) {
        return Ok(true);
    }

    let urls = group.values(ATTR_MEMBERURL);
    if !urls.is_empty() {
        if let Some(client) = ctx.client_entry()? {
            let hit = urls
                .iter()
                .filter_map(|u| match LdapUrl::parse(u) {
                    Ok(u) => Some(u),
                    Err(e) => {
                        subject_error!(?e, group = %group.dn(), "invalid memberurl");
                        None
                    }
                })
                .any(|u| u.matches_entry(&client));
            if hit {
                return Ok(true);
            }
        }
    }

    if let Some(subject) = ctx.principal.client_cert_subject.as_deref() {
        if group
            .values(ATTR_MEMBERCERTIFICATE)
            .iter()
            .any(|d| cert_description_matches(d, subject))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A description such as `{ou=eng, o=example}` matches a certificate subject
/// holding every one of its components.
fn cert_description_matches(description: &str, subject: &str) -> bool {
    let desc = description
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}');
    let (Some(desc), Some(subject)) = (dn::normalise_lossy(desc), dn::normalise_lossy(subject))
    else {
        return false;
    };
    let subject = Dn::from_normalised(subject);
    let have = subject.components();
    Dn::from_normalised(desc)
        .components()
        .iter()
        .all(|c| have.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;

    const ALICE: &str = "uid=alice,ou=people,dc=example,dc=com";
    const ADMINS: &str = "cn=admins,ou=groups,dc=example,dc=com";
    const MANAGERS: &str = "cn=managers,ou=groups,dc=example,dc=com";

    fn nested(fx: &Fixture) {
        fx.dir.add(fx.entry(ALICE));
        fx.dir.add(fx.group(ADMINS, &[MANAGERS, "uid=bob,ou=people,dc=example,dc=com"]));
        fx.dir.add(fx.group(MANAGERS, &[ALICE]));
    }

    #[test]
    fn test_nested_membership_limits() {
        sketching::test_init();
        let admins = Dn::new(ADMINS).unwrap();

        let mut fx = Fixture::new();
        nested(&fx);
        fx.groups = GroupMembershipCache::new(Some(2), None, 10);
        let alice = fx.user(ALICE);
        let target = fx.entry("dc=example,dc=com");
        let ctx = fx.subject_ctx(&alice, &target);
        assert_eq!(fx.groups.is_member(&ctx, &admins), Truth::True);

        let mut fx = Fixture::new();
        nested(&fx);
        fx.groups = GroupMembershipCache::new(Some(1), None, 10);
        let ctx = fx.subject_ctx(&alice, &target);
        assert_eq!(fx.groups.is_member(&ctx, &admins), Truth::Undefined);
        // Nothing is cached for an aborted traversal.
        assert!(fx.groups.is_empty());
    }

    #[test]
    fn test_membership_is_cached_until_signature_bump() {
        sketching::test_init();
        let fx = Fixture::new();
        nested(&fx);
        let alice = fx.user(ALICE);
        let target = fx.entry("dc=example,dc=com");
        let ctx = fx.subject_ctx(&alice, &target);
        let admins = Dn::new(ADMINS).unwrap();
        let managers = Dn::new(MANAGERS).unwrap();

        assert_eq!(fx.groups.is_member(&ctx, &admins), Truth::True);
        assert_eq!(fx.groups.len(), 1);

        // Remove alice from managers. The cached answer stands until the
        // signature moves.
        fx.dir.add(fx.group(MANAGERS, &[]));
        assert_eq!(fx.groups.is_member(&ctx, &admins), Truth::True);
        assert_eq!(fx.groups.is_member(&ctx, &managers), Truth::True);

        fx.groups.bump_signature();
        assert_eq!(fx.groups.is_member(&ctx, &admins), Truth::False);
    }

    #[test]
    fn test_cycle_terminates() {
        sketching::test_init();
        let fx = Fixture::new();
        fx.dir.add(fx.group("cn=a,dc=example,dc=com", &["cn=b,dc=example,dc=com"]));
        fx.dir.add(fx.group("cn=b,dc=example,dc=com", &["cn=a,dc=example,dc=com"]));
        let alice = fx.user(ALICE);
        let target = fx.entry("dc=example,dc=com");
        let ctx = fx.subject_ctx(&alice, &target);
        assert_eq!(
            fx.groups
                .is_member(&ctx, &Dn::new("cn=a,dc=example,dc=com").unwrap()),
            Truth::False
        );
    }

    #[test]
    fn test_visit_limit() {
        sketching::test_init();
        let mut fx = Fixture::new();
        fx.groups = GroupMembershipCache::new(None, Some(2), 10);
        fx.dir.add(fx.group(
            "cn=top,dc=example,dc=com",
            &["cn=g1,dc=example,dc=com", "cn=g2,dc=example,dc=com"],
        ));
        fx.dir.add(fx.group("cn=g1,dc=example,dc=com", &[]));
        fx.dir.add(fx.group("cn=g2,dc=example,dc=com", &[]));
        let alice = fx.user(ALICE);
        let target = fx.entry("dc=example,dc=com");
        let ctx = fx.subject_ctx(&alice, &target);
        assert_eq!(
            fx.groups
                .is_member(&ctx, &Dn::new("cn=top,dc=example,dc=com").unwrap()),
            Truth::Undefined
        );
    }

    #[test]
    fn test_member_url_and_certificates() {
        sketching::test_init();
        let fx = Fixture::new();
        fx.dir
            .add(fx.entry(ALICE).with_value("departmentnumber", "7"));
        fx.dir.add(
            fx.entry("cn=dept7,dc=example,dc=com")
                .with_value(ATTR_OBJECTCLASS, OC_GROUPOFURLS)
                .with_value(
                    ATTR_MEMBERURL,
                    "ldap:///ou=people,dc=example,dc=com??sub?(departmentnumber=7)",
                ),
        );
        fx.dir.add(
            fx.entry("cn=certs,dc=example,dc=com")
                .with_value(ATTR_OBJECTCLASS, OC_GROUPOFCERTIFICATES)
                .with_value(ATTR_MEMBERCERTIFICATE, "{ou=eng, o=example}"),
        );
        let target = fx.entry("dc=example,dc=com");

        let alice = fx.user(ALICE);
        let ctx = fx.subject_ctx(&alice, &target);
        assert_eq!(
            fx.groups
                .is_member(&ctx, &Dn::new("cn=dept7,dc=example,dc=com").unwrap()),
            Truth::True
        );
        assert_eq!(
            fx.groups
                .is_member(&ctx, &Dn::new("cn=certs,dc=example,dc=com").unwrap()),
            Truth::False
        );

        let carol = fx
            .user("uid=carol,dc=example,dc=com")
            .with_cert_subject("CN=Carol,OU=Eng,O=Example,C=NZ");
        let ctx = fx.subject_ctx(&carol, &target);
        assert_eq!(
            fx.groups
                .is_member(&ctx, &Dn::new("cn=certs,dc=example,dc=com").unwrap()),
            Truth::True
        );
    }

    #[test]
    fn test_lru_eviction_and_stale() {
        sketching::test_init();
        let mut fx = Fixture::new();
        fx.groups = GroupMembershipCache::new(Some(5), None, 2);
        fx.dir.add(fx.group(ADMINS, &[]));
        let admins = Dn::new(ADMINS).unwrap();
        let target = fx.entry("dc=example,dc=com");

        for uid in ["a", "b", "c"] {
            let p = fx.user(&format!("uid={},dc=example,dc=com", uid));
            let ctx = fx.subject_ctx(&p, &target);
            assert_eq!(fx.groups.is_member(&ctx, &admins), Truth::False);
        }
        assert_eq!(fx.groups.len(), 2);

        let held = fx
            .groups
            .cached(&Dn::new("uid=c,dc=example,dc=com").unwrap())
            .unwrap();
        fx.groups
            .mark_stale(&Dn::new("uid=c,dc=example,dc=com").unwrap());
        assert!(held.is_stale());
        assert_eq!(held.lookup(&admins), Some(false));
        assert_eq!(fx.groups.len(), 1);
    }

    #[test]
    fn test_strip_uid() {
        assert_eq!(strip_uid("uid=a,dc=x#'0101'B"), "uid=a,dc=x");
        assert_eq!(strip_uid("uid=a,dc=x"), "uid=a,dc=x");
    }
}

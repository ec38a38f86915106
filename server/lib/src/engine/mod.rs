//! The access control decision engine.
//!
//! A [`DecisionEngine`] owns the rule index, the group membership cache, the
//! anonymous profile and the pool of evaluation contexts. Every directory
//! operation calls [`DecisionEngine::begin`] once and then asks the returned
//! [`AccessOperation`] about each entry and attribute it touches. The
//! operation keeps one read snapshot of the index and one pooled evaluation
//! context for its whole lifetime, so answers within an operation are
//! consistent even while rules change underneath it.
//!
//! A single decision runs in this order:
//!
//! * refuse writes against read only backends, and let root and internal
//!   principals through untouched;
//! * answer anonymous read and search from the anonymous profile when it is
//!   conclusive;
//! * on the first call for an entry, check proxy rights, rotate the saved
//!   attribute answers and collect the rule containers on the entry's path;
//! * for searches, reuse an answer from an earlier entry or operation when
//!   the same rules apply;
//! * select the rules whose target covers the entry and attribute, then
//!   test deny rules before allow rules.

use std::fmt;
use std::sync::Arc;

use crate::anonymous::AnonymousProfile;
use crate::config::AclConfig;
use crate::context::{ContextGuard, ContextPool, ContextState, EvalStats};
use crate::dn;
use crate::entry::SearchScope;
use crate::filter::Filter;
use crate::groupcache::GroupMembershipCache;
use crate::index::{
    PathScan, RuleIndex, RuleIndexReadTransaction, RuleIndexTransaction,
    RuleIndexWriteTransaction,
};
use crate::prelude::*;
use crate::rule::{RuleId, RuleParser, RuleRecord};
use crate::subject::Truth;

mod effective;
mod modify;
mod notify;
mod rights;
mod scan;
mod target;

pub use self::modify::ModifyRefusal;
pub use self::notify::{BackendState, RuleStoreChange};

/// Why a decision came out the way it did. Carried in the access summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// No rule's target covers the entry and attribute.
    NoMatchedResourceAllows,
    /// Allow rules apply to the entry but none names the principal.
    NoMatchedSubjectAllows,
    EvaluatedDeny(RuleId),
    EvaluatedAllow(RuleId),
    CachedDeny(RuleId),
    CachedAllow(RuleId),
    /// Answered from the attribute results of an earlier entry or operation.
    ContextCachedAllow,
    ContextCachedDeny,
    /// Granted because a `targetattr="*"` rule already granted the entry.
    StarAttrAllow,
    AnonymousAllow,
    AnonymousDeny,
    /// Root and internal operations are not subject to access control.
    Bypass,
    ReadOnlyBackend,
    ProxyDenied,
    InvalidSyntax,
    Error,
}

impl DecisionReason {
    /// The rule that decided, when one did.
    pub fn rule(self) -> Option<RuleId> {
        match self {
            DecisionReason::EvaluatedDeny(id)
            | DecisionReason::EvaluatedAllow(id)
            | DecisionReason::CachedDeny(id)
            | DecisionReason::CachedAllow(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::NoMatchedResourceAllows => f.write_str("no allow acis"),
            DecisionReason::NoMatchedSubjectAllows => f.write_str("no aci matched the subject"),
            DecisionReason::EvaluatedDeny(id) => write!(f, "denied by aci {}", id),
            DecisionReason::EvaluatedAllow(id) => write!(f, "allowed by aci {}", id),
            DecisionReason::CachedDeny(id) => write!(f, "cached deny by aci {}", id),
            DecisionReason::CachedAllow(id) => write!(f, "cached allow by aci {}", id),
            DecisionReason::ContextCachedAllow => f.write_str("cached context allow"),
            DecisionReason::ContextCachedDeny => f.write_str("cached context deny"),
            DecisionReason::StarAttrAllow => f.write_str("allowed by targetattr=*"),
            DecisionReason::AnonymousAllow => f.write_str("anonymous profile allow"),
            DecisionReason::AnonymousDeny => f.write_str("anonymous profile deny"),
            DecisionReason::Bypass => f.write_str("access control bypassed"),
            DecisionReason::ReadOnlyBackend => f.write_str("backend is read only"),
            DecisionReason::ProxyDenied => f.write_str("proxy right not granted"),
            DecisionReason::InvalidSyntax => f.write_str("invalid aci syntax"),
            DecisionReason::Error => f.write_str("evaluation error"),
        }
    }
}

pub struct DecisionEngine {
    config: AclConfig,
    index: RuleIndex,
    groups: GroupMembershipCache,
    anonymous: AnonymousProfile,
    pool: ContextPool,
    directory: Arc<dyn Directory>,
    parser: Arc<dyn RuleParser>,
}

impl DecisionEngine {
    pub fn new(
        config: AclConfig,
        directory: Arc<dyn Directory>,
        parser: Arc<dyn RuleParser>,
    ) -> Result<Self, OperationError> {
        config.validate()?;
        admin_info!(
            pool = config.pool_size(),
            nesting = ?config.group_nesting_limit,
            read_only = config.read_only,
            "starting access control engine"
        );
        Ok(DecisionEngine {
            groups: GroupMembershipCache::from_config(&config),
            anonymous: AnonymousProfile::new(config.anonymous_profile_max),
            pool: ContextPool::from_config(&config),
            index: RuleIndex::new(),
            config,
            directory,
            parser,
        })
    }

    pub fn config(&self) -> &AclConfig {
        &self.config
    }

    pub fn index(&self) -> &RuleIndex {
        &self.index
    }

    pub fn groups(&self) -> &GroupMembershipCache {
        &self.groups
    }

    pub fn anonymous(&self) -> &AnonymousProfile {
        &self.anonymous
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// Index every rule stored at or below `base`. Returns the number of
    /// rules indexed; values that fail to parse are logged and skipped.
    pub fn load_rules(&self, base: &Dn) -> Result<usize, OperationError> {
        let mut txn = self.index.write();
        let count = self.index_subtree(&mut txn, base)?;
        txn.commit();
        self.anonymous.invalidate();
        admin_info!(%base, rules = count, "loaded access control rules");
        Ok(count)
    }

    fn index_subtree(
        &self,
        txn: &mut RuleIndexWriteTransaction<'_>,
        base: &Dn,
    ) -> Result<usize, OperationError> {
        let entries = self
            .directory
            .search(base, SearchScope::Subtree, &Filter::pres(ATTR_ACI))?;
        Ok(entries
            .iter()
            .map(|e| {
                self.index_values(txn, e.dn(), e.values(ATTR_ACI).iter().map(String::as_str))
            })
            .sum())
    }

    fn index_values<'a, I>(
        &self,
        txn: &mut RuleIndexWriteTransaction<'_>,
        owner: &Dn,
        values: I,
    ) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut count = 0;
        for text in values {
            match self.parser.parse(owner, text) {
                Ok(rule) => {
                    txn.insert(rule);
                    count += 1;
                }
                Err(e) => {
                    admin_error!(dn = %owner, code = e.code(), err = %e, aci = text, "ignoring invalid aci");
                }
            }
        }
        count
    }

    /// Start access checks for one operation.
    pub fn begin(
        &self,
        principal: Principal,
        op: OperationInfo,
    ) -> Result<AccessOperation<'_>, OperationError> {
        let ctx = self.pool.acquire()?;
        Ok(self.begin_in(principal, op, ctx))
    }

    fn begin_in<'e>(
        &'e self,
        principal: Principal,
        op: OperationInfo,
        mut ctx: ContextGuard<'e>,
    ) -> AccessOperation<'e> {
        let index = self.index.read();
        let signature = index.signature();
        ctx.signature = Some(signature);
        ctx.bind = principal.dn().cloned();
        if op.search_list_based {
            ctx.state |= ContextState::SEARCH_BASED_ON_LIST;
        }
        if let Some(conn) = op.connection.as_ref() {
            conn.load_into(&mut ctx, signature);
        }
        request_trace!(
            conn_id = op.conn_id,
            op_id = op.op_id,
            %principal,
            %signature,
            generation = ctx.generation(),
            "access operation started"
        );
        AccessOperation {
            engine: self,
            principal,
            op,
            index,
            ctx,
            path: PathScan::Containers(Vec::new()),
        }
    }
}

/// Access checks for one directory operation by one principal.
pub struct AccessOperation<'e> {
    engine: &'e DecisionEngine,
    principal: Principal,
    op: OperationInfo,
    index: RuleIndexReadTransaction,
    ctx: ContextGuard<'e>,
    path: PathScan,
}

impl AccessOperation<'_> {
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn operation(&self) -> &OperationInfo {
        &self.op
    }

    pub fn state(&self) -> ContextState {
        self.ctx.state()
    }

    pub fn stats(&self) -> EvalStats {
        self.ctx.stats()
    }

    pub fn subject_evaluations(&self) -> u64 {
        self.ctx.subject_evaluations()
    }

    /// Decide whether the principal holds `access` on `entry`, or on `attr`
    /// of it. `value` is the value being written, when checking a single
    /// value of a modification.
    #[instrument(level = "trace", skip_all)]
    pub fn access_allowed(
        &mut self,
        entry: &Entry,
        attr: Option<&str>,
        value: Option<&str>,
        access: AccessRights,
    ) -> AccessResultCode {
        let (result, reason) = self.decide(entry, attr, value, access);
        self.log_summary("", entry, attr, access, result, reason);
        result
    }

    fn decide(
        &mut self,
        entry: &Entry,
        attr: Option<&str>,
        value: Option<&str>,
        access: AccessRights,
    ) -> (AccessResultCode, DecisionReason) {
        let mut access = access.normalise();

        if access.intersects(AccessRights::WRITE | AccessRights::ADD | AccessRights::DELETE)
            && (self.op.read_only || self.engine.config.read_only)
        {
            return (
                AccessResultCode::UnwillingToPerform,
                DecisionReason::ReadOnlyBackend,
            );
        }

        if self.principal.bypasses_access() {
            return (AccessResultCode::Success, DecisionReason::Bypass);
        }

        // Writing one's own DN as a value is a self write.
        if access.contains(AccessRights::WRITE) {
            if let (Some(v), Some(me)) = (value, self.principal.dn()) {
                if dn::normalise_lossy(v).as_deref() == Some(me.as_str()) {
                    access |= AccessRights::SELF;
                }
            }
        }

        let Some(access_str) = access.describe() else {
            security_error!(?access, "unable to describe requested access");
            return (AccessResultCode::OperationsError, DecisionReason::Error);
        };

        if self.principal.is_anonymous() && access.is_read_or_search() {
            match self
                .engine
                .anonymous
                .evaluate(&self.index, entry, attr, access)
            {
                Truth::True => return (AccessResultCode::Success, DecisionReason::AnonymousAllow),
                Truth::False => {
                    return (
                        AccessResultCode::InsufficientAccessRights,
                        DecisionReason::AnonymousDeny,
                    )
                }
                Truth::Undefined => {}
            }
        }

        if access.contains(AccessRights::SEARCH)
            && !self.ctx.state.contains(ContextState::SEARCH_BASED_ON_LIST)
        {
            self.ctx.state.remove(ContextState::ACCESS_ALLOWED_ON_ENTRY);
        }

        if self.ctx.entry_dn.as_ref() != Some(entry.dn()) {
            if let Some(refused) = self.start_entry(entry, access) {
                return refused;
            }
        } else {
            self.ctx.state.remove(ContextState::NEW_ENTRY);
        }

        if self.ctx.state.contains(ContextState::ATTR_RULE_EVALUATED) {
            self.ctx.results.reset_entry_relative();
            self.ctx.state.remove(ContextState::ATTR_RULE_EVALUATED);
        }

        if access.contains(AccessRights::SEARCH) {
            if let Some(cached) = self.match_handles_from_cache(entry, attr, access) {
                return cached;
            }
        }

        if self.scan_for_rules(entry, attr, value, access) == 0 {
            return (
                AccessResultCode::InsufficientAccessRights,
                DecisionReason::NoMatchedResourceAllows,
            );
        }

        let (mut allowed, mut reason) = self.test_rights(entry, attr, access);
        if !allowed && access_str == "selfwrite" {
            // Anyone who may write the attribute may also write themselves.
            (allowed, reason) = self.test_rights(entry, attr, access - AccessRights::SELF);
        }

        if let Some(a) = attr {
            if let Some(eval) = self.ctx.curr.get_or_insert(a) {
                eval.store(access, allowed, reason.rule());
            }
        }

        if allowed {
            (AccessResultCode::Success, reason)
        } else {
            (AccessResultCode::InsufficientAccessRights, reason)
        }
    }

    /// Prepare the context for an entry not seen by the previous call.
    fn start_entry(
        &mut self,
        entry: &Entry,
        access: AccessRights,
    ) -> Option<(AccessResultCode, DecisionReason)> {
        self.ctx.stats.entries += 1;

        if !access.contains(AccessRights::PROXY) {
            if let Some(binder) = self.principal.binder() {
                let rc = self.check_proxy(binder, entry);
                if !rc.is_success() {
                    return Some((rc, DecisionReason::ProxyDenied));
                }
            }
        }

        if access.contains(AccessRights::SEARCH) {
            let ctx = &mut *self.ctx;
            ctx.search_entries += 1;
            if ctx.search_entries == 1 {
                ctx.state |= ContextState::COPY_EVALCONTEXT;
            } else if ctx.state.contains(ContextState::COPY_EVALCONTEXT) {
                ctx.prev_entry.clear();
                ctx.prev_entry.copy_from(&ctx.curr, false);
                ctx.state.remove(ContextState::COPY_EVALCONTEXT);
            }
            ctx.curr.scrub();
        }

        self.ctx.results.reset_entry_relative();
        self.ctx.entry_dn = Some(entry.dn().clone());
        self.ctx.macro_values.clear();
        self.ctx.allowed_attr = None;
        self.ctx.state |= ContextState::NEW_ENTRY;
        self.path = self
            .index
            .collect_path(entry.dn(), self.engine.config.max_selected_rules);
        None
    }

    /// The identity that bound must hold the proxy right on every entry the
    /// proxied identity touches.
    fn check_proxy(&self, binder: Principal, entry: &Entry) -> AccessResultCode {
        let mut op = self.op.clone();
        op.connection = None;
        // This operation already holds a pooled context.
        let ctx = self.engine.pool.detached();
        self.engine
            .begin_in(binder, op, ctx)
            .access_allowed(entry, None, None, AccessRights::PROXY)
    }

    /// Every rule on the current entry's path, or every rule when the path
    /// was too long to collect.
    fn path_rules(&self) -> Vec<Arc<RuleRecord>> {
        match &self.path {
            PathScan::Containers(containers) => containers
                .iter()
                .flat_map(|c| c.rules.iter().cloned())
                .collect(),
            PathScan::FullScan => self
                .index
                .containers()
                .flat_map(|c| c.rules.iter().cloned())
                .collect(),
        }
    }

    fn log_summary(
        &self,
        scope: &str,
        entry: &Entry,
        attr: Option<&str>,
        access: AccessRights,
        result: AccessResultCode,
        reason: DecisionReason,
    ) {
        let proxied_by = self
            .principal
            .proxied_by
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        let outcome = if result.is_success() {
            "Allowed"
        } else {
            "Denied"
        };
        security_access!(
            conn_id = self.op.conn_id,
            op_id = self.op.op_id,
            principal = %self.principal,
            proxied_by = %proxied_by,
            access = %access,
            dn = %entry.dn(),
            attr = attr.unwrap_or("NULL"),
            %result,
            %reason,
            "{} {}",
            outcome,
            scope
        );
    }

    /// Decide read access on the entry as a whole: the entry is readable
    /// when at least one of its attributes is.
    #[instrument(level = "trace", skip_all)]
    pub fn read_access_allowed_on_entry(
        &mut self,
        entry: &Entry,
        access: AccessRights,
    ) -> AccessResultCode {
        if self.principal.bypasses_access() {
            return AccessResultCode::Success;
        }

        if self.principal.is_anonymous() {
            match self
                .engine
                .anonymous
                .evaluate(&self.index, entry, None, AccessRights::READ)
            {
                Truth::True => return AccessResultCode::Success,
                Truth::False => return AccessResultCode::InsufficientAccessRights,
                Truth::Undefined => {}
            }
        }

        self.ctx.state.remove(
            ContextState::ACCESS_ALLOWED_ON_A_ATTR
                | ContextState::ACCESS_DENIED_ON_ALL_ATTRS
                | ContextState::ACCESS_ALLOWED_ON_ENTRY
                | ContextState::ATTR_STAR_MATCHED
                | ContextState::FOUND_ATTR_RULE
                | ContextState::EVALUATING_FIRST_ATTR
                | ContextState::FOUND_A_ENTRY_TEST_RULE,
        );

        if self.ctx.state.contains(ContextState::MATCHES_ALL_RULES) {
            if let Some(rc) = self.ctx.saved_context().cached(None, AccessRights::READ) {
                let reason = if rc.is_success() {
                    DecisionReason::ContextCachedAllow
                } else {
                    DecisionReason::ContextCachedDeny
                };
                self.log_summary("on entry", entry, None, AccessRights::READ, rc, reason);
                return rc;
            }
        }

        self.ctx.state |= ContextState::EVALUATING_FIRST_ATTR;
        for attr in entry.attribute_names() {
            if !self
                .access_allowed(entry, Some(attr), None, AccessRights::READ)
                .is_success()
            {
                continue;
            }
            if self
                .ctx
                .state
                .contains(ContextState::FOUND_A_ENTRY_TEST_RULE)
                && !self.access_allowed(entry, None, None, access).is_success()
                && self.ctx.state.contains(ContextState::EXECUTING_DENY_HANDLES)
            {
                // Refused by a deny rule rather than for want of an allow.
                return AccessResultCode::InsufficientAccessRights;
            }
            self.ctx.state.remove(ContextState::EVALUATING_FIRST_ATTR);
            self.ctx.allowed_attr = Some(attr.to_string());
            self.ctx.state |= ContextState::ACCESS_ALLOWED_ON_A_ATTR;
            return AccessResultCode::Success;
        }

        self.ctx.state |= ContextState::ACCESS_DENIED_ON_ALL_ATTRS;
        self.ctx.state.remove(ContextState::EVALUATING_FIRST_ATTR);
        AccessResultCode::InsufficientAccessRights
    }

    /// Decide read access on one attribute of an entry already found
    /// readable with [`Self::read_access_allowed_on_entry`].
    #[instrument(level = "trace", skip_all)]
    pub fn read_access_allowed_on_attr(&mut self, entry: &Entry, attr: &str) -> AccessResultCode {
        if self.principal.bypasses_access() {
            return AccessResultCode::Success;
        }

        if self.principal.is_anonymous() {
            match self
                .engine
                .anonymous
                .evaluate(&self.index, entry, Some(attr), AccessRights::READ)
            {
                Truth::True => return AccessResultCode::Success,
                Truth::False => return AccessResultCode::InsufficientAccessRights,
                Truth::Undefined => {}
            }
        }

        self.ctx.state |= ContextState::ACCESS_ALLOWED_ON_ENTRY;

        if self.ctx.state.contains(ContextState::MATCHES_ALL_RULES) {
            match self.ctx.saved_context().cached(Some(attr), AccessRights::READ) {
                Some(rc) => {
                    let reason = if rc.is_success() {
                        DecisionReason::ContextCachedAllow
                    } else {
                        DecisionReason::ContextCachedDeny
                    };
                    self.log_summary("on attr", entry, Some(attr), AccessRights::READ, rc, reason);
                    return rc;
                }
                None => self.ctx.state |= ContextState::COPY_EVALCONTEXT,
            }
        }

        if self
            .ctx
            .state
            .contains(ContextState::ACCESS_DENIED_ON_ALL_ATTRS)
        {
            return AccessResultCode::InsufficientAccessRights;
        }

        if self.ctx.state.contains(ContextState::ATTR_STAR_MATCHED) {
            self.log_summary(
                "on attr",
                entry,
                Some(attr),
                AccessRights::READ,
                AccessResultCode::Success,
                DecisionReason::StarAttrAllow,
            );
            return AccessResultCode::Success;
        }

        if self.ctx.state.contains(ContextState::ACCESS_ALLOWED_ON_A_ATTR)
            && self
                .ctx
                .allowed_attr
                .as_deref()
                .map(|a| a.eq_ignore_ascii_case(attr))
                .unwrap_or(false)
        {
            // Already granted while deciding the entry; later attributes
            // need their own evaluation.
            self.ctx.state.remove(ContextState::ACCESS_ALLOWED_ON_A_ATTR);
            return AccessResultCode::Success;
        }

        self.access_allowed(entry, Some(attr), None, AccessRights::READ)
    }

    /// Rename checks: write on the entry, add on the new naming values and,
    /// when the old ones are removed, delete on the old naming values.
    #[instrument(level = "trace", skip_all)]
    pub fn modrdn_access_allowed(
        &mut self,
        entry: &Entry,
        new_rdn: &str,
        delete_old_rdn: bool,
    ) -> AccessResultCode {
        let rc = self.access_allowed(entry, None, None, AccessRights::WRITE);
        if !rc.is_success() {
            request_info!(dn = %entry.dn(), "modrdn: write permission to entry not allowed");
            return rc;
        }

        let Ok(new_dn) = Dn::new(new_rdn) else {
            request_info!(rdn = new_rdn, "modrdn: unable to parse new rdn");
            return AccessResultCode::InsufficientAccessRights;
        };
        let rc = self.rdn_access(entry, &new_dn, AccessRights::WRITE_ADD);
        if !rc.is_success() {
            request_info!(dn = %entry.dn(), "modrdn: write permission to add new naming attribute not allowed");
            return rc;
        }

        if delete_old_rdn {
            let old_dn = entry.dn().clone();
            let rc = self.rdn_access(entry, &old_dn, AccessRights::WRITE_DEL);
            if !rc.is_success() {
                request_info!(dn = %entry.dn(), "modrdn: write permission to delete old naming attribute not allowed");
                return rc;
            }
        }
        AccessResultCode::Success
    }

    fn rdn_access(&mut self, entry: &Entry, rdn: &Dn, access: AccessRights) -> AccessResultCode {
        let pairs = rdn.rdn_pairs();
        if pairs.is_empty() {
            return AccessResultCode::InsufficientAccessRights;
        }
        for (attr, value) in pairs {
            let rc = self.access_allowed(entry, Some(attr), Some(value), access);
            if !rc.is_success() {
                return rc;
            }
        }
        AccessResultCode::Success
    }
}

impl Drop for AccessOperation<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.op.connection.as_ref() else {
            return;
        };
        let state = self.ctx.state;
        if !state.intersects(ContextState::UPDATE | ContextState::INCREMENTAL) {
            return;
        }
        let Some(signature) = self.ctx.signature else {
            return;
        };
        let attrs_only =
            state.contains(ContextState::INCREMENTAL) && !state.contains(ContextState::UPDATE);
        let ctx = &*self.ctx;
        let source = if ctx.prev_entry.attrs().is_empty() {
            &ctx.curr
        } else {
            &ctx.prev_entry
        };
        cache_trace!(%signature, attrs_only, attrs = source.attrs().len(), "saving evaluation context on connection");
        conn.store(signature, ctx.bind.clone(), source, attrs_only);
    }
}

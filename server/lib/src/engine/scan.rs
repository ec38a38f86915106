//! Rule selection for an entry, and reuse of answers computed for an
//! earlier entry or operation that matched the same rules.

use crate::context::ContextState;
use crate::prelude::*;

use super::{AccessOperation, DecisionReason};

impl AccessOperation<'_> {
    /// Select the rules whose target covers the request into the deny and
    /// allow candidate lists. Returns how many rules were selected.
    pub(super) fn scan_for_rules(
        &mut self,
        entry: &Entry,
        attr: Option<&str>,
        value: Option<&str>,
        access: AccessRights,
    ) -> usize {
        self.ctx.candidates.clear();
        let mut selected = 0;
        for rule in self.path_rules() {
            if !self.resource_matches(&rule, entry, attr, value, access, false) {
                continue;
            }
            selected += 1;
            if rule.deny_rights.intersects(access) && !self.ctx.candidates.deny.push(rule.clone())
            {
                perf_trace!(rule = %rule, "deny candidate list full");
            }
            if rule.allow_rights.intersects(access) && !self.ctx.candidates.allow.push(rule.clone())
            {
                perf_trace!(rule = %rule, "allow candidate list full");
            }
        }
        self.ctx.stats.rules_matched += selected as u64;

        if access.contains(AccessRights::SEARCH) && self.ctx.state.contains(ContextState::NEW_ENTRY)
        {
            self.ctx.curr.sort_matched();
        }
        request_trace!(dn = %entry.dn(), ?attr, %access, selected, "selected rules");
        selected
    }

    /// On a new entry, check whether exactly the rules that matched the
    /// saved context match this entry too. While they do, answers for an
    /// attribute are taken from the saved context.
    pub(super) fn match_handles_from_cache(
        &mut self,
        entry: &Entry,
        attr: Option<&str>,
        access: AccessRights,
    ) -> Option<(AccessResultCode, DecisionReason)> {
        if self.ctx.state.contains(ContextState::NEW_ENTRY) {
            self.ctx.state |= ContextState::MATCHES_ALL_RULES;
            let mut matched = 0;
            let mut all_known = true;
            for rule in self.path_rules() {
                if !self.resource_matches(&rule, entry, attr, None, access, true) {
                    continue;
                }
                matched += 1;
                if !self.ctx.saved_context().matched().contains(&rule.id) {
                    all_known = false;
                    break;
                }
                if rule.is_entry_relative() {
                    self.ctx.saved_context_mut().mark_recompute(rule.id);
                }
            }
            if !all_known || matched != self.ctx.saved_context().matched().len() {
                cache_trace!(dn = %entry.dn(), matched, "entry does not match the saved rules");
                self.ctx.state.remove(ContextState::MATCHES_ALL_RULES);
                self.ctx.state |= ContextState::UPDATE;
                if self
                    .ctx
                    .state
                    .contains(ContextState::HAS_CONNECTION_CONTEXT)
                {
                    self.ctx.state.remove(ContextState::HAS_CONNECTION_CONTEXT);
                } else {
                    self.ctx.state |= ContextState::COPY_EVALCONTEXT;
                    self.ctx.prev_entry.clear_matched();
                }
            }
        }

        if !self.ctx.state.contains(ContextState::MATCHES_ALL_RULES) {
            return None;
        }

        let mut rc = self.ctx.saved_context().cached(attr, access);
        if rc.is_none() && self.ctx.state.contains(ContextState::HAS_CONNECTION_CONTEXT) {
            // The previous entry of this operation may know the attribute.
            rc = self.ctx.prev_entry.cached(attr, access);
            if rc.is_some() {
                self.ctx.state |= ContextState::INCREMENTAL;
            }
        }
        let rc = rc?;
        cache_trace!(dn = %entry.dn(), ?attr, %rc, "answered from saved context");
        if rc.is_success() {
            Some((rc, DecisionReason::ContextCachedAllow))
        } else {
            Some((rc, DecisionReason::ContextCachedDeny))
        }
    }
}

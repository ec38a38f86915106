//! The two caches an evaluation context carries.
//!
//! [`ResultCache`] remembers how each rule's subject evaluated for search
//! and read, so the same rule is not evaluated twice for one identity.
//! [`AttrEvalContext`] remembers the final answer per attribute, and the set
//! of rules whose target matched the entry it was computed for. Copies of
//! it are kept for the previous entry and the previous operation.

use crate::prelude::*;
use crate::rule::{RuleId, RuleRecord};

/// Attributes remembered per context. Further attributes are still decided
/// but their answers are not kept.
pub const MAX_ATTR_EVALS: usize = 100;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct CachedResult: u8 {
        const SEARCH_ALLOW = 0x01;
        const SEARCH_DENY = 0x02;
        const SEARCH_SKIP = 0x04;
        const READ_ALLOW = 0x08;
        const READ_DENY = 0x10;
        const READ_SKIP = 0x20;
    }
}

/// Which cached answer a request uses. Only search and read are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Search,
    Read,
}

impl CacheKind {
    pub fn for_access(access: AccessRights) -> Option<Self> {
        if access.contains(AccessRights::SEARCH) {
            Some(CacheKind::Search)
        } else if access.contains(AccessRights::READ) {
            Some(CacheKind::Read)
        } else {
            None
        }
    }

    fn allow(self) -> CachedResult {
        match self {
            CacheKind::Search => CachedResult::SEARCH_ALLOW,
            CacheKind::Read => CachedResult::READ_ALLOW,
        }
    }

    fn deny(self) -> CachedResult {
        match self {
            CacheKind::Search => CachedResult::SEARCH_DENY,
            CacheKind::Read => CachedResult::READ_DENY,
        }
    }

    fn skip(self) -> CachedResult {
        match self {
            CacheKind::Search => CachedResult::SEARCH_SKIP,
            CacheKind::Read => CachedResult::READ_SKIP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cached {
    Allow,
    Deny,
    /// The subject was undefined or did not apply.
    Skip,
}

#[derive(Debug, Clone)]
struct CachedSlot {
    id: RuleId,
    entry_relative: bool,
    flags: CachedResult,
}

impl CachedSlot {
    // Allow and skip together for one access kind can not both be right.
    fn is_contradictory(&self) -> bool {
        let f = self.flags;
        (f.contains(CachedResult::SEARCH_ALLOW) && f.contains(CachedResult::SEARCH_SKIP))
            || (f.contains(CachedResult::READ_ALLOW) && f.contains(CachedResult::READ_SKIP))
    }
}

/// Per rule subject results, bounded.
#[derive(Debug, Clone)]
pub struct ResultCache {
    slots: Vec<CachedSlot>,
    capacity: usize,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        ResultCache {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn lookup(&mut self, id: RuleId, kind: CacheKind) -> Option<Cached> {
        let slot = self.slots.iter_mut().find(|s| s.id == id)?;
        if slot.is_contradictory() {
            cache_trace!(rule = %id, flags = ?slot.flags, "contradictory cached result, re-evaluating");
            slot.flags = CachedResult::empty();
            return None;
        }
        if slot.flags.contains(kind.deny()) {
            Some(Cached::Deny)
        } else if slot.flags.contains(kind.allow()) {
            Some(Cached::Allow)
        } else if slot.flags.contains(kind.skip()) {
            Some(Cached::Skip)
        } else {
            None
        }
    }

    /// Returns false when the cache is full and the result was not kept.
    pub fn record(&mut self, rule: &RuleRecord, kind: CacheKind, result: Cached) -> bool {
        let flag = match result {
            Cached::Allow => kind.allow(),
            Cached::Deny => kind.deny(),
            Cached::Skip => kind.skip(),
        };
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == rule.id) {
            slot.flags |= flag;
            return true;
        }
        if self.slots.len() >= self.capacity {
            cache_trace!(rule = %rule.id, capacity = self.capacity, "result cache full");
            return false;
        }
        self.slots.push(CachedSlot {
            id: rule.id,
            entry_relative: rule.is_entry_relative(),
            flags: flag,
        });
        true
    }

    /// Forget the results of rules whose subject depends on the entry.
    pub fn reset_entry_relative(&mut self) {
        self.slots
            .iter_mut()
            .filter(|s| s.entry_relative)
            .for_each(|s| s.flags = CachedResult::empty());
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AttrStatus: u8 {
        const SUCCESS = 0x01;
        const FAIL = 0x02;
        /// Decided by an entry relative rule; must be evaluated again.
        const RECOMPUTE = 0x04;
        /// Different answers were seen; never trusted.
        const INVALID = 0x08;
    }
}

impl AttrStatus {
    fn cached(self) -> Option<AccessResultCode> {
        if self.intersects(AttrStatus::INVALID | AttrStatus::RECOMPUTE) {
            None
        } else if self == AttrStatus::SUCCESS {
            Some(AccessResultCode::Success)
        } else if self == AttrStatus::FAIL {
            Some(AccessResultCode::InsufficientAccessRights)
        } else {
            None
        }
    }
}

/// The cached answer for one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrEval {
    pub name: String,
    pub read: AttrStatus,
    pub search: AttrStatus,
    pub read_rule: Option<RuleId>,
    pub search_rule: Option<RuleId>,
}

impl AttrEval {
    fn new(name: &str) -> Self {
        AttrEval {
            name: name.to_lowercase(),
            read: AttrStatus::empty(),
            search: AttrStatus::empty(),
            read_rule: None,
            search_rule: None,
        }
    }

    fn is_blank(&self) -> bool {
        self.read.is_empty() && self.search.is_empty()
    }

    /// Remember the outcome of a search or read decision. The other access
    /// kind can no longer be trusted for this attribute.
    pub fn store(&mut self, access: AccessRights, allowed: bool, rule: Option<RuleId>) {
        let status = if allowed {
            AttrStatus::SUCCESS
        } else {
            AttrStatus::FAIL
        };
        if access.contains(AccessRights::SEARCH) {
            self.search = status;
            self.search_rule = rule;
            if !allowed {
                self.read |= AttrStatus::INVALID;
            }
        } else if access.contains(AccessRights::READ) {
            self.read = status;
            self.read_rule = rule;
            if !allowed {
                self.search |= AttrStatus::INVALID;
            }
        }
    }
}

/// Attribute answers plus the rules whose target matched the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrEvalContext {
    attrs: Vec<AttrEval>,
    matched: Vec<RuleId>,
}

impl AttrEvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attrs(&self) -> &[AttrEval] {
        &self.attrs
    }

    pub fn matched(&self) -> &[RuleId] {
        &self.matched
    }

    pub fn find(&self, attr: &str) -> Option<&AttrEval> {
        self.attrs
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(attr))
    }

    /// The slot for `attr`, created when missing. None once the context
    /// holds [`MAX_ATTR_EVALS`] attributes.
    pub fn get_or_insert(&mut self, attr: &str) -> Option<&mut AttrEval> {
        match self
            .attrs
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(attr))
        {
            Some(idx) => self.attrs.get_mut(idx),
            None if self.attrs.len() < MAX_ATTR_EVALS => {
                self.attrs.push(AttrEval::new(attr));
                self.attrs.last_mut()
            }
            None => None,
        }
    }

    pub fn record_matched(&mut self, id: RuleId, max: usize) {
        if self.matched.len() < max && !self.matched.contains(&id) {
            self.matched.push(id);
        }
    }

    pub fn sort_matched(&mut self) {
        self.matched.sort_unstable();
    }

    pub fn clear_matched(&mut self) {
        self.matched.clear();
    }

    /// Merge `src` into this context. Attributes present in both take the
    /// answer from `src`. Unless `attrs_only`, the matched rule list is
    /// replaced as well.
    pub fn copy_from(&mut self, src: &AttrEvalContext, attrs_only: bool) {
        if src.attrs.is_empty() {
            return;
        }
        for a in src.attrs.iter().filter(|a| !a.is_blank()) {
            match self
                .attrs
                .iter()
                .position(|d| d.name.eq_ignore_ascii_case(&a.name))
            {
                Some(i) => self.attrs[i] = a.clone(),
                None if self.attrs.len() < MAX_ATTR_EVALS => self.attrs.push(a.clone()),
                None => break,
            }
        }
        if attrs_only {
            return;
        }
        if !src.matched.is_empty() {
            let mut matched = src.matched.clone();
            matched.sort_unstable();
            self.matched = matched;
        }
    }

    /// Reset every answer but keep the attribute slots.
    pub fn scrub(&mut self) {
        for a in self.attrs.iter_mut() {
            a.read = AttrStatus::empty();
            a.search = AttrStatus::empty();
            a.read_rule = None;
            a.search_rule = None;
        }
        self.matched.clear();
    }

    pub fn clear(&mut self) {
        self.attrs.clear();
        self.matched.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.matched.is_empty()
    }

    /// Answers decided by `id` depend on the entry and can not be reused.
    pub fn mark_recompute(&mut self, id: RuleId) {
        for a in self.attrs.iter_mut() {
            if a.read_rule == Some(id) {
                a.read |= AttrStatus::RECOMPUTE;
            }
            if a.search_rule == Some(id) {
                a.search |= AttrStatus::RECOMPUTE;
            }
        }
    }

    /// The cached answer for `attr`. Without an attribute, any attribute
    /// known to be readable makes the entry readable; nothing else is
    /// conclusive.
    pub fn cached(&self, attr: Option<&str>, access: AccessRights) -> Option<AccessResultCode> {
        let kind = CacheKind::for_access(access)?;
        match attr {
            None => {
                if kind == CacheKind::Read
                    && self
                        .attrs
                        .iter()
                        .any(|a| a.read.cached() == Some(AccessResultCode::Success))
                {
                    Some(AccessResultCode::Success)
                } else {
                    None
                }
            }
            Some(attr) => {
                let a = self.find(attr)?;
                match kind {
                    CacheKind::Search => a.search.cached(),
                    CacheKind::Read => a.read.cached(),
                }
            }
        }
    }
}

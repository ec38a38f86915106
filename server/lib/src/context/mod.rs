//! Per operation evaluation state.
//!
//! An [`EvaluationContext`] belongs to one bind identity for one operation.
//! It holds the candidate rules selected for the current entry, the subject
//! result cache, and the attribute answers of the current entry, the
//! previous entry and the previous operation. Contexts are taken from a
//! [`ContextPool`] and reset when they go back.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::index::Signature;
use crate::prelude::*;
use crate::rule::{RuleId, RuleRecord, TIER_COUNT};

mod cache;
mod connection;
mod pool;

pub use self::cache::{
    AttrEval, AttrEvalContext, AttrStatus, Cached, CacheKind, CachedResult, ResultCache,
    MAX_ATTR_EVALS,
};
pub use self::connection::ConnectionCache;
pub use self::pool::{ContextGuard, ContextPool};

bitflags::bitflags! {
    /// Flags carried between the calls of one operation.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ContextState: u32 {
        /// The rules matching this entry are those of the saved context,
        /// so its attribute answers may be reused.
        const MATCHES_ALL_RULES = 0x0000_0001;
        /// A rule without targetattr matched while testing the first
        /// attribute; the entry itself must be tested too.
        const FOUND_A_ENTRY_TEST_RULE = 0x0000_0002;
        const FOUND_ATTR_RULE = 0x0000_0004;
        /// Access was granted by a `targetattr="*"` rule alone.
        const ATTR_STAR_MATCHED = 0x0000_0008;
        const ACCESS_ALLOWED_ON_A_ATTR = 0x0000_0010;
        const ACCESS_DENIED_ON_ALL_ATTRS = 0x0000_0020;
        const ACCESS_ALLOWED_ON_ENTRY = 0x0000_0040;
        const EVALUATING_FIRST_ATTR = 0x0000_0080;
        const EXECUTING_DENY_HANDLES = 0x0000_0100;
        const SEARCH_BASED_ON_LIST = 0x0000_0200;
        /// Save the current entry's answers as the previous entry's on the
        /// next new entry.
        const COPY_EVALCONTEXT = 0x0000_0400;
        /// The previous operation's answers were loaded from the
        /// connection and are still valid.
        const HAS_CONNECTION_CONTEXT = 0x0000_0800;
        /// Write the whole context back to the connection at the end.
        const UPDATE = 0x0000_1000;
        /// Write new attribute answers back to the connection at the end.
        const INCREMENTAL = 0x0000_2000;
        const ATTR_RULE_EVALUATED = 0x0000_4000;
        const NEW_ENTRY = 0x0000_8000;
    }
}

/// Candidate rules bucketed by tier. Each tier has one reserved slot;
/// further rules go to the overflow list, which is walked after the tiers.
#[derive(Debug, Clone)]
pub struct TierBuckets {
    tiers: [Option<Arc<RuleRecord>>; TIER_COUNT],
    overflow: Vec<Arc<RuleRecord>>,
    capacity: usize,
}

impl TierBuckets {
    pub fn new(capacity: usize) -> Self {
        TierBuckets {
            tiers: Default::default(),
            overflow: Vec::new(),
            capacity,
        }
    }

    /// Returns false when the bucket is full and the rule was dropped.
    pub fn push(&mut self, rule: Arc<RuleRecord>) -> bool {
        if self.len() >= self.capacity {
            return false;
        }
        let tier = rule.tier.slot();
        if let Some(slot) = self.tiers.get_mut(tier).filter(|s| s.is_none()) {
            *slot = Some(rule);
        } else {
            self.overflow.push(rule);
        }
        true
    }

    /// Lowest tier first, then the overflow in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RuleRecord>> {
        self.tiers.iter().flatten().chain(self.overflow.iter())
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().flatten().count() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.tiers = Default::default();
        self.overflow.clear();
    }
}

#[derive(Debug, Clone)]
pub struct Candidates {
    pub deny: TierBuckets,
    pub allow: TierBuckets,
}

impl Candidates {
    fn new(capacity: usize) -> Self {
        Candidates {
            deny: TierBuckets::new(capacity),
            allow: TierBuckets::new(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.deny.clear();
        self.allow.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    pub entries: u64,
    pub rules_matched: u64,
    pub subject_evaluations: u64,
}

pub struct EvaluationContext {
    pub(crate) generation: u64,
    pub(crate) state: ContextState,
    /// The index signature the connection answers were loaded under.
    pub(crate) signature: Option<Signature>,
    pub(crate) bind: Option<Dn>,
    pub(crate) entry_dn: Option<Dn>,
    pub(crate) candidates: Candidates,
    pub(crate) results: ResultCache,
    pub(crate) curr: AttrEvalContext,
    pub(crate) prev_entry: AttrEvalContext,
    pub(crate) prev_op: AttrEvalContext,
    /// What each macro target captured from the current entry DN.
    pub(crate) macro_values: HashMap<RuleId, Option<String>>,
    /// The attribute that granted access to the current entry.
    pub(crate) allowed_attr: Option<String>,
    pub(crate) search_entries: u64,
    pub(crate) stats: EvalStats,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        EvaluationContext::new(DEFAULT_MAX_SELECTED_RULES, DEFAULT_RESULT_CACHE_SIZE)
    }
}

impl EvaluationContext {
    pub fn new(max_selected: usize, result_cache_size: usize) -> Self {
        EvaluationContext {
            generation: 0,
            state: ContextState::empty(),
            signature: None,
            bind: None,
            entry_dn: None,
            candidates: Candidates::new(max_selected),
            results: ResultCache::new(result_cache_size),
            curr: AttrEvalContext::new(),
            prev_entry: AttrEvalContext::new(),
            prev_op: AttrEvalContext::new(),
            macro_values: HashMap::new(),
            allowed_attr: None,
            search_entries: 0,
            stats: EvalStats::default(),
        }
    }

    /// Clear everything an operation left behind. Allocations are kept.
    pub fn reset(&mut self) {
        self.state = ContextState::empty();
        self.signature = None;
        self.bind = None;
        self.entry_dn = None;
        self.candidates.clear();
        self.results.clear();
        self.curr.clear();
        self.prev_entry.clear();
        self.prev_op.clear();
        self.macro_values.clear();
        self.allowed_attr = None;
        self.search_entries = 0;
        self.stats = EvalStats::default();
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    /// How many subject predicates were evaluated so far.
    pub fn subject_evaluations(&self) -> u64 {
        self.stats.subject_evaluations
    }

    /// The attribute answers used for reuse decisions: the previous
    /// operation's when loaded from the connection, else the previous
    /// entry's.
    pub(crate) fn saved_context(&self) -> &AttrEvalContext {
        if self.state.contains(ContextState::HAS_CONNECTION_CONTEXT) {
            &self.prev_op
        } else {
            &self.prev_entry
        }
    }

    pub(crate) fn saved_context_mut(&mut self) -> &mut AttrEvalContext {
        if self.state.contains(ContextState::HAS_CONNECTION_CONTEXT) {
            &mut self.prev_op
        } else {
            &mut self.prev_entry
        }
    }
}

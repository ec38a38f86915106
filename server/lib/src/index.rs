//! The rule index.
//!
//! Rules are grouped into one container per owning DN. Containers live in an
//! ordered map keyed by normalised DN, so the containers that apply to an
//! entry are found by walking the entry's syntactic ancestors. Each container
//! carries a slot number that stays fixed until the container is removed,
//! after which the slot may be handed to a new container.
//!
//! The index is transactional. Readers take a snapshot with
//! [`RuleIndex::read`] and never block writers; a writer works on a private
//! copy that becomes visible on [`RuleIndexWriteTransaction::commit`]. Every
//! structural change bumps the [`Signature`], which is the only invalidation
//! token downstream caches look at.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use concread::cowcell::*;

use crate::prelude::*;
use crate::rule::RuleRecord;

/// Version of the rule index. Zero is never produced so it can not collide
/// with a cache that was never filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(u16);

impl Signature {
    pub fn initial() -> Self {
        Signature(1)
    }

    pub fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Signature(1),
            n => Signature(n),
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All rules defined at one DN.
#[derive(Debug, Clone)]
pub struct RuleContainer {
    pub dn: Dn,
    pub slot: usize,
    pub rules: Vec<Arc<RuleRecord>>,
}

/// The result of looking up the containers that apply to an entry.
#[derive(Debug)]
pub enum PathScan {
    /// Containers from the entry up to the root, nearest first.
    Containers(Vec<Arc<RuleContainer>>),
    /// Too many containers apply. The caller must consider every container.
    FullScan,
}

#[derive(Clone)]
pub struct RuleIndexInner {
    by_dn: BTreeMap<Dn, Arc<RuleContainer>>,
    // true when the slot is in use.
    slots: Vec<bool>,
    signature: Signature,
}

impl RuleIndexInner {
    fn allocate_slot(&mut self) -> usize {
        match self.slots.iter().position(|used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                self.slots.push(true);
                self.slots.len() - 1
            }
        }
    }

    fn release_slot(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = false;
        }
    }
}

pub struct RuleIndex {
    inner: CowCell<RuleIndexInner>,
}

impl Default for RuleIndex {
    fn default() -> Self {
        RuleIndex {
            inner: CowCell::new(RuleIndexInner {
                by_dn: BTreeMap::new(),
                slots: Vec::new(),
                signature: Signature::initial(),
            }),
        }
    }
}

impl RuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RuleIndexReadTransaction {
        RuleIndexReadTransaction {
            inner: self.inner.read(),
        }
    }

    pub fn write(&self) -> RuleIndexWriteTransaction<'_> {
        RuleIndexWriteTransaction {
            inner: self.inner.write(),
        }
    }
}

pub trait RuleIndexTransaction {
    fn get_inner(&self) -> &RuleIndexInner;

    fn signature(&self) -> Signature {
        self.get_inner().signature
    }

    fn get(&self, dn: &Dn) -> Option<&Arc<RuleContainer>> {
        self.get_inner().by_dn.get(dn)
    }

    /// Every container in DN order.
    fn containers(&self) -> Box<dyn Iterator<Item = &Arc<RuleContainer>> + '_> {
        Box::new(self.get_inner().by_dn.values())
    }

    fn len(&self) -> usize {
        self.get_inner().by_dn.len()
    }

    fn is_empty(&self) -> bool {
        self.get_inner().by_dn.is_empty()
    }

    fn rule_count(&self) -> usize {
        self.get_inner().by_dn.values().map(|c| c.rules.len()).sum()
    }

    /// Look up a container at `target` and at each of its ancestors. When
    /// more than `max` containers apply the scan gives up and asks for a full
    /// scan instead.
    fn collect_path(&self, target: &Dn, max: usize) -> PathScan {
        let inner = self.get_inner();
        let mut found = Vec::new();
        for dn in target.ancestors_inclusive() {
            if let Some(c) = inner.by_dn.get(&dn) {
                if found.len() >= max {
                    perf_trace!(%target, max, "rule path too long, using a full scan");
                    return PathScan::FullScan;
                }
                found.push(c.clone());
            }
        }
        PathScan::Containers(found)
    }
}

pub struct RuleIndexReadTransaction {
    inner: CowCellReadTxn<RuleIndexInner>,
}

impl RuleIndexTransaction for RuleIndexReadTransaction {
    fn get_inner(&self) -> &RuleIndexInner {
        &self.inner
    }
}

pub struct RuleIndexWriteTransaction<'a> {
    inner: CowCellWriteTxn<'a, RuleIndexInner>,
}

impl RuleIndexTransaction for RuleIndexWriteTransaction<'_> {
    fn get_inner(&self) -> &RuleIndexInner {
        &self.inner
    }
}

impl RuleIndexWriteTransaction<'_> {
    fn bump(&mut self) {
        let inner = self.inner.get_mut();
        inner.signature = inner.signature.next();
    }

    /// Move the signature on without changing any rule. Answers saved under
    /// the old signature stop being reused.
    pub fn touch(&mut self) {
        self.bump();
    }

    /// Add a rule under its owning DN, creating the container if needed.
    pub fn insert(&mut self, rule: RuleRecord) {
        let dn = rule.owner.clone();
        admin_info!(rule = %rule, "indexing rule");
        let inner = self.inner.get_mut();
        match inner.by_dn.get_mut(&dn) {
            Some(c) => Arc::make_mut(c).rules.push(Arc::new(rule)),
            None => {
                let slot = inner.allocate_slot();
                inner.by_dn.insert(
                    dn.clone(),
                    Arc::new(RuleContainer {
                        dn,
                        slot,
                        rules: vec![Arc::new(rule)],
                    }),
                );
            }
        }
        self.bump();
    }

    /// Remove every rule defined at `dn`. Returns the removed container.
    pub fn remove(&mut self, dn: &Dn) -> Option<Arc<RuleContainer>> {
        let inner = self.inner.get_mut();
        let removed = inner.by_dn.remove(dn)?;
        inner.release_slot(removed.slot);
        admin_info!(%dn, rules = removed.rules.len(), "removed rules");
        self.bump();
        Some(removed)
    }

    /// Remove the rule whose raw text is `value`. The container is dropped
    /// and the remaining rules are inserted again, so the container may come
    /// back under a different slot.
    pub fn remove_value(&mut self, dn: &Dn, value: &str) -> bool {
        let Some(removed) = self.remove(dn) else {
            return false;
        };
        let before = removed.rules.len();
        let keep: Vec<RuleRecord> = removed
            .rules
            .iter()
            .filter(|r| r.text.trim() != value.trim())
            .map(|r| r.as_ref().clone())
            .collect();
        let found = keep.len() != before;
        for rule in keep {
            self.insert(rule);
        }
        found
    }

    /// Remove every container at or below `base`.
    pub fn remove_subtree(&mut self, base: &Dn) -> usize {
        let doomed: Vec<Dn> = self
            .inner
            .by_dn
            .keys()
            .filter(|dn| base.is_suffix_of(dn))
            .cloned()
            .collect();
        for dn in &doomed {
            self.remove(dn);
        }
        doomed.len()
    }

    /// Move every container at or below `old` under `new`. Rules keep their
    /// ids and the containers keep their slots. Target DNs below `old` are
    /// rewritten to follow the move.
    pub fn rename(&mut self, old: &Dn, new: &Dn) -> usize {
        let inner = self.inner.get_mut();
        let moving: Vec<Dn> = inner
            .by_dn
            .keys()
            .filter(|dn| old.is_suffix_of(dn))
            .cloned()
            .collect();
        if moving.is_empty() {
            return 0;
        }

        for dn in &moving {
            let Some(c) = inner.by_dn.remove(dn) else {
                continue;
            };
            let Some(moved_dn) = dn.rebase(old, new) else {
                continue;
            };
            let container = RuleContainer {
                dn: moved_dn.clone(),
                slot: c.slot,
                rules: c
                    .rules
                    .iter()
                    .map(|r| Arc::new(r.relocated(old, new)))
                    .collect(),
            };
            admin_info!(from = %dn, to = %moved_dn, "relocated rules");
            if let Some(existing) = inner.by_dn.get_mut(&moved_dn) {
                // Merge with rules already defined at the destination.
                let slot = container.slot;
                Arc::make_mut(existing).rules.extend(container.rules);
                inner.release_slot(slot);
            } else {
                inner.by_dn.insert(moved_dn, Arc::new(container));
            }
        }
        self.bump();
        moving.len()
    }

    pub fn commit(self) {
        admin_debug!(signature = %self.inner.signature, "committing rule index");
        self.inner.commit();
    }
}

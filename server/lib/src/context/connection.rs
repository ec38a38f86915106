//! Attribute answers kept on a connection between operations.
//!
//! The answers are only reused by an operation of the same bind identity
//! while the rule index signature they were computed under is unchanged.

use std::sync::Mutex;

use super::{AttrEvalContext, ContextState, EvaluationContext};
use crate::index::Signature;
use crate::prelude::*;

#[derive(Debug)]
struct Saved {
    signature: Signature,
    bind: Option<Dn>,
    eval: AttrEvalContext,
}

#[derive(Debug, Default)]
pub struct ConnectionCache {
    inner: Mutex<Option<Saved>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the saved answers into `ctx` when they still apply, otherwise
    /// drop them.
    pub(crate) fn load_into(&self, ctx: &mut EvaluationContext, signature: Signature) {
        let Ok(mut inner) = self.inner.lock() else {
            security_error!("Unable to lock connection evaluation cache");
            return;
        };
        match inner.as_ref() {
            Some(saved) if saved.signature == signature && saved.bind == ctx.bind => {
                cache_trace!(%signature, attrs = saved.eval.attrs().len(), "reusing connection evaluation context");
                ctx.prev_op.clear();
                ctx.prev_op.copy_from(&saved.eval, false);
                ctx.state |= ContextState::HAS_CONNECTION_CONTEXT;
            }
            Some(_) => {
                cache_trace!(%signature, "connection evaluation context is out of date");
                *inner = None;
            }
            None => {}
        }
    }

    /// Save answers for the next operation. With `attrs_only` the answers
    /// are merged into what is already saved.
    pub(crate) fn store(
        &self,
        signature: Signature,
        bind: Option<Dn>,
        eval: &AttrEvalContext,
        attrs_only: bool,
    ) {
        let Ok(mut inner) = self.inner.lock() else {
            security_error!("Unable to lock connection evaluation cache");
            return;
        };
        match inner.as_mut() {
            Some(saved) if attrs_only && saved.signature == signature && saved.bind == bind => {
                saved.eval.copy_from(eval, true);
            }
            _ => {
                let mut copy = AttrEvalContext::new();
                copy.copy_from(eval, attrs_only);
                *inner = Some(Saved {
                    signature,
                    bind,
                    eval: copy,
                });
            }
        }
    }

    /// Forget everything, for example after a rebind.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = None;
        }
    }

    pub fn is_populated(&self) -> bool {
        self.inner.lock().map(|i| i.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with(attr: &str) -> AttrEvalContext {
        let mut e = AttrEvalContext::new();
        if let Some(a) = e.get_or_insert(attr) {
            a.store(AccessRights::READ, true, None);
        }
        e
    }

    #[test]
    fn test_connection_cache_reuse_requires_same_bind_and_signature() {
        sketching::test_init();
        let alice = Dn::new("uid=alice,dc=example,dc=com").ok();
        let bob = Dn::new("uid=bob,dc=example,dc=com").ok();
        let sig = Signature::initial();
        let cache = ConnectionCache::new();
        cache.store(sig, alice.clone(), &eval_with("cn"), false);
        assert!(cache.is_populated());

        let mut ctx = EvaluationContext::new(4, 4);
        ctx.bind = alice.clone();
        cache.load_into(&mut ctx, sig);
        assert!(ctx.state().contains(ContextState::HAS_CONNECTION_CONTEXT));
        assert!(ctx.prev_op.find("cn").is_some());

        let mut other = EvaluationContext::new(4, 4);
        other.bind = bob;
        cache.load_into(&mut other, sig);
        assert!(!other.state().contains(ContextState::HAS_CONNECTION_CONTEXT));
        assert!(!cache.is_populated());

        cache.store(sig, alice.clone(), &eval_with("cn"), false);
        let mut stale = EvaluationContext::new(4, 4);
        stale.bind = alice;
        cache.load_into(&mut stale, sig.next());
        assert!(stale.prev_op.is_empty());
        assert!(!cache.is_populated());
    }

    #[test]
    fn test_connection_cache_incremental_store() {
        sketching::test_init();
        let sig = Signature::initial();
        let cache = ConnectionCache::new();
        cache.store(sig, None, &eval_with("cn"), false);
        cache.store(sig, None, &eval_with("mail"), true);

        let mut ctx = EvaluationContext::new(4, 4);
        cache.load_into(&mut ctx, sig);
        assert!(ctx.prev_op.find("cn").is_some());
        assert!(ctx.prev_op.find("mail").is_some());
    }
}

//! A fixed set of evaluation contexts shared by all operation threads.
//!
//! A context is checked out with [`ContextPool::acquire`] and comes back
//! when the [`ContextGuard`] drops, on every exit path. Each checkout gets a
//! new generation number so state from an earlier operation can be told
//! apart from the current one. Nested checks made on behalf of an operation
//! that already holds a context use [`ContextPool::detached`] instead.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::EvaluationContext;
use crate::config::AclConfig;
use crate::prelude::*;

pub struct ContextPool {
    free: Mutex<VecDeque<EvaluationContext>>,
    generation: AtomicU64,
    size: usize,
    max_selected: usize,
    result_cache_size: usize,
}

impl ContextPool {
    pub fn new(size: usize, max_selected: usize, result_cache_size: usize) -> Self {
        let free = (0..size)
            .map(|_| EvaluationContext::new(max_selected, result_cache_size))
            .collect();
        ContextPool {
            free: Mutex::new(free),
            generation: AtomicU64::new(0),
            size,
            max_selected,
            result_cache_size,
        }
    }

    pub fn from_config(config: &AclConfig) -> Self {
        ContextPool::new(
            config.pool_size(),
            config.max_selected_rules,
            config.result_cache_size,
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn acquire(&self) -> Result<ContextGuard<'_>, OperationError> {
        let mut guard = self.free.lock().map_err(|e| {
            security_error!(err = ?e, "Unable to lock evaluation context pool");
            OperationError::InvalidState
        })?;
        let Some(mut ctx) = guard.pop_front() else {
            security_error!(size = self.size, "Evaluation context pool exhausted");
            return Err(OperationError::PoolExhausted);
        };
        drop(guard);

        ctx.generation = self.next_generation();
        Ok(ContextGuard {
            pool: Some(self),
            ctx: Some(ctx),
        })
    }

    /// A fresh context outside the pool, dropped rather than returned.
    pub fn detached(&self) -> ContextGuard<'_> {
        let mut ctx = EvaluationContext::new(self.max_selected, self.result_cache_size);
        ctx.generation = self.next_generation();
        ContextGuard {
            pool: None,
            ctx: Some(ctx),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn release(&self, mut ctx: EvaluationContext) {
        ctx.reset();
        match self.free.lock() {
            Ok(mut free) => free.push_back(ctx),
            Err(e) => {
                error!(err = ?e, "Unable to return evaluation context to pool");
            }
        }
    }
}

pub struct ContextGuard<'a> {
    pool: Option<&'a ContextPool>,
    ctx: Option<EvaluationContext>,
}

impl ContextGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.ctx.as_ref().map(|c| c.generation).unwrap_or(0)
    }
}

impl Deref for ContextGuard<'_> {
    type Target = EvaluationContext;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &EvaluationContext {
        self.ctx
            .as_ref()
            .expect("Evaluation context used after release")
    }
}

impl DerefMut for ContextGuard<'_> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut EvaluationContext {
        self.ctx
            .as_mut()
            .expect("Evaluation context used after release")
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut dropping = None;
        std::mem::swap(&mut dropping, &mut self.ctx);
        if let (Some(ctx), Some(pool)) = (dropping, self.pool) {
            pool.release(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextState;

    #[test]
    fn test_pool_exhaustion_and_return() {
        sketching::test_init();
        let pool = ContextPool::new(2, 4, 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.acquire().err(), Some(OperationError::PoolExhausted));
        assert!(b.generation() > a.generation());
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_resets_on_return() {
        sketching::test_init();
        let pool = ContextPool::new(1, 4, 4);
        let first_gen = {
            let mut ctx = pool.acquire().unwrap();
            ctx.state |= ContextState::UPDATE;
            ctx.stats.entries = 9;
            ctx.generation()
        };
        let ctx = pool.acquire().unwrap();
        assert!(ctx.state().is_empty());
        assert_eq!(ctx.stats().entries, 0);
        assert_ne!(ctx.generation(), first_gen);
    }

    #[test]
    fn test_pool_returns_on_early_exit() {
        sketching::test_init();
        let pool = ContextPool::new(1, 4, 4);
        let early = |fail: bool| -> Result<(), OperationError> {
            let _ctx = pool.acquire()?;
            if fail {
                return Err(OperationError::InvalidState);
            }
            Ok(())
        };
        assert!(early(true).is_err());
        assert!(early(false).is_ok());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_detached_context_leaves_pool_alone() {
        sketching::test_init();
        let pool = ContextPool::new(1, 4, 4);
        let held = pool.acquire().unwrap();
        let extra = pool.detached();
        assert!(extra.generation() > held.generation());
        assert_eq!(pool.available(), 0);
        drop(extra);
        assert_eq!(pool.available(), 0);
        drop(held);
        assert_eq!(pool.available(), 1);
    }
}

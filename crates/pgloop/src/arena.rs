//! Bulk-freed text arenas.
//!
//! A pipeline copies every statement and parameter into one arena and frees
//! them all at once when it tears down. Arenas are recycled through an
//! [`ArenaPool`]; the process-wide pool is reached through [`borrow`].

use std::ops::{Deref, Range};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::Error;

/// Arenas kept by the global pool.
const GLOBAL_RETAINED: usize = 64;

/// Arenas larger than this are not recycled.
const MAX_RECYCLED_CAPACITY: usize = 64 * 1024;

static GLOBAL: Lazy<ArenaPool> = Lazy::new(|| ArenaPool::new(GLOBAL_RETAINED));

/// Borrow an arena from the process-wide pool.
///
/// The arena goes back to the pool, emptied, when the guard drops.
#[must_use]
pub fn borrow() -> PooledArena {
    GLOBAL.borrow()
}

/// A growable text region freed in bulk.
///
/// Clones share the same region.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    inner: Arc<Mutex<ArenaBuf>>,
}

#[derive(Debug, Default)]
struct ArenaBuf {
    text: String,
    allocations: usize,
    generation: u64,
}

/// A span of text stored in an arena.
#[derive(Debug, Clone)]
pub(crate) struct ArenaStr {
    range: Range<usize>,
    generation: u64,
}

impl Arena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an arena with room for `bytes` of text.
    #[must_use]
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ArenaBuf {
                text: String::with_capacity(bytes),
                ..ArenaBuf::default()
            })),
        }
    }

    /// Bytes currently stored.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().text.len()
    }

    /// Number of strings stored since the last reset.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.inner.lock().allocations
    }

    /// Free everything at once.
    ///
    /// Spans handed out before the reset no longer resolve.
    pub fn reset(&self) {
        let mut buf = self.inner.lock();
        buf.text.clear();
        buf.allocations = 0;
        buf.generation += 1;
    }

    pub(crate) fn alloc_str(&self, s: &str) -> ArenaStr {
        let mut buf = self.inner.lock();
        let start = buf.text.len();
        buf.text.push_str(s);
        buf.allocations += 1;
        ArenaStr {
            range: start..buf.text.len(),
            generation: buf.generation,
        }
    }

    /// Run `f` with a statement and its parameters borrowed from the arena.
    pub(crate) fn with_statement<R>(
        &self,
        sql: &ArenaStr,
        params: &[Option<ArenaStr>],
        f: impl FnOnce(&str, &[Option<&str>]) -> R,
    ) -> Result<R, Error> {
        let buf = self.inner.lock();
        let sql = buf.get(sql)?;
        let params = params
            .iter()
            .map(|p| p.as_ref().map(|p| buf.get(p)).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(f(sql, &params))
    }

    /// Copy a span back out of the arena.
    #[cfg(test)]
    pub(crate) fn resolve(&self, span: &ArenaStr) -> Result<String, Error> {
        self.inner.lock().get(span).map(str::to_string)
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    fn capacity(&self) -> usize {
        self.inner.lock().text.capacity()
    }
}

impl ArenaBuf {
    fn get(&self, span: &ArenaStr) -> Result<&str, Error> {
        if span.generation != self.generation {
            return Err(Error::ArenaReset);
        }
        self.text.get(span.range.clone()).ok_or(Error::ArenaReset)
    }
}

/// A recycler of arenas with bounded retention.
#[derive(Debug, Clone)]
pub struct ArenaPool {
    inner: Arc<ArenaPoolInner>,
}

#[derive(Debug)]
struct ArenaPoolInner {
    free: Mutex<Vec<Arena>>,
    max_retained: usize,
}

impl ArenaPool {
    /// Create a pool that keeps at most `max_retained` idle arenas.
    #[must_use]
    pub fn new(max_retained: usize) -> Self {
        Self {
            inner: Arc::new(ArenaPoolInner {
                free: Mutex::new(Vec::new()),
                max_retained,
            }),
        }
    }

    /// Take an idle arena or create a new one.
    #[must_use]
    pub fn borrow(&self) -> PooledArena {
        let arena = self.inner.free.lock().pop().unwrap_or_default();
        PooledArena {
            arena,
            pool: self.clone(),
        }
    }

    /// Number of idle arenas held.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    fn recycle(&self, arena: Arena) {
        // Arenas still referenced elsewhere, or grown unusually large, are
        // simply dropped.
        if arena.is_shared() || arena.capacity() > MAX_RECYCLED_CAPACITY {
            return;
        }
        arena.reset();
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.max_retained {
            free.push(arena);
        }
    }
}

/// An arena borrowed from an [`ArenaPool`], returned on drop.
#[derive(Debug)]
pub struct PooledArena {
    arena: Arena,
    pool: ArenaPool,
}

impl Deref for PooledArena {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        &self.arena
    }
}

impl Drop for PooledArena {
    fn drop(&mut self) {
        self.pool.recycle(std::mem::take(&mut self.arena));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_resolve() {
        let arena = Arena::new();
        let sql = arena.alloc_str("SELECT $1");
        let param = arena.alloc_str("42");
        assert_eq!(arena.allocations(), 2);
        assert_eq!(arena.used_bytes(), 11);

        let seen = arena
            .with_statement(&sql, &[Some(param), None], |sql, params| {
                (sql.to_string(), params.len(), params[0].map(str::to_string))
            })
            .unwrap();
        assert_eq!(seen, ("SELECT $1".to_string(), 2, Some("42".to_string())));
    }

    #[test]
    fn test_reset_invalidates_spans() {
        let arena = Arena::new();
        let span = arena.alloc_str("gone");
        arena.reset();
        assert_eq!(arena.used_bytes(), 0);
        assert_eq!(arena.resolve(&span), Err(Error::ArenaReset));

        // A new allocation at the same offset does not revive the old span.
        arena.alloc_str("back");
        assert_eq!(arena.resolve(&span), Err(Error::ArenaReset));
    }

    #[test]
    fn test_pool_recycles_empty_arenas() {
        let pool = ArenaPool::new(1);
        {
            let a = pool.borrow();
            a.alloc_str("hello");
            let _b = pool.borrow();
        }
        assert_eq!(pool.idle(), 1);

        let again = pool.borrow();
        assert_eq!(again.used_bytes(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_shared_arena_not_recycled() {
        let pool = ArenaPool::new(4);
        let pooled = pool.borrow();
        let clone = (*pooled).clone();
        drop(pooled);
        assert_eq!(pool.idle(), 0);
        assert_eq!(clone.allocations(), 0);
    }

    #[test]
    fn test_global_borrow() {
        let arena = borrow();
        let span = arena.alloc_str("x");
        assert_eq!(arena.resolve(&span).unwrap(), "x");
    }
}

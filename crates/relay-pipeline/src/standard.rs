//! `StandardPipeline`: a fixed command-type pipeline with a priority-ordered
//! middleware chain cached behind an `ArcSwap` snapshot for lock-free
//! dispatch (§4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use relay_core::command::{Command, Priority};
use relay_core::context::CommandContext;
use relay_core::error::{RelayError, RelayErrorKind, RelayResult};
use relay_core::interceptor::Interceptor;
use relay_core::middleware::{Middleware, NextFn};
use relay_core::semaphore::{Semaphore, SemaphoreConfig};
use relay_core::Handler;

use crate::chain::ChainBuilder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MiddlewareId(u64);

struct Entry<C: Command> {
    id: MiddlewareId,
    priority: Priority,
    seq: u64,
    middleware: Arc<dyn Middleware<C>>,
}

/// A pipeline dedicated to a single `Command` type, the common case for a
/// service handling one well-known request shape end to end.
pub struct StandardPipeline<C: Command, H: Handler<C>> {
    handler: Arc<H>,
    entries: Mutex<Vec<Entry<C>>>,
    interceptors: Mutex<Vec<Arc<dyn Interceptor<C>>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    max_depth: Option<usize>,
    semaphore: Option<Semaphore>,
    cached_chain: ArcSwapOption<NextFn<C>>,
}

impl<C: Command, H: Handler<C>> StandardPipeline<C, H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            entries: Mutex::new(Vec::new()),
            interceptors: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            max_depth: None,
            semaphore: None,
            cached_chain: ArcSwapOption::from(None),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    /// Gates `execute` behind an admission semaphore (§4.5 step 2). Each
    /// execution acquires a token before running interceptors/chain and
    /// releases it on every exit path via the token's `Drop`.
    pub fn with_semaphore(mut self, config: SemaphoreConfig) -> Self {
        self.semaphore = Some(Semaphore::new(config));
        self
    }

    /// Registers a middleware at the given priority. Fails with
    /// `MaxDepthExceeded` — leaving the list unchanged — if a depth cap was
    /// configured and this insertion would exceed it (P2/S2). Insertion
    /// order is preserved for stable tie-breaking among equal priorities (P1).
    pub fn add_middleware(
        &self,
        middleware: Arc<dyn Middleware<C>>,
        priority: Priority,
    ) -> RelayResult<MiddlewareId> {
        let mut entries = self.entries.lock();
        if let Some(max) = self.max_depth {
            if entries.len() >= max {
                return Err(RelayError::new(RelayErrorKind::MaxDepthExceeded {
                    len: entries.len() + 1,
                    max,
                }));
            }
        }
        let id = MiddlewareId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry {
            id,
            priority,
            seq,
            middleware,
        });
        drop(entries);
        self.invalidate_cache();
        Ok(id)
    }

    /// Convenience that reads `middleware.priority()` instead of taking an
    /// explicit one.
    pub fn add(&self, middleware: Arc<dyn Middleware<C>>) -> RelayResult<MiddlewareId> {
        let priority = middleware.priority();
        self.add_middleware(middleware, priority)
    }

    /// Bulk registration: fails before appending any of `items` if the
    /// total would exceed `max_depth`, so a rejected batch leaves the list
    /// completely unchanged.
    pub fn add_middlewares(
        &self,
        items: Vec<(Arc<dyn Middleware<C>>, Priority)>,
    ) -> RelayResult<Vec<MiddlewareId>> {
        let mut entries = self.entries.lock();
        if let Some(max) = self.max_depth {
            let prospective = entries.len() + items.len();
            if prospective > max {
                return Err(RelayError::new(RelayErrorKind::MaxDepthExceeded {
                    len: prospective,
                    max,
                }));
            }
        }
        let mut ids = Vec::with_capacity(items.len());
        for (middleware, priority) in items {
            let id = MiddlewareId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            entries.push(Entry {
                id,
                priority,
                seq,
                middleware,
            });
            ids.push(id);
        }
        drop(entries);
        self.invalidate_cache();
        Ok(ids)
    }

    /// Removes the middleware with this id, if present. Preserves relative
    /// order of the remaining entries.
    pub fn remove_middleware(&self, id: MiddlewareId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        drop(entries);
        if removed {
            self.invalidate_cache();
        }
        removed
    }

    pub fn clear_middlewares(&self) {
        self.entries.lock().clear();
        self.invalidate_cache();
    }

    pub fn middleware_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// The `name()` of each registered middleware, in current sort order.
    pub fn middleware_types(&self) -> Vec<String> {
        self.ordered_middleware()
            .iter()
            .map(|mw| mw.name().to_string())
            .collect()
    }

    pub fn has_middleware(&self, name: &str) -> bool {
        self.entries.lock().iter().any(|entry| entry.middleware.name() == name)
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor<C>>) {
        self.interceptors.lock().push(interceptor);
    }

    pub fn clear_interceptors(&self) {
        self.interceptors.lock().clear();
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptors.lock().len()
    }

    fn invalidate_cache(&self) {
        self.cached_chain.store(None);
    }

    fn ordered_middleware(&self) -> Vec<Arc<dyn Middleware<C>>> {
        let mut entries: Vec<(Priority, u64, Arc<dyn Middleware<C>>)> = self
            .entries
            .lock()
            .iter()
            .map(|entry| (entry.priority, entry.seq, Arc::clone(&entry.middleware)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, _, mw)| mw).collect()
    }

    fn chain(&self) -> RelayResult<NextFn<C>> {
        if let Some(cached) = self.cached_chain.load_full() {
            return Ok((*cached).clone());
        }
        let mut builder = ChainBuilder::new().extend(self.ordered_middleware());
        if let Some(max_depth) = self.max_depth {
            builder = builder.with_max_depth(max_depth);
        }
        let built = builder.build(Arc::clone(&self.handler))?;
        self.cached_chain.store(Some(Arc::new(built.clone())));
        Ok(built)
    }

    async fn apply_interceptors(&self, mut command: C) -> RelayResult<C> {
        let interceptors: Vec<Arc<dyn Interceptor<C>>> = self.interceptors.lock().clone();
        for interceptor in interceptors {
            command = interceptor.apply(command).await?;
        }
        Ok(command)
    }

    /// The full execution path (§4.5): cancellation check, admission,
    /// interceptors, request-id/start-time priming, then the middleware
    /// chain (or the handler directly if the chain is empty).
    pub async fn execute(&self, command: C, ctx: Arc<CommandContext>) -> RelayResult<C::Result> {
        ctx.cancellation().check_cancel("before_start")?;

        let _token = match &self.semaphore {
            Some(semaphore) => Some(semaphore.acquire().await?),
            None => None,
        };

        let command = self.apply_interceptors(command).await?;

        let _ = ctx.request_id();
        let _ = ctx.start_time();

        if self.middleware_count() == 0 {
            self.handler.handle(command, &ctx).await
        } else {
            let chain = self.chain()?;
            chain(command, ctx).await
        }
    }

    /// `execute` variant that builds its own [`CommandContext`] from a flat
    /// metadata map instead of taking a caller-supplied context (§4.5
    /// `execute(cmd, metadata?)`).
    pub async fn execute_with_metadata(
        &self,
        command: C,
        metadata: HashMap<String, String>,
    ) -> RelayResult<C::Result> {
        let ctx = Arc::new(CommandContext::new());
        for (key, value) in metadata {
            ctx.metadata_set(key, value);
        }
        self.execute(command, ctx).await
    }
}

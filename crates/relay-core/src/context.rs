//! `CommandContext`: the concurrent, typed side-channel threaded through a
//! command's whole middleware chain.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::cancel::Cancellation;

/// A typed slot identifier. Two keys with the same `name` but different `T`
/// are a caller bug (the same slot would be asked to hold two unrelated
/// types); keys are normally declared once as module-level `const`s.
pub struct TypedKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for TypedKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for TypedKey<T> {}

type BoxedValue = Box<dyn Any + Send + Sync>;

/// Per-command state shared by reference across the whole middleware chain:
/// a typed map, a freeform metadata bag, a request id and the cancellation
/// token for this execution.
pub struct CommandContext {
    typed: RwLock<HashMap<&'static str, BoxedValue>>,
    metadata: RwLock<HashMap<String, String>>,
    request_id: OnceLock<String>,
    start_time: OnceLock<Instant>,
    cancellation: Cancellation,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::with_cancellation(Cancellation::new())
    }

    pub fn with_cancellation(cancellation: Cancellation) -> Self {
        Self {
            typed: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            request_id: OnceLock::new(),
            start_time: OnceLock::new(),
            cancellation,
        }
    }

    /// Assigns a request id on first access if the caller never set one.
    pub fn request_id(&self) -> &str {
        self.request_id.get_or_init(|| Uuid::new_v4().to_string())
    }

    /// Lets a caller pin a pre-existing request id (e.g. one carried over
    /// from an inbound RPC). No-op if a request id was already established.
    pub fn set_request_id(&self, id: impl Into<String>) {
        let _ = self.request_id.set(id.into());
    }

    /// The instant execution for this command began, recorded lazily on
    /// first access so pipelines that never read it pay nothing for it.
    pub fn start_time(&self) -> Instant {
        *self.start_time.get_or_init(Instant::now)
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn get<T>(&self, key: &TypedKey<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.typed
            .read()
            .get(key.name)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn set<T>(&self, key: &TypedKey<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.typed.write().insert(key.name, Box::new(value));
    }

    pub fn remove<T>(&self, key: &TypedKey<T>)
    where
        T: Send + Sync + 'static,
    {
        self.typed.write().remove(key.name);
    }

    pub fn metadata_set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    pub fn metadata_get(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }

    pub fn metadata_snapshot(&self) -> HashMap<String, String> {
        self.metadata.read().clone()
    }
}

impl Default for CommandContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_generated_once() {
        let ctx = CommandContext::new();
        let first = ctx.request_id().to_string();
        let second = ctx.request_id().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn typed_slot_round_trips() {
        const USER_ID: TypedKey<u64> = TypedKey::new("user_id");
        let ctx = CommandContext::new();
        assert_eq!(ctx.get(&USER_ID), None);
        ctx.set(&USER_ID, 42);
        assert_eq!(ctx.get(&USER_ID), Some(42));
    }

    #[test]
    fn metadata_last_writer_wins() {
        let ctx = CommandContext::new();
        ctx.metadata_set("tenant", "a");
        ctx.metadata_set("tenant", "b");
        assert_eq!(ctx.metadata_get("tenant").as_deref(), Some("b"));
    }

    proptest::proptest! {
        /// §4.3: "writes are last-writer-wins" — for any sequence of values
        /// written to the same typed slot, a read afterwards observes the
        /// last one written, regardless of what came before it.
        #[test]
        fn typed_slot_always_observes_last_write(values in proptest::collection::vec(proptest::prelude::any::<u64>(), 1..50)) {
            const SLOT: TypedKey<u64> = TypedKey::new("proptest_slot");
            let ctx = CommandContext::new();
            for value in &values {
                ctx.set(&SLOT, *value);
            }
            prop_assert_eq!(ctx.get(&SLOT), Some(*values.last().unwrap()));
        }
    }
}

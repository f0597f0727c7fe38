//! Per-endpoint self-concurrency bookkeeping.
//!
//! Each endpoint owns one [`Coordinator`]. Admission, supersession and
//! settlement all happen synchronously under its mutex, so the slot table has a
//! single logical writer even when calls settle on different worker threads.
//!
//! Slots exist only for endpoints with an ignore or override policy; plain
//! endpoints only count in-flight calls for `pending`.

use crate::config::{ConcurrencyScope, FetchConfig};
use crate::handle::IgnoredCall;
use crate::hooks::Vars;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::Xxh3;

/// What to do when a call arrives while another one holds its identity's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Policy {
    /// Calls are independent
    Concurrent,
    /// Keep the running call; hand out the slot's ignored stub
    Ignore,
    /// Cancel the running call and take its slot
    Override,
}

impl Policy {
    /// `ignoreSelfConcurrent` wins when both flags are set.
    pub(crate) fn from_config(config: &FetchConfig) -> Self {
        if config.ignore_self_concurrent {
            Policy::Ignore
        } else if config.override_self_concurrent {
            Policy::Override
        } else {
            Policy::Concurrent
        }
    }
}

/// Key of an in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RequestIdentity {
    /// All calls to the endpoint
    Endpoint,
    /// xxh3 of method, URL and the call's merged data
    Fingerprint(u64),
}

impl RequestIdentity {
    pub(crate) fn for_call(config: &FetchConfig, vars: &Vars) -> Self {
        match config.concurrency_scope {
            ConcurrencyScope::Endpoint => RequestIdentity::Endpoint,
            ConcurrencyScope::Arguments => {
                let mut hasher = Xxh3::new();
                hasher.update(config.method.as_str().as_bytes());
                hasher.update(b"\n");
                hasher.update(config.url.as_bytes());
                hasher.update(b"\n");
                // serde_json maps are key-ordered, so this encoding is canonical
                hasher.update(&serde_json::to_vec(&vars.data).unwrap_or_default());
                RequestIdentity::Fingerprint(hasher.digest())
            }
        }
    }
}

struct Slot {
    generation: u64,
    cancel: CancellationToken,
    ignored: Arc<IgnoredCall>,
    /// Calls handed the stub while this slot was held
    ignored_calls: usize,
}

#[derive(Default)]
struct SlotTable {
    slots: HashMap<RequestIdentity, Slot>,
    in_flight: usize,
    next_generation: u64,
}

#[derive(Default)]
pub(crate) struct Coordinator {
    state: Mutex<SlotTable>,
}

pub(crate) enum Admission {
    Proceed(Ticket),
    Ignored(Arc<IgnoredCall>),
}

impl Coordinator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `true` while any call of this endpoint is in flight.
    pub(crate) fn pending(&self) -> bool {
        self.state.lock().in_flight > 0
    }

    pub(crate) fn admit(self: &Arc<Self>, policy: Policy, identity: RequestIdentity) -> Admission {
        let mut table = self.state.lock();
        let cancel = CancellationToken::new();

        let slot_key = match policy {
            Policy::Concurrent => None,
            Policy::Ignore => {
                if let Some(slot) = table.slots.get_mut(&identity) {
                    slot.ignored_calls += 1;
                    return Admission::Ignored(Arc::clone(&slot.ignored));
                }
                Some(identity)
            }
            Policy::Override => {
                if let Some(previous) = table.slots.remove(&identity) {
                    tracing::debug!(
                        generation = previous.generation,
                        "superseding in-flight call"
                    );
                    previous.cancel.cancel();
                }
                Some(identity)
            }
        };

        table.in_flight += 1;
        let slot = slot_key.map(|identity| {
            table.next_generation += 1;
            let generation = table.next_generation;
            table.slots.insert(
                identity,
                Slot {
                    generation,
                    cancel: cancel.clone(),
                    ignored: Arc::new(IgnoredCall::default()),
                    ignored_calls: 0,
                },
            );
            (identity, generation)
        });

        Admission::Proceed(Ticket {
            coordinator: Arc::clone(self),
            slot,
            cancel,
            released: false,
        })
    }

    /// Drop the caller's claim; returns whether it still owned its slot.
    fn release(&self, slot: Option<(RequestIdentity, u64)>) -> bool {
        let mut table = self.state.lock();
        table.in_flight = table.in_flight.saturating_sub(1);
        let Some((identity, generation)) = slot else {
            return true;
        };
        match table.slots.get(&identity) {
            Some(current) if current.generation == generation => {
                if current.ignored_calls > 0 {
                    tracing::debug!(
                        generation,
                        ignored = current.ignored_calls,
                        "slot released after ignoring concurrent calls"
                    );
                }
                table.slots.remove(&identity);
                true
            }
            _ => false,
        }
    }
}

/// One admitted call's claim on its endpoint. Released exactly once, on
/// [`Ticket::settle`] or on drop.
pub(crate) struct Ticket {
    coordinator: Arc<Coordinator>,
    slot: Option<(RequestIdentity, u64)>,
    cancel: CancellationToken,
    released: bool,
}

impl Ticket {
    /// Fires when a newer call supersedes this one.
    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Release the claim. `false` means the call was superseded and its result
    /// must be discarded.
    pub(crate) fn settle(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.coordinator.release(self.slot) && !self.cancel.is_cancelled()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.coordinator.release(self.slot);
        }
    }
}

//! Distribution policies: which members of a subscriber group get a tuple.
//!
//! Control tuples (window boundaries) never go through a policy; every member
//! receives them. A policy only picks recipients for payload tuples that have
//! already passed the group's partition filter.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use smallvec::{smallvec, SmallVec};

use super::{BufferServerError, ConnectionRef};
use crate::protocol::{Data, PolicyType};

/// Indices into the member slice handed to [`Policy::select`].
pub type Selection = SmallVec<[usize; 4]>;

/// Picks recipients for a payload tuple.
pub trait Policy: Send + Sync + fmt::Debug {
    /// Short policy name for logging.
    fn name(&self) -> &str;

    /// Returns the indices of `members` that should receive `data`.
    ///
    /// An empty member slice yields an empty selection.
    fn select(&self, members: &[ConnectionRef], data: &Data) -> Selection;
}

/// Every member receives every tuple.
#[derive(Debug, Default, Clone, Copy)]
pub struct GiveAll;

impl Policy for GiveAll {
    fn name(&self) -> &str {
        "give_all"
    }

    fn select(&self, members: &[ConnectionRef], _data: &Data) -> Selection {
        (0..members.len()).collect()
    }
}

/// The member with the smallest backlog receives the tuple; ties go to the
/// earliest member.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastBusy;

impl Policy for LeastBusy {
    fn name(&self) -> &str {
        "least_busy"
    }

    fn select(&self, members: &[ConnectionRef], _data: &Data) -> Selection {
        members
            .iter()
            .enumerate()
            .min_by_key(|(_, member)| member.backlog())
            .map(|(index, _)| smallvec![index])
            .unwrap_or_default()
    }
}

/// One uniformly random member receives the tuple.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOne;

impl Policy for RandomOne {
    fn name(&self) -> &str {
        "random_one"
    }

    fn select(&self, members: &[ConnectionRef], _data: &Data) -> Selection {
        if members.is_empty() {
            return Selection::new();
        }
        smallvec![rand::thread_rng().gen_range(0..members.len())]
    }
}

/// Members receive tuples in cyclic order.
///
/// With a stable membership of K, every K consecutive payloads hit every
/// member exactly once.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    /// Creates a new round-robin policy starting at the first member.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Policy for RoundRobin {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select(&self, members: &[ConnectionRef], _data: &Data) -> Selection {
        if members.is_empty() {
            return Selection::new();
        }
        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        smallvec![turn % members.len()]
    }
}

/// Factory for a custom policy; each subscriber group gets its own instance.
pub type PolicyFactory = Arc<dyn Fn() -> Box<dyn Policy> + Send + Sync>;

/// Resolves a [`PolicyType`] into a policy instance.
///
/// Built-in policies always resolve. `Custom(name)` resolves only if a
/// factory was registered under `name`.
#[derive(Default)]
pub struct PolicyRegistry {
    custom: RwLock<HashMap<String, PolicyFactory>>,
}

impl PolicyRegistry {
    /// Creates a registry with no custom policies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom policy factory, replacing any previous one of the same name.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Policy> + Send + Sync + 'static,
    ) {
        self.custom.write().insert(name.into(), Arc::new(factory));
    }

    /// Creates a fresh policy instance for `policy_type`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferServerError::UnknownPolicy`] if a custom policy name is
    /// not registered.
    pub fn resolve(&self, policy_type: &PolicyType) -> Result<Box<dyn Policy>, BufferServerError> {
        match policy_type {
            PolicyType::GiveAll => Ok(Box::new(GiveAll)),
            PolicyType::LeastBusy => Ok(Box::new(LeastBusy)),
            PolicyType::RandomOne => Ok(Box::new(RandomOne)),
            PolicyType::RoundRobin => Ok(Box::new(RoundRobin::new())),
            PolicyType::Custom(name) => {
                let factory = self
                    .custom
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BufferServerError::UnknownPolicy(name.clone()))?;
                Ok(factory())
            }
        }
    }

    /// Returns the names of all registered custom policies.
    #[must_use]
    pub fn custom_policies(&self) -> Vec<String> {
        self.custom.read().keys().cloned().collect()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("custom", &self.custom_policies())
            .finish()
    }
}

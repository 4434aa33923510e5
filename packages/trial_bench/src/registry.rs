use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Fixture, FixtureSlot};

/// Identifies one logical fixture slot: a name plus the fixture type stored under it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FixtureKey {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
}

impl FixtureKey {
    /// The key of the slot named `name` holding fixtures of type `F`.
    #[must_use]
    pub fn of<F: Fixture>(name: &'static str) -> Self {
        Self {
            name,
            type_id: TypeId::of::<F>(),
            type_name: type_name::<F>(),
        }
    }

    /// Name of the slot.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.type_name)
    }
}

/// Owns the fixture slots of every benchmark executed through it.
///
/// The registry is an ordinary value owned by whoever drives the benchmarks and passed to the
/// harness explicitly. Two registries never share fixtures.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use trial_bench::{BoxedError, Fixture, FixtureRegistry, Params};
///
/// #[derive(Debug)]
/// struct Empty;
///
/// impl Fixture for Empty {
///     fn from_params(_: &Params) -> Result<Self, BoxedError> {
///         Ok(Self)
///     }
/// }
///
/// let registry = FixtureRegistry::new();
/// let first = registry.slot::<Empty>("empty");
/// let second = registry.slot::<Empty>("empty");
///
/// assert!(Arc::ptr_eq(&first, &second));
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Default)]
pub struct FixtureRegistry {
    slots: Mutex<HashMap<FixtureKey, Arc<dyn Any + Send + Sync>>>,
}

impl FixtureRegistry {
    /// Creates a registry without any slots.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for fixtures of type `F` under `name`, creating it on first use.
    #[must_use]
    pub fn slot<F: Fixture>(&self, name: &'static str) -> Arc<FixtureSlot<F>> {
        let key = FixtureKey::of::<F>(name);

        let slot = Arc::clone(
            self.slots
                .lock()
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(FixtureSlot::<F>::new(name)) as Arc<dyn Any + Send + Sync>
                }),
        );

        slot.downcast::<FixtureSlot<F>>()
            .expect("the key includes the TypeId of F, so the slot under it always holds F")
    }

    /// Number of slots created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// The keys of all slots created so far.
    #[must_use]
    pub fn keys(&self) -> Vec<FixtureKey> {
        self.slots.lock().keys().copied().collect()
    }
}

impl fmt::Debug for FixtureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("keys", &self.keys())
            .finish()
    }
}

//! Type-indexed extension registry.
//!
//! # Responsibility
//! - Construct extensions only when their applicability test holds.
//! - Keep live instances grouped by capability type (the trait-object type).
//! - Return instances of one type ordered by that type's priority relation.
//!
//! # Invariants
//! - A singleton type never holds more than one live instance.
//! - Ordering is a stable sort over registration order, so ties keep the
//!   order in which extensions were registered.
//! - Teardown shuts instances down in reverse registration order.
//! - Construction failures are an outcome, not an error: they are logged and
//!   the registry stays usable.

use super::Extension;
use log::{debug, info, warn};
use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Handle returned for every successful registration.
pub type ExtensionId = Uuid;

type PrecedesFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// "Not applicable on this host" outcome of an extension constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUnavailable {
    pub reason: String,
}

impl ProviderUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Display for ProviderUnavailable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider unavailable: {}", self.reason)
    }
}

impl Error for ProviderUnavailable {}

/// Registry misuse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionRegistryError {
    UnregisteredType(&'static str),
}

impl Display for ExtensionRegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnregisteredType(name) => {
                write!(f, "extension type is not registered: {name}")
            }
        }
    }
}

impl Error for ExtensionRegistryError {}

/// Declaration of one capability type.
pub struct TypeSpec<T: ?Sized> {
    name: &'static str,
    singleton: bool,
    precedes: Option<PrecedesFn<T>>,
}

impl<T: ?Sized + 'static> TypeSpec<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            singleton: false,
            precedes: None,
        }
    }

    /// At most one live instance of this type may exist.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// Strict ordering relation: `precedes(a, b)` means `a` has priority.
    pub fn ordered_by(mut self, precedes: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.precedes = Some(Arc::new(precedes));
        self
    }
}

struct RegisteredExtension {
    id: ExtensionId,
    seq: u64,
    extension_id: String,
    // Always an `Arc<T>` for the slot's `T`.
    instance: Box<dyn Any + Send + Sync>,
    shutdown: Box<dyn Fn() + Send + Sync>,
}

struct TypeSlot {
    name: &'static str,
    singleton: bool,
    // Always an `Option<PrecedesFn<T>>` for the slot's `T`.
    precedes: Box<dyn Any + Send + Sync>,
    entries: Vec<RegisteredExtension>,
}

/// Owned registry of live extensions, keyed by capability type.
#[derive(Default)]
pub struct ExtensionRegistry {
    types: HashMap<TypeId, TypeSlot>,
    next_seq: u64,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares one capability type. Re-declaring replaces name, singleton
    /// flag and ordering while keeping live instances.
    pub fn register_type<T>(&mut self, spec: TypeSpec<T>)
    where
        T: ?Sized + Extension + 'static,
    {
        let slot = self.types.entry(TypeId::of::<T>()).or_insert_with(|| TypeSlot {
            name: spec.name,
            singleton: false,
            precedes: Box::new(None::<PrecedesFn<T>>),
            entries: Vec::new(),
        });
        slot.name = spec.name;
        slot.singleton = spec.singleton;
        slot.precedes = Box::new(spec.precedes);
    }

    pub fn has_type<T: ?Sized + 'static>(&self) -> bool {
        self.types.contains_key(&TypeId::of::<T>())
    }

    /// Attempts construction of one extension.
    ///
    /// Returns `Ok(Some(id))` when the instance was stored, `Ok(None)` when the
    /// applicability test failed, the constructor reported
    /// [`ProviderUnavailable`], or a singleton slot was already occupied.
    ///
    /// # Errors
    /// - [`ExtensionRegistryError::UnregisteredType`] when `T` was never declared.
    pub fn register<T, F, A>(
        &mut self,
        factory: F,
        applicable: A,
    ) -> Result<Option<ExtensionId>, ExtensionRegistryError>
    where
        T: ?Sized + Extension + 'static,
        F: FnOnce() -> Result<Arc<T>, ProviderUnavailable>,
        A: FnOnce() -> bool,
    {
        let seq = self.next_seq;
        let slot = self
            .types
            .get_mut(&TypeId::of::<T>())
            .ok_or(ExtensionRegistryError::UnregisteredType(
                std::any::type_name::<T>(),
            ))?;

        if slot.singleton && !slot.entries.is_empty() {
            info!(
                "event=extension_register module=registry status=skip type={} reason=singleton_occupied",
                slot.name
            );
            return Ok(None);
        }

        if !applicable() {
            debug!(
                "event=extension_register module=registry status=skip type={} reason=not_applicable",
                slot.name
            );
            return Ok(None);
        }

        let instance = match factory() {
            Ok(instance) => instance,
            Err(err) => {
                info!(
                    "event=extension_register module=registry status=skip type={} reason=unavailable detail={}",
                    slot.name, err.reason
                );
                return Ok(None);
            }
        };

        let id = Uuid::new_v4();
        let extension_id = instance.id().to_string();
        let for_shutdown = Arc::clone(&instance);
        slot.entries.push(RegisteredExtension {
            id,
            seq,
            extension_id: extension_id.clone(),
            instance: Box::new(instance),
            shutdown: Box::new(move || for_shutdown.shutdown()),
        });
        self.next_seq += 1;

        info!(
            "event=extension_register module=registry status=ok type={} extension={}",
            slot.name, extension_id
        );
        Ok(Some(id))
    }

    /// Registers an already constructed instance.
    pub fn register_instance<T>(
        &mut self,
        instance: Arc<T>,
    ) -> Result<Option<ExtensionId>, ExtensionRegistryError>
    where
        T: ?Sized + Extension + 'static,
    {
        self.register(move || Ok(instance), || true)
    }

    /// Returns live instances of `T`, highest priority first.
    pub fn extensions_of<T>(&self) -> Vec<Arc<T>>
    where
        T: ?Sized + Extension + 'static,
    {
        let Some(slot) = self.types.get(&TypeId::of::<T>()) else {
            return vec![];
        };

        let mut ordered: Vec<(u64, Arc<T>)> = slot
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .instance
                    .downcast_ref::<Arc<T>>()
                    .map(|instance| (entry.seq, Arc::clone(instance)))
            })
            .collect();
        ordered.sort_by_key(|(seq, _)| *seq);

        if let Some(Some(precedes)) = slot.precedes.downcast_ref::<Option<PrecedesFn<T>>>() {
            ordered.sort_by(|(_, a), (_, b)| {
                if precedes(a, b) {
                    Ordering::Less
                } else if precedes(b, a) {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            });
        }

        ordered.into_iter().map(|(_, instance)| instance).collect()
    }

    /// Removes one instance of `T` and runs its shutdown hook.
    pub fn unregister<T>(&mut self, id: ExtensionId) -> bool
    where
        T: ?Sized + Extension + 'static,
    {
        let Some(slot) = self.types.get_mut(&TypeId::of::<T>()) else {
            return false;
        };
        let Some(position) = slot.entries.iter().position(|entry| entry.id == id) else {
            return false;
        };

        let entry = slot.entries.remove(position);
        (entry.shutdown)();
        info!(
            "event=extension_unregister module=registry status=ok type={} extension={}",
            slot.name, entry.extension_id
        );
        true
    }

    pub fn count_of<T: ?Sized + 'static>(&self) -> usize {
        self.types
            .get(&TypeId::of::<T>())
            .map_or(0, |slot| slot.entries.len())
    }

    pub fn len(&self) -> usize {
        self.types.values().map(|slot| slot.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts down and drops every instance, newest registration first.
    ///
    /// Declared types survive, so the registry can be repopulated.
    pub fn teardown(&mut self) {
        let mut entries: Vec<(&'static str, RegisteredExtension)> = self
            .types
            .values_mut()
            .flat_map(|slot| {
                let name = slot.name;
                slot.entries.drain(..).map(move |entry| (name, entry))
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        entries.sort_by(|(_, a), (_, b)| b.seq.cmp(&a.seq));

        for (type_name, entry) in entries {
            (entry.shutdown)();
            debug!(
                "event=extension_shutdown module=registry status=ok type={} extension={}",
                type_name, entry.extension_id
            );
        }
    }
}

impl Drop for ExtensionRegistry {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!(
                "event=registry_drop module=registry status=ok remaining={}",
                self.len()
            );
        }
        self.teardown();
    }
}

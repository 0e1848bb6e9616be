//! Per-object state and the arena that owns it.
//!
//! Application code never holds an [`ObjectInfo`] directly. A store hands
//! out [`Handle`]s, which name an arena slot plus the generation it was
//! allocated in, so a handle to a collected object is detected instead of
//! silently aliasing its successor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tessera_core::{
    Error, EventSystem, Result, StoreErrorKind, Variable, VariableChange,
};

use crate::info::ClassInfo;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_store_id() -> u64 {
    NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reference to an object living in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    store: u64,
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn store_id(&self) -> u64 {
        self.store
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}v{}", self.store, self.index, self.generation)
    }
}

/// Pending statement of an object attached to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    Add,
    Remove,
}

/// Payload of object-level events.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    /// A variable diverged. Emitted as `changed`.
    Changed {
        handle: Handle,
        attribute: String,
        change: VariableChange,
    },
    /// `added`, `removed`, `flushed`, `start-tracking-changes`,
    /// `stop-tracking-changes`.
    Lifecycle(Handle),
    /// A lazy variable is about to be resolved. Emitted as
    /// `resolve-lazy-value`.
    ResolveLazy { handle: Handle, attribute: String },
}

impl ObjectEvent {
    pub fn handle(&self) -> Handle {
        match self {
            ObjectEvent::Changed { handle, .. }
            | ObjectEvent::Lifecycle(handle)
            | ObjectEvent::ResolveLazy { handle, .. } => *handle,
        }
    }
}

// ============================================================================
// ObjectInfo
// ============================================================================

/// State of one mapped object.
pub struct ObjectInfo {
    cls_info: Arc<ClassInfo>,
    pub(crate) variables: Vec<Variable>,
    /// Copies of the primary variables as of the last flush or load. This
    /// is the identity the object is known by in the database.
    pub(crate) primary_vars: Option<Vec<Variable>>,
    pub(crate) attached: bool,
    pub(crate) pending: Option<Pending>,
    pub(crate) invalidated: bool,
    pub(crate) tracking: bool,
    pub(crate) lazy_resolving: bool,
    pub(crate) released: bool,
    pub(crate) event: EventSystem<ObjectEvent>,
}

impl ObjectInfo {
    /// Build fresh variables, applying column defaults.
    pub fn new(cls_info: Arc<ClassInfo>) -> Result<Self> {
        let variables = cls_info
            .columns()
            .iter()
            .map(|column| column.factory().create())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cls_info,
            variables,
            primary_vars: None,
            attached: false,
            pending: None,
            invalidated: false,
            tracking: false,
            lazy_resolving: false,
            released: false,
            event: EventSystem::new(),
        })
    }

    pub fn cls_info(&self) -> &Arc<ClassInfo> {
        &self.cls_info
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, index: usize) -> &Variable {
        &self.variables[index]
    }

    /// The current primary-key variables, which may differ from the
    /// identity the store knows the object by.
    pub fn primary_variables(&self) -> Vec<Variable> {
        self.cls_info
            .primary_key_pos()
            .iter()
            .map(|&i| self.variables[i].clone())
            .collect()
    }

    /// Identity as of the last flush or load.
    pub fn cached_primary_vars(&self) -> Option<&[Variable]> {
        self.primary_vars.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn pending(&self) -> Option<Pending> {
        self.pending
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn checkpoint(&mut self) {
        for variable in &mut self.variables {
            variable.checkpoint();
        }
    }

    pub fn event(&mut self) -> &mut EventSystem<ObjectEvent> {
        &mut self.event
    }
}

impl fmt::Debug for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectInfo")
            .field("class", &self.cls_info.name())
            .field("attached", &self.attached)
            .field("pending", &self.pending)
            .field("invalidated", &self.invalidated)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug)]
struct Slot {
    generation: u32,
    info: Option<ObjectInfo>,
}

/// Generation-checked slab of object states owned by one store.
#[derive(Debug)]
pub(crate) struct ObjectArena {
    store: u64,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ObjectArena {
    pub(crate) fn new(store: u64) -> Self {
        Self {
            store,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, info: ObjectInfo) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.info = Some(info);
            return Handle {
                store: self.store,
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            info: Some(info),
        });
        Handle {
            store: self.store,
            index,
            generation: 0,
        }
    }

    fn check(&self, handle: Handle) -> Result<()> {
        if handle.store != self.store {
            return Err(Error::store(
                StoreErrorKind::WrongStore,
                format!("object {handle} belongs to another store"),
            ));
        }
        Ok(())
    }

    fn stale(handle: Handle) -> Error {
        Error::store(
            StoreErrorKind::StaleHandle,
            format!("object {handle} was collected"),
        )
    }

    pub(crate) fn get(&self, handle: Handle) -> Result<&ObjectInfo> {
        self.check(handle)?;
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.info.as_ref())
            .ok_or_else(|| Self::stale(handle))
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Result<&mut ObjectInfo> {
        self.check(handle)?;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.info.as_mut())
            .ok_or_else(|| Self::stale(handle))
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<ObjectInfo> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if handle.store != self.store || slot.generation != handle.generation {
            return None;
        }
        let info = slot.info.take()?;
        self.free.push(handle.index);
        Some(info)
    }

    pub(crate) fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.info.is_some())
            .map(|(index, slot)| Handle {
                store: self.store,
                index: u32::try_from(index).unwrap_or(u32::MAX),
                generation: slot.generation,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

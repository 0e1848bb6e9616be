//! The store: identity map, unit of work and flush ordering.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: at most one live object per class and primary key.
//!   Lookups by key are answered from memory when possible.
//! - **Unit of work**: `add`, `remove` and attribute writes only mark
//!   objects dirty. `flush` turns the dirty set into INSERT, UPDATE and
//!   DELETE statements, honoring explicit ordering constraints.
//! - **Lazy values**: columns the store cannot vouch for are marked
//!   `AutoReload` and fetched again on first read.
//!
//! A store is single threaded. Objects live in an arena it owns and are
//! named by [`Handle`]s; a handle is only meaningful to the store that
//! created it.
//!
//! ```ignore
//! let mut store = Store::new(database);
//! let person = store.create::<Person>()?;
//! store.set_value(person, "name", "Joe")?;
//! store.add(person)?;
//! store.flush()?;
//! let id = store.get_value(person, "id")?;
//! ```

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tessera_core::{
    Column, Delete, Error, EventSystem, Expr, Field, Insert, LazyValue, QueryResult, Result,
    Row, Select, StoreErrorKind, Update, Value, Variable, VariableChange, compare_columns,
};

use crate::cache::ObjectCache;
use crate::config::StoreConfig;
use crate::database::Database;
use crate::info::{ClassHook, ClassInfo, Mapped};
use crate::object::{Handle, ObjectArena, ObjectEvent, ObjectInfo, Pending, next_store_id};
use crate::reference::{LinkHook, RelationData};
use crate::result_set::{FindSpec, ResultSet};

// ============================================================================
// Events and keys
// ============================================================================

/// Payload of store-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A statement is about to run in the current transaction.
    RegisterTransaction,
    Flush,
    Commit,
    Rollback,
}

impl StoreEvent {
    pub fn name(self) -> &'static str {
        match self {
            StoreEvent::RegisterTransaction => "register-transaction",
            StoreEvent::Flush => "flush",
            StoreEvent::Commit => "commit",
            StoreEvent::Rollback => "rollback",
        }
    }
}

/// Object lifecycle points, also dispatched to relation link records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Added,
    Removed,
    Flushed,
    StartTracking,
    StopTracking,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Added => "added",
            Lifecycle::Removed => "removed",
            Lifecycle::Flushed => "flushed",
            Lifecycle::StartTracking => "start-tracking-changes",
            Lifecycle::StopTracking => "stop-tracking-changes",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum HookKind {
    PreFlush,
    Flushed,
    Loaded,
    Invalidated,
}

/// Primary-key values passed to [`Store::get`].
///
/// Scalars convert to a one-column key, tuples to composite keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Key(pub Vec<Value>);

impl From<Vec<Value>> for Key {
    fn from(values: Vec<Value>) -> Self {
        Key(values)
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        Key(vec![value])
    }
}

macro_rules! scalar_key {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Key {
                fn from(value: $t) -> Self {
                    Key(vec![Value::from(value)])
                }
            }
        )*
    };
}

scalar_key!(bool, i32, i64, &str, String);

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Key {
    fn from((a, b): (A, B)) -> Self {
        Key(vec![a.into(), b.into()])
    }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>> From<(A, B, C)> for Key {
    fn from((a, b, c): (A, B, C)) -> Self {
        Key(vec![a.into(), b.into(), c.into()])
    }
}

/// Identity-map key: class plus primary values in wire form.
#[derive(Debug, Clone)]
struct IdentityKey {
    class: TypeId,
    values: Vec<Value>,
}

impl IdentityKey {
    fn new(class: TypeId, variables: &[Variable]) -> Result<Self> {
        let values = variables
            .iter()
            .map(|variable| Ok(variable.get(true)?.unwrap_or(Value::Null)))
            .collect::<Result<_>>()?;
        Ok(Self { class, values })
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.values == other.values
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.hash(state);
        self.values.len().hash(state);
        for value in &self.values {
            value.hash_into(state);
        }
    }
}

fn lost_object(message: impl Into<String>) -> Error {
    Error::store(StoreErrorKind::LostObject, message)
}

// ============================================================================
// Store
// ============================================================================

/// Identity-mapped unit of work over one [`Database`].
pub struct Store {
    id: u64,
    database: Database,
    config: StoreConfig,
    pub(crate) objects: ObjectArena,
    alive: HashMap<IdentityKey, Handle>,
    /// Dirty objects and the sequence number they became dirty at.
    dirty: HashMap<Handle, u64>,
    sequence: u64,
    order: HashMap<(Handle, Handle), i64>,
    cache: Box<dyn ObjectCache<Handle>>,
    event: EventSystem<StoreEvent>,
    implicit_flush_block_count: usize,
    pub(crate) relations: HashMap<(Handle, u64), RelationData>,
    /// How many relation records hold each handle as a remote.
    pub(crate) remote_links: HashMap<Handle, usize>,
    pub(crate) link_hooks: HashMap<Handle, Vec<LinkHook>>,
}

impl Store {
    pub fn new(database: Database) -> Self {
        Self::with_config(database, StoreConfig::default())
    }

    pub fn with_config(database: Database, config: StoreConfig) -> Self {
        let id = next_store_id();
        tracing::debug!(
            store = id,
            cache = %config.cache,
            cache_size = config.cache_size,
            "Creating store"
        );
        Self {
            id,
            database,
            cache: config.cache.build(config.cache_size),
            config,
            objects: ObjectArena::new(id),
            alive: HashMap::new(),
            dirty: HashMap::new(),
            sequence: 0,
            order: HashMap::new(),
            event: EventSystem::new(),
            implicit_flush_block_count: 0,
            relations: HashMap::new(),
            remote_links: HashMap::new(),
            link_hooks: HashMap::new(),
        }
    }

    /// A store configured from the options of the database's URI.
    pub fn from_database(database: Database) -> Result<Self> {
        let config = match database.uri() {
            Some(uri) => StoreConfig::from_uri(uri)?,
            None => StoreConfig::default(),
        };
        Ok(Self::with_config(database, config))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Store-level event hub: `register-transaction`, `flush`, `commit`,
    /// `rollback`.
    pub fn event(&mut self) -> &mut EventSystem<StoreEvent> {
        &mut self.event
    }

    /// Event hub of one object.
    pub fn object_event(&mut self, handle: Handle) -> Result<&mut EventSystem<ObjectEvent>> {
        Ok(&mut self.objects.get_mut(handle)?.event)
    }

    pub fn info(&self, handle: Handle) -> Result<&ObjectInfo> {
        self.objects.get(handle)
    }

    pub fn cache(&self) -> &dyn ObjectCache<Handle> {
        self.cache.as_ref()
    }

    pub fn set_cache_size(&mut self, size: usize) {
        for handle in self.cache.set_size(size) {
            self.maybe_collect(handle);
        }
    }

    /// Objects known by primary key.
    pub fn alive(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.alive.values().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub(crate) fn alive_of(&self, class: TypeId) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .alive
            .iter()
            .filter(|(key, _)| key.class == class)
            .map(|(_, handle)| *handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Number of objects held by the store, attached or not.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_dirty(&self, handle: Handle) -> bool {
        self.dirty.contains_key(&handle)
    }

    pub fn is_attached(&self, handle: Handle) -> Result<bool> {
        Ok(self.objects.get(handle)?.attached)
    }

    pub fn pending(&self, handle: Handle) -> Result<Option<Pending>> {
        Ok(self.objects.get(handle)?.pending)
    }

    fn cls_info(&self, handle: Handle) -> Result<Arc<ClassInfo>> {
        Ok(Arc::clone(self.objects.get(handle)?.cls_info()))
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// A new, detached object of `T` with column defaults applied.
    pub fn create<T: Mapped>(&mut self) -> Result<Handle> {
        self.create_from_info(ClassInfo::of::<T>()?)
    }

    pub fn create_from_info(&mut self, cls_info: Arc<ClassInfo>) -> Result<Handle> {
        let handle = self.objects.insert(ObjectInfo::new(cls_info)?);
        tracing::trace!(%handle, "Created object");
        Ok(handle)
    }

    /// Give up the application's claim on an object.
    ///
    /// The object stays in memory while it is pending, dirty, cached or
    /// linked, and is collected after that. Using the handle afterwards
    /// may fail with `StaleHandle`.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        self.objects.get_mut(handle)?.released = true;
        self.maybe_collect(handle);
        Ok(())
    }

    fn reclaim(&mut self, handle: Handle) -> Result<()> {
        let info = self.objects.get_mut(handle)?;
        if info.released {
            info.released = false;
            self.touch(handle);
        }
        Ok(())
    }

    fn touch(&mut self, handle: Handle) {
        for evicted in self.cache.add(handle) {
            self.maybe_collect(evicted);
        }
    }

    fn maybe_collect(&mut self, handle: Handle) {
        let Ok(info) = self.objects.get(handle) else {
            return;
        };
        if !info.released
            || info.pending.is_some()
            || self.dirty.contains_key(&handle)
            || self.cache.contains(&handle)
            || self.is_linked(handle)
        {
            return;
        }
        if let Some(vars) = &info.primary_vars {
            if let Ok(key) = IdentityKey::new(info.cls_info().type_id(), vars) {
                if self.alive.get(&key) == Some(&handle) {
                    self.alive.remove(&key);
                }
            }
        }
        self.order.retain(|(before, after), _| *before != handle && *after != handle);
        self.drop_links(handle);
        self.objects.remove(handle);
        tracing::trace!(%handle, "Collected released object");
    }

    fn collect_released(&mut self) {
        for handle in self.objects.handles() {
            self.maybe_collect(handle);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Point lookup by primary key.
    ///
    /// Live objects are returned without touching the database unless they
    /// were invalidated.
    #[tracing::instrument(level = "debug", skip(self, key), fields(class = std::any::type_name::<T>()))]
    pub fn get<T: Mapped>(&mut self, key: impl Into<Key>) -> Result<Option<Handle>> {
        let cls_info = ClassInfo::of::<T>()?;
        self.get_by_info(&cls_info, key.into())
    }

    pub fn get_by_info(&mut self, cls_info: &Arc<ClassInfo>, key: Key) -> Result<Option<Handle>> {
        self.implicit_flush()?;
        let primary_key = cls_info.primary_key();
        if key.0.len() != primary_key.len() {
            return Err(Error::Custom(format!(
                "{} expects a key of {} values, got {}",
                cls_info.name(),
                primary_key.len(),
                key.0.len()
            )));
        }
        let primary_vars = primary_key
            .iter()
            .zip(key.0)
            .map(|(column, value)| column.factory().param(value))
            .collect::<Result<Vec<_>>>()?;

        let identity = IdentityKey::new(cls_info.type_id(), &primary_vars)?;
        if let Some(&handle) = self.alive.get(&identity) {
            if !self.objects.get(handle)?.invalidated {
                tracing::trace!(%handle, "Identity map hit");
                self.reclaim(handle)?;
                return Ok(Some(handle));
            }
        }

        let mut select = Select::new(cls_info.columns().iter().cloned())
            .default_tables([cls_info.table().clone()])
            .limit(1);
        if let Some(condition) = compare_columns(primary_key, primary_vars) {
            select = select.filter(condition);
        }
        let mut result = self.run(select.into())?;
        match result.get_one() {
            Some(row) => self.load_object(cls_info, row),
            None => Ok(None),
        }
    }

    /// Objects of `T` matching `condition`, as a lazy result set.
    pub fn find<T: Mapped>(&mut self, condition: Option<Expr>) -> Result<ResultSet> {
        self.find_spec(FindSpec::of::<T>()?, condition)
    }

    pub fn find_spec(&mut self, spec: FindSpec, condition: Option<Expr>) -> Result<ResultSet> {
        self.implicit_flush()?;
        Ok(ResultSet::new(spec, condition, None))
    }

    /// Run finds over an explicit table list, such as a join.
    pub fn using<I, T>(&mut self, tables: I) -> TableSet<'_>
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        TableSet {
            store: self,
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Run a statement after flushing pending changes.
    pub fn execute(&mut self, statement: impl Into<Expr>) -> Result<QueryResult> {
        self.implicit_flush()?;
        self.run(statement.into())
    }

    /// Run SQL text after flushing pending changes.
    pub fn execute_sql(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.implicit_flush()?;
        self.emit_store(StoreEvent::RegisterTransaction)?;
        self.database.execute_sql(sql, params)
    }

    pub(crate) fn run(&mut self, statement: Expr) -> Result<QueryResult> {
        self.emit_store(StoreEvent::RegisterTransaction)?;
        self.database.execute(&statement)
    }

    pub(crate) fn implicit_flush(&mut self) -> Result<()> {
        if self.config.implicit_flush && self.implicit_flush_block_count == 0 {
            self.flush()?;
        }
        Ok(())
    }

    pub fn block_implicit_flushes(&mut self) {
        self.implicit_flush_block_count += 1;
    }

    pub fn unblock_implicit_flushes(&mut self) {
        self.implicit_flush_block_count = self.implicit_flush_block_count.saturating_sub(1);
    }

    // ========================================================================
    // Staging
    // ========================================================================

    /// Stage an object for insertion, or revive a pending removal.
    #[tracing::instrument(level = "debug", skip(self), fields(handle = %handle))]
    pub fn add(&mut self, handle: Handle) -> Result<()> {
        self.objects.get(handle)?;
        self.emit_store(StoreEvent::RegisterTransaction)?;
        let info = self.objects.get_mut(handle)?;
        match info.pending {
            Some(Pending::Add) => {}
            Some(Pending::Remove) => {
                info.pending = None;
                info.lazy_resolving = true;
                tracing::debug!("Revived pending removal");
            }
            None if info.attached => {}
            None => {
                info.attached = true;
                info.pending = Some(Pending::Add);
                info.lazy_resolving = true;
                self.set_dirty(handle);
                self.emit_lifecycle(handle, Lifecycle::Added)?;
            }
        }
        Ok(())
    }

    /// Stage an object for deletion. A pending insert is simply dropped.
    #[tracing::instrument(level = "debug", skip(self), fields(handle = %handle))]
    pub fn remove(&mut self, handle: Handle) -> Result<()> {
        self.emit_store(StoreEvent::RegisterTransaction)?;
        let info = self.objects.get_mut(handle)?;
        if !info.attached {
            return Err(Error::store(
                StoreErrorKind::WrongStore,
                format!("object {handle} is not in this store"),
            ));
        }
        match info.pending {
            Some(Pending::Remove) => return Ok(()),
            Some(Pending::Add) => {
                info.attached = false;
                info.pending = None;
                info.lazy_resolving = false;
                self.set_clean(handle);
            }
            None => {
                info.pending = Some(Pending::Remove);
                info.lazy_resolving = false;
                self.set_dirty(handle);
            }
        }
        self.emit_lifecycle(handle, Lifecycle::Removed)?;
        self.maybe_collect(handle);
        Ok(())
    }

    /// Require `before` to be flushed before `after`. Calls are counted.
    pub fn add_flush_order(&mut self, before: Handle, after: Handle) -> Result<()> {
        self.objects.get(before)?;
        self.objects.get(after)?;
        *self.order.entry((before, after)).or_insert(0) += 1;
        Ok(())
    }

    /// Undo one [`add_flush_order`](Store::add_flush_order) call.
    pub fn remove_flush_order(&mut self, before: Handle, after: Handle) {
        if let Some(count) = self.order.get_mut(&(before, after)) {
            *count -= 1;
        }
    }

    fn set_dirty(&mut self, handle: Handle) {
        if !self.dirty.contains_key(&handle) {
            self.sequence += 1;
            self.dirty.insert(handle, self.sequence);
        }
    }

    fn set_clean(&mut self, handle: Handle) {
        self.dirty.remove(&handle);
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every dirty object to the database.
    ///
    /// Objects are flushed in the order they became dirty, except where
    /// [`add_flush_order`](Store::add_flush_order) says otherwise. On error
    /// the dirty set and the ordering constraints are left in place.
    #[tracing::instrument(level = "debug", skip(self), fields(store = self.id, dirty = self.dirty.len()))]
    pub fn flush(&mut self) -> Result<()> {
        self.emit_store(StoreEvent::Flush)?;
        self.detect_mutations()?;

        // Pre-flush hooks may dirty more objects; each gets its hook once.
        let mut hooked = HashSet::new();
        loop {
            let mut fresh: Vec<(u64, Handle)> = self
                .dirty
                .iter()
                .filter(|(handle, _)| !hooked.contains(*handle))
                .map(|(handle, sequence)| (*sequence, *handle))
                .collect();
            if fresh.is_empty() {
                break;
            }
            fresh.sort_unstable();
            for (_, handle) in fresh {
                hooked.insert(handle);
                self.run_hook(handle, HookKind::PreFlush)?;
            }
        }

        let mut predecessors: HashMap<Handle, Vec<Handle>> = HashMap::new();
        for (&(before, after), &count) in &self.order {
            if count > 0 {
                predecessors.entry(after).or_default().push(before);
            }
        }

        let limit = self.config.max_flush_repeats + 1;
        let mut flush_counts: HashMap<Handle, usize> = HashMap::new();
        let mut flushed = Vec::new();
        while !self.dirty.is_empty() {
            let mut by_sequence: Vec<(u64, Handle)> = self
                .dirty
                .iter()
                .map(|(handle, sequence)| (*sequence, *handle))
                .collect();
            by_sequence.sort_unstable();
            let mut sorted: Vec<Handle> = by_sequence.into_iter().map(|(_, h)| h).collect();

            loop {
                sorted.retain(|handle| self.dirty.contains_key(handle));
                if sorted.is_empty() {
                    break;
                }
                let ready = sorted.iter().position(|handle| {
                    predecessors
                        .get(handle)
                        .is_none_or(|before| before.iter().all(|b| !self.dirty.contains_key(b)))
                });
                let Some(position) = ready else {
                    return Err(Error::store(
                        StoreErrorKind::OrderLoop,
                        "Can't flush due to ordering loop",
                    ));
                };
                let handle = sorted.remove(position);
                let count = flush_counts.entry(handle).or_insert(0);
                *count += 1;
                if *count > limit {
                    return Err(Error::store(
                        StoreErrorKind::OrderLoop,
                        format!("object {handle} was dirtied again more than {} times during one flush", limit - 1),
                    ));
                }
                let sequence = self.dirty.remove(&handle).unwrap_or_default();
                if let Err(error) = self.flush_one(handle) {
                    self.dirty.entry(handle).or_insert(sequence);
                    tracing::warn!(%handle, error = %error, "Flush failed");
                    return Err(error);
                }
                flushed.push(handle);
            }
        }

        self.order.clear();
        self.sequence = 0;
        if !flushed.is_empty() {
            tracing::debug!(objects = flushed.len(), "Flushed");
        }
        for handle in flushed {
            self.maybe_collect(handle);
        }
        Ok(())
    }

    fn flush_one(&mut self, handle: Handle) -> Result<()> {
        let cls_info = self.cls_info(handle)?;
        let pending = self.objects.get_mut(handle)?.pending.take();
        let outcome = match pending {
            Some(Pending::Remove) => self.flush_delete(handle, &cls_info),
            Some(Pending::Add) => self.flush_insert(handle, &cls_info),
            None => self.flush_update(handle, &cls_info),
        };
        if let Err(error) = outcome {
            if let Ok(info) = self.objects.get_mut(handle) {
                if info.pending.is_none() {
                    info.pending = pending;
                }
            }
            return Err(error);
        }
        self.run_hook(handle, HookKind::Flushed)?;
        self.emit_lifecycle(handle, Lifecycle::Flushed)
    }

    fn flush_delete(&mut self, handle: Handle, cls_info: &ClassInfo) -> Result<()> {
        let condition = self.cached_where(handle)?;
        self.run(Delete::new().filter(condition).table(cls_info.table().clone()).into())?;
        self.objects.get_mut(handle)?.invalidated = false;
        self.disable_change_notification(handle)?;
        self.remove_from_alive(handle)?;
        self.objects.get_mut(handle)?.attached = false;
        Ok(())
    }

    fn flush_insert(&mut self, handle: Handle, cls_info: &ClassInfo) -> Result<()> {
        let mut primary_vars = self.objects.get(handle)?.primary_variables();
        self.database
            .dialect()
            .preset_primary_key(cls_info.primary_key(), &mut primary_vars)?;
        for (variable, &index) in primary_vars.iter().zip(cls_info.primary_key_pos()) {
            let current_defined = self.objects.get(handle)?.variables[index].is_defined();
            if !current_defined && variable.is_defined() {
                let value = variable.get(true)?.unwrap_or(Value::Null);
                self.set_variable_at(handle, index, value, true)?;
            }
        }

        let changes = self.changes_map(handle, true)?;
        let primary_vars = self.objects.get(handle)?.primary_variables();
        let insert = Insert::new(changes)
            .table(cls_info.table().clone())
            .primary(cls_info.primary_key().to_vec(), primary_vars);
        let result = self.run(insert.into())?;

        self.objects.get_mut(handle)?.invalidated = false;
        self.fill_missing_values(handle, Some(result.last_insert_id()))?;
        self.enable_change_notification(handle)?;
        self.add_to_alive(handle)?;
        self.objects.get_mut(handle)?.checkpoint();
        Ok(())
    }

    fn flush_update(&mut self, handle: Handle, cls_info: &ClassInfo) -> Result<()> {
        let changes = self.changes_map(handle, false)?;
        if !changes.is_empty() {
            let condition = self.cached_where(handle)?;
            let update = Update::new(changes)
                .filter(condition)
                .table(cls_info.table().clone());
            self.run(update.into())?;
            self.fill_missing_values(handle, None)?;
            self.add_to_alive(handle)?;
        }
        self.objects.get_mut(handle)?.checkpoint();
        Ok(())
    }

    /// Columns to write. Lazy expressions are written as SQL; primary-key
    /// expressions are evaluated first so the row's identity is known.
    fn changes_map(&mut self, handle: Handle, adding: bool) -> Result<Vec<(Column, Expr)>> {
        let cls_info = self.cls_info(handle)?;
        let mut included = Vec::new();
        let mut resolve = Vec::new();
        {
            let info = self.objects.get(handle)?;
            for (index, variable) in info.variables.iter().enumerate() {
                if !(adding || variable.has_changed()) {
                    continue;
                }
                if variable.is_defined() {
                    included.push((index, None));
                } else if let Some(LazyValue::Expr(expr)) = variable.lazy() {
                    if cls_info.is_primary_index(index) {
                        resolve.push((index, (**expr).clone()));
                        included.push((index, None));
                    } else {
                        included.push((index, Some((**expr).clone())));
                    }
                }
            }
        }

        if !resolve.is_empty() {
            let select = Select::new(resolve.iter().map(|(_, expr)| expr.clone()));
            let mut result = self.run(select.into())?;
            let row = result
                .get_one()
                .ok_or_else(|| lost_object("Can't evaluate primary key expressions"))?;
            for ((index, _), value) in resolve.iter().zip(row.into_values()) {
                self.set_variable_at(handle, *index, value, true)?;
            }
        }

        let info = self.objects.get(handle)?;
        Ok(included
            .into_iter()
            .map(|(index, expr)| {
                let column = cls_info.columns()[index].clone();
                let value = expr.unwrap_or_else(|| Expr::Param(info.variables[index].clone()));
                (column, value)
            })
            .collect())
    }

    /// After a write, mark undefined columns for reload and fetch missing
    /// primary-key values.
    fn fill_missing_values(
        &mut self,
        handle: Handle,
        inserted: Option<Option<i64>>,
    ) -> Result<()> {
        let cls_info = self.cls_info(handle)?;
        let mut from_cache = Vec::new();
        let mut reload = Vec::new();
        let mut missing = Vec::new();
        {
            let info = self.objects.get(handle)?;
            for (index, variable) in info.variables.iter().enumerate() {
                if variable.is_defined() {
                    continue;
                }
                match cls_info.primary_key_pos().iter().position(|&p| p == index) {
                    Some(position) => match (&info.primary_vars, variable.lazy()) {
                        (Some(cached), Some(LazyValue::AutoReload)) => {
                            let value = cached[position].get(true)?.unwrap_or(Value::Null);
                            from_cache.push((index, value));
                        }
                        _ => missing.push(index),
                    },
                    None => reload.push(index),
                }
            }
        }

        for (index, value) in from_cache {
            self.set_variable_at(handle, index, value, true)?;
        }
        for index in reload {
            self.set_lazy_at(handle, index, LazyValue::AutoReload)?;
        }
        if missing.is_empty() {
            return Ok(());
        }

        let Some(last_insert_id) = inserted else {
            return Err(lost_object(format!(
                "object {handle} has undefined primary key values after update"
            )));
        };
        let primary_vars = self.objects.get(handle)?.primary_variables();
        let identity = self
            .database
            .dialect()
            .insert_identity(cls_info.primary_key(), &primary_vars, last_insert_id)
            .ok_or_else(|| lost_object("Can't identify the inserted row"))?;
        let select = Select::new(missing.iter().map(|&i| cls_info.columns()[i].clone()))
            .filter(identity);
        let mut result = self.run(select.into())?;
        let row = result.get_one();
        self.set_values(handle, &missing, row, false)
    }

    fn detect_mutations(&mut self) -> Result<()> {
        for handle in self.objects.handles() {
            let changes: Vec<(usize, VariableChange)> = {
                let info = self.objects.get(handle)?;
                if !info.tracking {
                    continue;
                }
                info.variables
                    .iter()
                    .enumerate()
                    .filter_map(|(index, variable)| variable.detect_mutation().map(|c| (index, c)))
                    .collect()
            };
            for (index, change) in changes {
                tracing::trace!(%handle, index, "Detected in-place mutation");
                self.variable_changed(handle, index, change)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Flush, invalidate every cached object and commit.
    #[tracing::instrument(level = "debug", skip(self), fields(store = self.id))]
    pub fn commit(&mut self) -> Result<()> {
        self.flush()?;
        self.invalidate(None)?;
        self.database.commit()?;
        self.emit_store(StoreEvent::Commit)?;
        tracing::info!(store = self.id, "Committed");
        Ok(())
    }

    /// Drop staged changes, invalidate every cached object and roll back.
    #[tracing::instrument(level = "debug", skip(self), fields(store = self.id))]
    pub fn rollback(&mut self) -> Result<()> {
        let dirty: Vec<Handle> = self.dirty.keys().copied().collect();
        for handle in dirty {
            let Ok(info) = self.objects.get_mut(handle) else {
                continue;
            };
            match info.pending.take() {
                Some(Pending::Add) => {
                    info.attached = false;
                    info.lazy_resolving = false;
                }
                Some(Pending::Remove) => info.lazy_resolving = true,
                None => {}
            }
        }
        self.dirty.clear();
        self.invalidate(None)?;
        self.database.rollback()?;
        self.emit_store(StoreEvent::Rollback)?;
        tracing::info!(store = self.id, "Rolled back");
        Ok(())
    }

    /// Reload every column of an object from the database.
    #[tracing::instrument(level = "debug", skip(self), fields(handle = %handle))]
    pub fn reload(&mut self, handle: Handle) -> Result<()> {
        let info = self.objects.get(handle)?;
        if !info.attached {
            return Err(Error::store(
                StoreErrorKind::WrongStore,
                format!("object {handle} is not in this store"),
            ));
        }
        if info.primary_vars.is_none() {
            return Err(Error::store(
                StoreErrorKind::NotFlushed,
                "Can't reload an object if it was never flushed",
            ));
        }
        let cls_info = Arc::clone(info.cls_info());
        let condition = self.cached_where(handle)?;
        let select = Select::new(cls_info.columns().iter().cloned())
            .filter(condition)
            .default_tables([cls_info.table().clone()])
            .limit(1);
        let mut result = self.run(select.into())?;
        let row = result.get_one();
        let indices: Vec<usize> = (0..cls_info.columns().len()).collect();
        self.set_values(handle, &indices, row, false)?;
        self.objects.get_mut(handle)?.checkpoint();
        self.set_clean(handle);
        Ok(())
    }

    /// Mark objects as possibly gone. They are revalidated with a query
    /// before being returned from the identity map or written to.
    pub fn invalidate(&mut self, handle: Option<Handle>) -> Result<()> {
        match handle {
            Some(handle) => {
                self.objects.get(handle)?;
                self.cache.remove(&handle);
            }
            None => self.cache.clear(),
        }
        self.mark_autoreload(handle, true)?;
        self.collect_released();
        Ok(())
    }

    /// Mark non-key columns to be fetched again on next read.
    pub fn autoreload(&mut self, handle: Option<Handle>) -> Result<()> {
        self.mark_autoreload(handle, false)
    }

    fn mark_autoreload(&mut self, handle: Option<Handle>, invalidate: bool) -> Result<()> {
        let targets = match handle {
            Some(handle) => vec![handle],
            None => self.alive(),
        };
        for &target in &targets {
            let cls_info = self.cls_info(target)?;
            for index in 0..cls_info.columns().len() {
                if cls_info.is_primary_index(index) {
                    continue;
                }
                self.set_lazy_at(target, index, LazyValue::AutoReload)?;
            }
            if invalidate {
                self.objects.get_mut(target)?.invalidated = true;
            }
        }
        if invalidate {
            for target in targets {
                self.run_hook(target, HookKind::Invalidated)?;
            }
        }
        Ok(())
    }

    /// Forget every object. In-memory changes are discarded and later
    /// lookups build fresh objects.
    pub fn reset(&mut self) {
        for handle in self.alive() {
            if let Ok(info) = self.objects.get_mut(handle) {
                info.attached = false;
                info.pending = None;
            }
        }
        self.alive.clear();
        self.dirty.clear();
        self.cache.clear();
        self.order.clear();
        self.collect_released();
        tracing::debug!(store = self.id, "Reset");
    }

    pub fn close(&mut self) -> Result<()> {
        self.database.close()
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Current host value of an attribute, resolving lazy values first.
    /// Undefined and unresolvable values read as NULL.
    pub fn get_value(&mut self, handle: Handle, attribute: &str) -> Result<Value> {
        let index = self.objects.get(handle)?.cls_info().resolve(attribute)?;
        self.get_value_at(handle, index)
    }

    pub(crate) fn get_value_at(&mut self, handle: Handle, index: usize) -> Result<Value> {
        self.resolve_if_lazy(handle, index)?;
        let value = self.objects.get(handle)?.variables[index].get(false)?;
        Ok(value.unwrap_or(Value::Null))
    }

    /// Raw state of an attribute, without resolving anything.
    pub fn field(&self, handle: Handle, attribute: &str) -> Result<Field> {
        let info = self.objects.get(handle)?;
        let index = info.cls_info().resolve(attribute)?;
        Ok(info.variables[index].field())
    }

    pub fn set_value(
        &mut self,
        handle: Handle,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let index = self.objects.get(handle)?.cls_info().resolve(attribute)?;
        self.set_variable_at(handle, index, value.into(), false)
    }

    /// Set an attribute to a lazy value, such as an SQL expression to be
    /// evaluated by the database on the next flush.
    pub fn set_lazy(&mut self, handle: Handle, attribute: &str, lazy: LazyValue) -> Result<()> {
        let index = self.objects.get(handle)?.cls_info().resolve(attribute)?;
        self.set_lazy_at(handle, index, lazy)
    }

    pub fn delete_value(&mut self, handle: Handle, attribute: &str) -> Result<()> {
        let index = self.objects.get(handle)?.cls_info().resolve(attribute)?;
        let change = self.objects.get_mut(handle)?.variables[index].delete();
        match change {
            Some(change) => self.variable_changed(handle, index, change),
            None => Ok(()),
        }
    }

    /// In-place access to a concrete value. Edits of mutable kinds are
    /// detected on the next flush.
    pub fn value_mut(&mut self, handle: Handle, attribute: &str) -> Result<Option<&mut Value>> {
        let index = self.objects.get(handle)?.cls_info().resolve(attribute)?;
        self.resolve_if_lazy(handle, index)?;
        Ok(self.objects.get_mut(handle)?.variables[index].value_mut())
    }

    pub(crate) fn set_variable_at(
        &mut self,
        handle: Handle,
        index: usize,
        value: Value,
        from_db: bool,
    ) -> Result<()> {
        let change = self.objects.get_mut(handle)?.variables[index].set(value, from_db)?;
        match change {
            Some(change) => self.variable_changed(handle, index, change),
            None => Ok(()),
        }
    }

    pub(crate) fn set_lazy_at(&mut self, handle: Handle, index: usize, lazy: LazyValue) -> Result<()> {
        let variable = &mut self.objects.get_mut(handle)?.variables[index];
        if variable.lazy() == Some(&lazy) {
            return Ok(());
        }
        let change = variable.set_lazy(lazy);
        self.variable_changed(handle, index, change)
    }

    /// Fan a variable change out to the unit of work, relation links and
    /// the object's event hub.
    pub(crate) fn variable_changed(&mut self, handle: Handle, index: usize, change: VariableChange) -> Result<()> {
        let info = self.objects.get(handle)?;
        let dirties = info.tracking
            && !change.from_db
            && !matches!(change.new, Field::Undefined | Field::Lazy(LazyValue::AutoReload));
        if dirties {
            if info.invalidated {
                self.validate_alive(handle)?;
            }
            self.set_dirty(handle);
        }
        self.dispatch_changed(handle, index, &change)?;

        let info = self.objects.get_mut(handle)?;
        if info.event.has_hooks("changed") {
            let event = ObjectEvent::Changed {
                handle,
                attribute: info.cls_info().attributes()[index].clone(),
                change,
            };
            info.event.emit("changed", &event)?;
        }
        Ok(())
    }

    fn resolve_if_lazy(&mut self, handle: Handle, index: usize) -> Result<()> {
        let info = self.objects.get(handle)?;
        let resolvable = matches!(
            info.variables[index].lazy(),
            Some(LazyValue::AutoReload | LazyValue::Expr(_))
        );
        if resolvable && info.lazy_resolving {
            self.resolve_lazy_value(handle, index)?;
        }
        Ok(())
    }

    /// Flush, then fetch every `AutoReload` column of the object in one
    /// query.
    fn resolve_lazy_value(&mut self, handle: Handle, index: usize) -> Result<()> {
        {
            let info = self.objects.get_mut(handle)?;
            if info.event.has_hooks("resolve-lazy-value") {
                let event = ObjectEvent::ResolveLazy {
                    handle,
                    attribute: info.cls_info().attributes()[index].clone(),
                };
                info.event.emit("resolve-lazy-value", &event)?;
            }
        }
        self.implicit_flush()?;

        let cls_info = self.cls_info(handle)?;
        let reload: Vec<usize> = {
            let info = self.objects.get(handle)?;
            (0..cls_info.columns().len())
                .filter(|&i| matches!(info.variables[i].lazy(), Some(LazyValue::AutoReload)))
                .collect()
        };
        if reload.is_empty() {
            return Ok(());
        }
        tracing::debug!(%handle, columns = reload.len(), "Resolving lazy values");
        let condition = self.cached_where(handle)?;
        let select = Select::new(reload.iter().map(|&i| cls_info.columns()[i].clone()))
            .filter(condition);
        let mut result = self.run(select.into())?;
        let row = result.get_one();
        self.set_values(handle, &reload, row, false)?;
        let info = self.objects.get_mut(handle)?;
        for index in reload {
            info.variables[index].checkpoint();
        }
        Ok(())
    }

    // ========================================================================
    // Identity map internals
    // ========================================================================

    fn cached_where(&self, handle: Handle) -> Result<Expr> {
        let info = self.objects.get(handle)?;
        let Some(primary_vars) = &info.primary_vars else {
            return Err(Error::store(
                StoreErrorKind::NotFlushed,
                format!("object {handle} has no known identity yet"),
            ));
        };
        compare_columns(info.cls_info().primary_key(), primary_vars.iter().cloned()).ok_or_else(
            || Error::store(StoreErrorKind::NotFlushed, "object has no primary key"),
        )
    }

    fn validate_alive(&mut self, handle: Handle) -> Result<()> {
        let condition = self.cached_where(handle)?;
        let select = Select::new([Expr::raw("1")]).filter(condition);
        let mut result = self.run(select.into())?;
        if result.get_one().is_none() {
            return Err(lost_object("Object is not in the database anymore"));
        }
        self.objects.get_mut(handle)?.invalidated = false;
        Ok(())
    }

    /// Confirm an invalidated object still exists. Fails with
    /// `LostObject` when it is gone.
    pub(crate) fn revalidate(&mut self, handle: Handle) -> Result<()> {
        if self.objects.get(handle)?.invalidated {
            self.validate_alive(handle)?;
        }
        Ok(())
    }

    /// Turn a fetched row into an object, reusing the live one with the
    /// same identity. An all-NULL row, as produced by outer joins, loads
    /// as `None`.
    pub(crate) fn load_object(&mut self, cls_info: &Arc<ClassInfo>, row: Row) -> Result<Option<Handle>> {
        if row.is_all_null() {
            return Ok(None);
        }
        let values = row.into_values();
        let mut primary_vars = Vec::with_capacity(cls_info.primary_key_pos().len());
        for &index in cls_info.primary_key_pos() {
            let mut variable = cls_info.columns()[index].factory().create()?;
            variable.set(values.get(index).cloned().unwrap_or(Value::Null), true)?;
            primary_vars.push(variable);
        }
        let identity = IdentityKey::new(cls_info.type_id(), &primary_vars)?;
        let indices: Vec<usize> = (0..cls_info.columns().len()).collect();

        if let Some(&handle) = self.alive.get(&identity) {
            self.objects.get_mut(handle)?.invalidated = false;
            self.reclaim(handle)?;
            self.set_values(handle, &indices, Some(Row::from_values(values)), true)?;
            return Ok(Some(handle));
        }

        let handle = self.create_from_info(Arc::clone(cls_info))?;
        self.objects.get_mut(handle)?.attached = true;
        self.set_values(handle, &indices, Some(Row::from_values(values)), false)?;
        self.objects.get_mut(handle)?.checkpoint();
        self.add_to_alive(handle)?;
        self.enable_change_notification(handle)?;
        self.objects.get_mut(handle)?.lazy_resolving = true;
        self.run_hook(handle, HookKind::Loaded)?;
        tracing::trace!(%handle, class = cls_info.name(), "Loaded object");
        Ok(Some(handle))
    }

    fn set_values(
        &mut self,
        handle: Handle,
        indices: &[usize],
        row: Option<Row>,
        keep_defined: bool,
    ) -> Result<()> {
        let Some(row) = row else {
            return Err(lost_object(
                "Can't obtain values from the database (object got removed?)",
            ));
        };
        self.objects.get_mut(handle)?.invalidated = false;
        for (&index, value) in indices.iter().zip(row.into_values()) {
            if keep_defined {
                let variable = &self.objects.get(handle)?.variables[index];
                if variable.is_defined() {
                    continue;
                }
                if let Some(lazy) = variable.lazy() {
                    if *lazy != LazyValue::AutoReload {
                        tracing::warn!(%handle, index, ?lazy, "Keeping unflushed lazy value over fetched row");
                        continue;
                    }
                }
            }
            self.set_variable_at(handle, index, value, true)?;
        }
        Ok(())
    }

    fn add_to_alive(&mut self, handle: Handle) -> Result<()> {
        let info = self.objects.get(handle)?;
        let class = info.cls_info().type_id();
        let old = info.primary_vars.clone();
        let copies: Vec<Variable> = info.primary_variables().iter().map(Variable::copy).collect();
        if let Some(old) = old {
            let old_key = IdentityKey::new(class, &old)?;
            if self.alive.get(&old_key) == Some(&handle) {
                self.alive.remove(&old_key);
            }
        }
        self.alive.insert(IdentityKey::new(class, &copies)?, handle);
        self.objects.get_mut(handle)?.primary_vars = Some(copies);
        self.touch(handle);
        Ok(())
    }

    fn remove_from_alive(&mut self, handle: Handle) -> Result<()> {
        let info = self.objects.get_mut(handle)?;
        let class = info.cls_info().type_id();
        let Some(primary_vars) = info.primary_vars.take() else {
            return Ok(());
        };
        self.cache.remove(&handle);
        let key = IdentityKey::new(class, &primary_vars)?;
        if self.alive.get(&key) == Some(&handle) {
            self.alive.remove(&key);
        }
        Ok(())
    }

    fn enable_change_notification(&mut self, handle: Handle) -> Result<()> {
        let info = self.objects.get_mut(handle)?;
        if info.tracking {
            return Ok(());
        }
        info.tracking = true;
        self.emit_lifecycle(handle, Lifecycle::StartTracking)
    }

    fn disable_change_notification(&mut self, handle: Handle) -> Result<()> {
        let info = self.objects.get_mut(handle)?;
        if !info.tracking {
            return Ok(());
        }
        info.tracking = false;
        self.emit_lifecycle(handle, Lifecycle::StopTracking)
    }

    // ========================================================================
    // Hooks and events
    // ========================================================================

    fn run_hook(&mut self, handle: Handle, kind: HookKind) -> Result<()> {
        let hook: Option<ClassHook> = {
            let hooks = self.objects.get(handle)?.cls_info().hooks();
            match kind {
                HookKind::PreFlush => hooks.pre_flush.clone(),
                HookKind::Flushed => hooks.flushed.clone(),
                HookKind::Loaded => hooks.loaded.clone(),
                HookKind::Invalidated => hooks.invalidated.clone(),
            }
        };
        match hook {
            Some(hook) => hook(self, handle),
            None => Ok(()),
        }
    }

    fn emit_store(&mut self, event: StoreEvent) -> Result<()> {
        self.event.emit(event.name(), &event)
    }

    fn emit_lifecycle(&mut self, handle: Handle, point: Lifecycle) -> Result<()> {
        self.dispatch_lifecycle(handle, point)?;
        let info = self.objects.get_mut(handle)?;
        if info.event.has_hooks(point.name()) {
            info.event.emit(point.name(), &ObjectEvent::Lifecycle(handle))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("objects", &self.objects.len())
            .field("alive", &self.alive.len())
            .field("dirty", &self.dirty.len())
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Finds over an explicit table list. See [`Store::using`].
pub struct TableSet<'a> {
    store: &'a mut Store,
    tables: Vec<Expr>,
}

impl TableSet<'_> {
    pub fn find<T: Mapped>(self, condition: Option<Expr>) -> Result<ResultSet> {
        let spec = FindSpec::of::<T>()?;
        self.find_spec(spec, condition)
    }

    pub fn find_spec(self, spec: FindSpec, condition: Option<Expr>) -> Result<ResultSet> {
        self.store.implicit_flush()?;
        Ok(ResultSet::new(spec, condition, Some(self.tables)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{ClassHooks, ClassSpec, ColumnSpec};
    use crate::testing::{MockDb, Person, mock_store, mock_store_with};
    use std::sync::Mutex;
    use tessera_core::HookFlow;

    fn person(store: &mut Store, name: &str, age: i32) -> Handle {
        let handle = store.create::<Person>().unwrap();
        store.set_value(handle, "name", name).unwrap();
        store.set_value(handle, "age", age).unwrap();
        handle
    }

    /// Load person 1 through `get`.
    fn loaded(store: &mut Store, db: &MockDb) -> Handle {
        db.respond(
            "FROM person WHERE person.id = ?",
            vec![vec![Value::BigInt(30), Value::BigInt(1), Value::Text("Joe".into())]],
        );
        let handle = store.get::<Person>(1).unwrap().unwrap();
        db.clear();
        handle
    }

    #[test]
    fn insert_fetches_generated_key() {
        let (mut store, db) = mock_store();
        db.set_last_insert_id(7);
        db.respond("SELECT person.id FROM person", vec![vec![Value::BigInt(7)]]);
        let joe = person(&mut store, "Joe", 30);
        store.add(joe).unwrap();
        assert_eq!(store.pending(joe).unwrap(), Some(Pending::Add));
        store.flush().unwrap();

        let statements = db.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO person (age, name) VALUES (?, ?)");
        assert!(statements[1].starts_with("SELECT person.id FROM person WHERE person.id = ?"));
        assert_eq!(store.get_value(joe, "id").unwrap(), Value::BigInt(7));
        assert!(!store.is_dirty(joe));
        assert_eq!(store.pending(joe).unwrap(), None);
        let info = store.info(joe).unwrap();
        assert!(info.variables().iter().all(|v| !v.has_changed() || v.lazy().is_some()));
    }

    #[test]
    fn get_hits_identity_map_without_queries() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        assert_eq!(store.get::<Person>(1).unwrap(), Some(joe));
        assert!(db.statements().is_empty());
        assert_eq!(store.get_value(joe, "name").unwrap(), Value::Text("Joe".into()));
    }

    #[test]
    fn get_of_unknown_key_is_none() {
        let (mut store, db) = mock_store();
        assert_eq!(store.get::<Person>(42).unwrap(), None);
        assert_eq!(db.statements().len(), 1);
        let err = store.get::<Person>((1, 2)).unwrap_err();
        assert!(err.to_string().contains("expects a key of 1"));
    }

    #[test]
    fn update_writes_only_changed_columns() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.set_value(joe, "age", 31).unwrap();
        assert!(store.is_dirty(joe));
        store.flush().unwrap();
        let executed = db.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "UPDATE person SET age=? WHERE person.id = ?");
        assert_eq!(executed[0].1, vec![Value::BigInt(31), Value::BigInt(1)]);

        db.clear();
        store.flush().unwrap();
        assert!(db.statements().is_empty());
    }

    #[test]
    fn remove_then_flush_deletes_and_forgets() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.remove(joe).unwrap();
        store.flush().unwrap();
        let executed = db.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "DELETE FROM person WHERE person.id = ?");
        assert_eq!(executed[0].1, vec![Value::BigInt(1)]);
        assert!(!store.is_attached(joe).unwrap());

        db.clear();
        db.respond("FROM person WHERE person.id = ?", vec![]);
        assert_eq!(store.get::<Person>(1).unwrap(), None);
    }

    #[test]
    fn remove_of_pending_add_drops_it() {
        let (mut store, db) = mock_store();
        let ann = person(&mut store, "Ann", 20);
        store.add(ann).unwrap();
        store.remove(ann).unwrap();
        assert!(!store.is_dirty(ann));
        assert!(!store.is_attached(ann).unwrap());
        store.flush().unwrap();
        assert!(db.statements().is_empty());

        let err = store.remove(ann).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::WrongStore));
    }

    #[test]
    fn add_after_remove_revives() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.remove(joe).unwrap();
        store.add(joe).unwrap();
        assert_eq!(store.pending(joe).unwrap(), None);
        store.flush().unwrap();
        assert!(db.statements().is_empty());
        assert!(store.is_attached(joe).unwrap());
    }

    #[test]
    fn explicit_order_is_honored() {
        let (mut store, db) = mock_store();
        let a = person(&mut store, "a", 1);
        let b = person(&mut store, "b", 2);
        let c = person(&mut store, "c", 3);
        for (h, id) in [(a, 1), (b, 2), (c, 3)] {
            store.set_value(h, "id", id).unwrap();
            store.add(h).unwrap();
        }
        store.add_flush_order(c, a).unwrap();
        store.flush().unwrap();
        let order: Vec<Value> = db.executed().into_iter().map(|(_, p)| p[1].clone()).collect();
        assert_eq!(
            order,
            vec![Value::BigInt(2), Value::BigInt(3), Value::BigInt(1)]
        );
    }

    #[test]
    fn ordering_cycle_is_an_error_and_keeps_state() {
        let (mut store, db) = mock_store();
        let a = person(&mut store, "a", 1);
        let b = person(&mut store, "b", 2);
        store.add(a).unwrap();
        store.add(b).unwrap();
        store.add_flush_order(a, b).unwrap();
        store.add_flush_order(b, a).unwrap();
        let err = store.flush().unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::OrderLoop));
        assert!(store.is_dirty(a) && store.is_dirty(b));
        assert!(db.statements().is_empty());

        store.remove_flush_order(b, a);
        db.set_last_insert_id(1);
        db.respond("SELECT person.id", vec![vec![Value::BigInt(1)]]);
        store.flush().unwrap();
        assert!(!store.is_dirty(a) && !store.is_dirty(b));
    }

    #[test]
    fn failed_flush_keeps_object_dirty() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.set_value(joe, "age", 40).unwrap();
        db.fail_next("UPDATE", "disk full");
        assert!(store.flush().is_err());
        assert!(store.is_dirty(joe));
        store.flush().unwrap();
        assert!(!store.is_dirty(joe));
    }

    #[test]
    fn commit_invalidates_and_get_revalidates() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.commit().unwrap();
        assert_eq!(db.commits(), 1);
        assert!(store.info(joe).unwrap().is_invalidated());
        assert_eq!(store.field(joe, "name").unwrap(), Field::Lazy(LazyValue::AutoReload));

        db.respond(
            "FROM person WHERE person.id = ?",
            vec![vec![Value::BigInt(35), Value::BigInt(1), Value::Text("Joe".into())]],
        );
        assert_eq!(store.get::<Person>(1).unwrap(), Some(joe));
        assert!(!store.info(joe).unwrap().is_invalidated());
        assert_eq!(store.get_value(joe, "age").unwrap(), Value::BigInt(35));
    }

    #[test]
    fn writing_to_invalidated_object_checks_it_still_exists() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.invalidate(Some(joe)).unwrap();
        db.respond("SELECT 1", vec![]);
        let err = store.set_value(joe, "age", 50).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::LostObject));
    }

    #[test]
    fn lazy_values_load_on_read() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.autoreload(Some(joe)).unwrap();
        db.respond(
            "SELECT person.age, person.name FROM person WHERE person.id = ?",
            vec![vec![Value::BigInt(44), Value::Text("Joseph".into())]],
        );
        assert_eq!(store.get_value(joe, "name").unwrap(), Value::Text("Joseph".into()));
        assert_eq!(db.statements().len(), 1);
        assert_eq!(store.get_value(joe, "age").unwrap(), Value::BigInt(44));
        assert_eq!(db.statements().len(), 1);
        assert!(!store.is_dirty(joe));
    }

    #[test]
    fn lazy_expression_is_written_as_sql() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        let age = ClassInfo::of::<Person>().unwrap().column("age").unwrap().clone();
        store
            .set_lazy(joe, "age", LazyValue::expr(age.add(1)))
            .unwrap();
        store.flush().unwrap();
        assert_eq!(db.statements()[0], "UPDATE person SET age=age+? WHERE person.id = ?");
        assert_eq!(store.field(joe, "age").unwrap(), Field::Lazy(LazyValue::AutoReload));
    }

    #[test]
    fn rollback_restores_pending_flags() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        let ann = person(&mut store, "Ann", 20);
        store.add(ann).unwrap();
        store.remove(joe).unwrap();
        store.rollback().unwrap();
        assert_eq!(db.rollbacks(), 1);
        assert!(!store.is_attached(ann).unwrap());
        assert_eq!(store.pending(joe).unwrap(), None);
        assert!(store.is_attached(joe).unwrap());
        assert!(!store.is_dirty(joe));
        assert!(store.info(joe).unwrap().is_invalidated());
    }

    #[test]
    fn reload_requires_a_flushed_object() {
        let (mut store, db) = mock_store();
        let ann = person(&mut store, "Ann", 20);
        let err = store.reload(ann).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::WrongStore));
        store.add(ann).unwrap();
        store.block_implicit_flushes();
        let err = store.reload(ann).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::NotFlushed));

        let joe = loaded(&mut store, &db);
        store.set_value(joe, "age", 99).unwrap();
        db.respond(
            "FROM person WHERE person.id = ?",
            vec![vec![Value::BigInt(30), Value::BigInt(1), Value::Text("Joe".into())]],
        );
        store.reload(joe).unwrap();
        assert!(!store.is_dirty(joe));
        assert_eq!(store.get_value(joe, "age").unwrap(), Value::BigInt(30));
    }

    #[test]
    fn lazy_loads_respect_disabled_implicit_flush() {
        let (mut store, db) = mock_store_with(StoreConfig::default().implicit_flush(false));
        let joe = loaded(&mut store, &db);
        let ann = person(&mut store, "Ann", 20);
        store.add(ann).unwrap();
        store.autoreload(Some(joe)).unwrap();

        db.respond(
            "SELECT person.age, person.name FROM person",
            vec![vec![Value::BigInt(31), Value::Text("Joe".into())]],
        );
        assert_eq!(store.get_value(joe, "age").unwrap(), Value::BigInt(31));
        assert_eq!(
            db.statements(),
            vec!["SELECT person.age, person.name FROM person WHERE person.id = ?"]
        );
        assert!(store.is_dirty(ann));
    }

    #[test]
    fn released_objects_are_collected_once_uncached() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.release(joe).unwrap();
        assert!(store.info(joe).is_ok());
        store.set_cache_size(0);
        let err = store.info(joe).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::StaleHandle));
        assert!(store.alive().is_empty());

        let scratch = store.create::<Person>().unwrap();
        store.release(scratch).unwrap();
        assert_eq!(store.object_count(), 0);
    }

    #[test]
    fn handles_of_other_stores_are_rejected() {
        let (mut one, _) = mock_store();
        let (mut two, _) = mock_store();
        let joe = one.create::<Person>().unwrap();
        let err = two.add(joe).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::WrongStore));
    }

    struct Audited;

    static FLUSHED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    impl Mapped for Audited {
        fn class_spec() -> ClassSpec {
            ClassSpec::new("audited")
                .column("id", ColumnSpec::int().primary())
                .column("stamp", ColumnSpec::int())
                .hooks(
                    ClassHooks::new()
                        .on_pre_flush(|store, handle| store.set_value(handle, "stamp", 1))
                        .on_flushed(|_, handle| {
                            FLUSHED.lock().unwrap().push(handle.to_string());
                            Ok(())
                        }),
                )
        }
    }

    #[test]
    fn class_hooks_run_around_flush() {
        let (mut store, db) = mock_store();
        let obj = store.create::<Audited>().unwrap();
        store.set_value(obj, "id", 5).unwrap();
        store.add(obj).unwrap();
        store.flush().unwrap();
        assert_eq!(db.statements(), vec!["INSERT INTO audited (id, stamp) VALUES (?, ?)"]);
        assert!(FLUSHED.lock().unwrap().contains(&obj.to_string()));
    }

    #[test]
    fn events_reach_hooks() {
        let (mut store, db) = mock_store();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        store.event().hook("flush", move |event: &StoreEvent| {
            sink.lock().unwrap().push(event.name());
            Ok(HookFlow::Unhook)
        });
        let joe = loaded(&mut store, &db);
        let changes = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&changes);
        store
            .object_event(joe)
            .unwrap()
            .hook("changed", move |event: &ObjectEvent| {
                if let ObjectEvent::Changed { attribute, .. } = event {
                    sink.lock().unwrap().push(attribute.clone());
                }
                Ok(HookFlow::Continue)
            });
        store.set_value(joe, "name", "Jo").unwrap();
        store.flush().unwrap();
        store.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["flush"]);
        assert_eq!(*changes.lock().unwrap(), vec!["name".to_string()]);
    }

    #[test]
    fn execute_flushes_first() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.set_value(joe, "age", 12).unwrap();
        store.execute_sql("SELECT 1", &[]).unwrap();
        let statements = db.statements();
        assert!(statements[0].starts_with("UPDATE person"));
        assert_eq!(statements[1], "SELECT 1");
    }

    #[test]
    fn reset_forgets_everything() {
        let (mut store, db) = mock_store();
        let joe = loaded(&mut store, &db);
        store.set_value(joe, "age", 1).unwrap();
        store.reset();
        assert!(!store.is_dirty(joe));
        assert!(store.alive().is_empty());
        assert!(!store.is_attached(joe).unwrap());
    }
}

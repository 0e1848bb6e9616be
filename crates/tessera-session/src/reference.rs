//! Declarative links between mapped classes.
//!
//! # Role In The Architecture
//!
//! A [`Reference`] or [`ReferenceSet`] is declared once per relationship
//! and shared by all objects. On first use it resolves into a
//! [`Relation`], the column-level description both sides are linked by.
//!
//! Linking two objects records the remote in the local object's relation
//! data and installs link hooks on both sides. The store dispatches
//! variable changes and lifecycle points to those hooks:
//!
//! - while a link is being established by assignment, key changes on the
//!   referenced side are copied to the foreign key, so a generated primary
//!   key reaches the referencing row before it is flushed;
//! - manual edits that diverge from the linked value break the link;
//! - flushing the propagating side, or removing the remote, breaks it too.
//!
//! The side owning the foreign key is always ordered after the side it
//! references through [`Store::add_flush_order`].
//!
//! ```ignore
//! static TEAM: LazyLock<Reference> =
//!     LazyLock::new(|| Reference::new::<Player, Team>(["team_id"], ["id"]));
//!
//! TEAM.set(&mut store, player, Some(team))?;
//! store.add(player)?; // adds the team too
//! store.flush()?;     // INSERT team, then INSERT player with team_id
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tessera_core::{
    Column, Error, Expr, Field, Join, JoinKind, LazyValue, MappingErrorKind, Result, Select,
    StoreErrorKind, Value, VariableChange, compare_columns,
};

use crate::info::{ClassInfo, Mapped};
use crate::object::Handle;
use crate::result_set::{FindSpec, ResultSet, SpecItem};
use crate::store::{Key, Lifecycle, Store};

static NEXT_RELATION_ID: AtomicU64 = AtomicU64::new(1);

type ClassFn = fn() -> Result<Arc<ClassInfo>>;

fn no_store() -> Error {
    Error::store(StoreErrorKind::NoStore, "Can't perform operation without a store")
}

// ============================================================================
// Relation
// ============================================================================

/// Column-level description of a relationship between two classes.
#[derive(Debug)]
pub struct Relation {
    id: u64,
    local_cls: Arc<ClassInfo>,
    remote_cls: Arc<ClassInfo>,
    local_key: Vec<usize>,
    remote_key: Vec<usize>,
    local_columns: Vec<Column>,
    remote_columns: Vec<Column>,
    remote_key_is_primary: bool,
    many: bool,
    on_remote: bool,
}

impl Relation {
    /// Resolve attribute names on both classes.
    ///
    /// With `on_remote`, the remote key is the foreign key onto the local
    /// key; otherwise the local key references the remote one.
    pub fn new(
        local_cls: Arc<ClassInfo>,
        local_key: &[String],
        remote_cls: Arc<ClassInfo>,
        remote_key: &[String],
        many: bool,
        on_remote: bool,
    ) -> Result<Self> {
        if local_key.is_empty() || local_key.len() != remote_key.len() {
            return Err(Error::mapping(
                MappingErrorKind::ClassInfo,
                format!(
                    "{} and {} are related through keys of different lengths",
                    local_cls.name(),
                    remote_cls.name()
                ),
            ));
        }
        let local_key = local_key
            .iter()
            .map(|attr| local_cls.resolve(attr))
            .collect::<Result<Vec<_>>>()?;
        let remote_key = remote_key
            .iter()
            .map(|attr| remote_cls.resolve(attr))
            .collect::<Result<Vec<_>>>()?;
        let local_columns = local_key.iter().map(|&i| local_cls.columns()[i].clone()).collect();
        let remote_columns = remote_key.iter().map(|&i| remote_cls.columns()[i].clone()).collect();
        let remote_key_is_primary = remote_key == remote_cls.primary_key_pos();
        Ok(Self {
            id: NEXT_RELATION_ID.fetch_add(1, Ordering::Relaxed),
            local_cls,
            remote_cls,
            local_key,
            remote_key,
            local_columns,
            remote_columns,
            remote_key_is_primary,
            many,
            on_remote,
        })
    }

    pub fn local_cls(&self) -> &Arc<ClassInfo> {
        &self.local_cls
    }

    pub fn remote_cls(&self) -> &Arc<ClassInfo> {
        &self.remote_cls
    }

    pub fn local_columns(&self) -> &[Column] {
        &self.local_columns
    }

    pub fn remote_columns(&self) -> &[Column] {
        &self.remote_columns
    }

    pub fn remote_key_is_primary(&self) -> bool {
        self.remote_key_is_primary
    }

    fn remote_index_for(&self, local_index: usize) -> Option<usize> {
        let position = self.local_key.iter().position(|&i| i == local_index)?;
        Some(self.remote_key[position])
    }

    fn local_index_for(&self, remote_index: usize) -> Option<usize> {
        let position = self.remote_key.iter().position(|&i| i == remote_index)?;
        Some(self.local_key[position])
    }

    /// The linked remote of a single-valued relation, revalidated if it
    /// was invalidated. A remote that is gone reads as `None`.
    pub fn get_remote(&self, store: &mut Store, local: Handle) -> Result<Option<Handle>> {
        let Some(remote) = store
            .relations
            .get(&(local, self.id))
            .and_then(|data| data.remotes.first().copied())
        else {
            return Ok(None);
        };
        match store.revalidate(remote) {
            Ok(()) => Ok(Some(remote)),
            Err(error) if error.store_kind() == Some(StoreErrorKind::LostObject) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Current host values of the local key, loading lazy ones.
    pub fn local_values(&self, store: &mut Store, local: Handle) -> Result<Vec<Value>> {
        self.local_key
            .iter()
            .map(|&index| store.get_value_at(local, index))
            .collect()
    }

    pub fn local_variables_are_none(&self, store: &mut Store, local: Handle) -> Result<bool> {
        Ok(self.local_values(store, local)?.iter().all(Value::is_null))
    }

    /// Condition matching the remote objects that relate to `local`.
    /// Flushes first if part of the local key is not known yet.
    pub fn where_for_remote(&self, store: &mut Store, local: Handle) -> Result<Expr> {
        let undefined = {
            let info = store.info(local)?;
            self.local_key.iter().any(|&i| !info.variable(i).is_defined())
        };
        if undefined {
            store.flush()?;
        }
        let mut params = Vec::with_capacity(self.local_key.len());
        for &index in &self.local_key {
            store.get_value_at(local, index)?;
            params.push(Expr::Param(store.info(local)?.variable(index).clone()));
        }
        compare_columns(&self.remote_columns, params)
            .ok_or_else(|| Error::Custom("relation has an empty key".to_string()))
    }

    /// Condition matching the local objects that relate to `remote`.
    pub fn where_for_local(&self, store: &Store, remote: Handle) -> Result<Expr> {
        let info = store.info(remote)?;
        let params: Vec<Expr> = self
            .remote_key
            .iter()
            .map(|&i| Expr::Param(info.variable(i).clone()))
            .collect();
        compare_columns(&self.local_columns, params)
            .ok_or_else(|| Error::Custom("relation has an empty key".to_string()))
    }

    /// Condition matching local objects whose key equals `values`.
    pub fn where_for_local_values(&self, values: Vec<Value>) -> Result<Expr> {
        if values.len() != self.local_columns.len() {
            return Err(Error::Custom(format!(
                "expected {} key values, got {}",
                self.local_columns.len(),
                values.len()
            )));
        }
        let params = self
            .local_columns
            .iter()
            .zip(values)
            .map(|(column, value)| column.factory().param(value).map(Expr::Param))
            .collect::<Result<Vec<_>>>()?;
        compare_columns(&self.local_columns, params)
            .ok_or_else(|| Error::Custom("relation has an empty key".to_string()))
    }

    /// Join condition between the two tables.
    pub fn where_for_join(&self) -> Expr {
        let pairs = self
            .local_columns
            .iter()
            .zip(&self.remote_columns)
            .map(|(local, remote)| local.eq(remote));
        Expr::and_all(pairs).unwrap_or(Expr::Null)
    }

    // ========================================================================
    // Linking
    // ========================================================================

    /// Record that `local` relates to `remote`.
    ///
    /// With `setting`, the relationship is being created: the key is copied
    /// to the foreign-key side and detached objects are added to the store
    /// of the other side, or deferred until one of them is added.
    pub fn link(self: &Arc<Self>, store: &mut Store, local: Handle, remote: Handle, setting: bool) -> Result<()> {
        if local.store_id() != remote.store_id() {
            return Err(Error::store(
                StoreErrorKind::WrongStore,
                format!("{local} and {remote} cannot be linked because they are in different stores"),
            ));
        }
        if setting {
            match (store.is_attached(local)?, store.is_attached(remote)?) {
                (false, false) => {
                    store.hook_link(local, self.link_hook(LinkKind::AddAll, local, local));
                    store.hook_link(remote, self.link_hook(LinkKind::AddAll, local, local));
                }
                (false, true) => store.add(local)?,
                (true, false) => store.add(remote)?,
                (true, true) => {}
            }
        }

        if !self.many {
            let old = store
                .relations
                .get(&(local, self.id))
                .and_then(|data| data.remotes.first().copied());
            if let Some(old) = old {
                self.unlink(store, local, Some(old), false)?;
            }
        }
        store.hold_remote((local, self.id), remote);
        tracing::trace!(relation = self.id, %local, %remote, setting, "Linked");

        if !setting {
            store.hook_link(local, self.link_hook(LinkKind::BreakOnLocalDiverged, local, remote));
            store.hook_link(remote, self.link_hook(LinkKind::BreakOnRemoteDiverged, local, remote));
            if self.on_remote {
                store.hook_link(remote, self.link_hook(LinkKind::BreakOnRemoteRemoved, local, remote));
            }
            return Ok(());
        }

        let (source, target) = if self.on_remote { (local, remote) } else { (remote, local) };
        let mut source_changed = false;
        for (&local_index, &remote_index) in self.local_key.iter().zip(&self.remote_key) {
            let (source_index, target_index) = if self.on_remote {
                (local_index, remote_index)
            } else {
                (remote_index, local_index)
            };
            let reloadable = matches!(
                store.info(source)?.variable(source_index).lazy(),
                Some(LazyValue::AutoReload)
            );
            if reloadable {
                store.get_value_at(source, source_index)?;
            }
            let variable = store.info(source)?.variable(source_index);
            let changed = variable.has_changed();
            match variable.get(false)? {
                Some(value) => store.set_variable_at(target, target_index, value, false)?,
                None => store.set_lazy_at(target, target_index, LazyValue::PendingReference)?,
            }
            source_changed |= changed;
        }

        if self.on_remote {
            if source_changed {
                self.add_flush_order(store, local, remote, false)?;
            }
            store.hook_link(local, self.link_hook(LinkKind::TrackLocalChanges, local, remote));
            store.hook_link(local, self.link_hook(LinkKind::BreakOnLocalFlushed, local, remote));
            store.hook_link(remote, self.link_hook(LinkKind::BreakOnRemoteRemoved, local, remote));
        } else {
            if source_changed {
                self.add_flush_order(store, local, remote, true)?;
            }
            store.hook_link(remote, self.link_hook(LinkKind::TrackRemoteChanges, local, remote));
            store.hook_link(remote, self.link_hook(LinkKind::BreakOnRemoteFlushed, local, remote));
            store.hook_link(local, self.link_hook(LinkKind::BreakOnLocalDiverged, local, remote));
        }
        tracing::trace!(%source, %target, "Propagated key");
        Ok(())
    }

    /// Break the link between `local` and `remote`. With `setting`, the
    /// foreign key is set to NULL so the breakage is persisted.
    pub fn unlink(&self, store: &mut Store, local: Handle, remote: Option<Handle>, setting: bool) -> Result<()> {
        if let Some(remote) = remote {
            self.forget_remote(store, local, remote)?;
        }
        if setting {
            if self.on_remote {
                if let Some(remote) = remote {
                    for &index in &self.remote_key {
                        store.set_variable_at(remote, index, Value::Null, false)?;
                    }
                }
            } else {
                for &index in &self.local_key {
                    store.set_variable_at(local, index, Value::Null, false)?;
                }
            }
        }
        Ok(())
    }

    fn forget_remote(&self, store: &mut Store, local: Handle, remote: Handle) -> Result<()> {
        let key = (local, self.id);
        if !store.release_remote(key, remote) {
            return Ok(());
        }
        let no_remotes = store
            .relations
            .get(&key)
            .is_none_or(|data| data.remotes.is_empty());
        tracing::trace!(relation = self.id, %local, %remote, "Unlinked");

        for kind in [
            LinkKind::TrackLocalChanges,
            LinkKind::BreakOnLocalDiverged,
            LinkKind::BreakOnLocalFlushed,
        ] {
            store.unhook_link(local, self.id, kind, local, remote);
        }
        for kind in [
            LinkKind::TrackRemoteChanges,
            LinkKind::BreakOnRemoteDiverged,
            LinkKind::BreakOnRemoteFlushed,
            LinkKind::BreakOnRemoteRemoved,
        ] {
            store.unhook_link(remote, self.id, kind, local, remote);
        }

        let attached = store.objects.get(local).is_ok_and(|info| info.attached);
        if attached {
            let ordered = store
                .relations
                .get_mut(&key)
                .is_some_and(|data| data.flush_order.remove(&remote));
            if ordered {
                if self.on_remote {
                    store.remove_flush_order(local, remote);
                } else {
                    store.remove_flush_order(remote, local);
                }
            }
        } else {
            if !self.many || no_remotes {
                store.unhook_link(local, self.id, LinkKind::AddAll, local, local);
            }
            store.unhook_link(remote, self.id, LinkKind::AddAll, local, local);
        }

        if store
            .relations
            .get(&key)
            .is_some_and(|data| data.remotes.is_empty() && data.flush_order.is_empty())
        {
            store.relations.remove(&key);
        }
        Ok(())
    }

    fn add_flush_order(&self, store: &mut Store, local: Handle, remote: Handle, remote_first: bool) -> Result<()> {
        if !store.is_attached(local)? {
            return Ok(());
        }
        let fresh = store
            .relations
            .entry((local, self.id))
            .or_default()
            .flush_order
            .insert(remote);
        if fresh {
            if remote_first {
                store.add_flush_order(remote, local)?;
            } else {
                store.add_flush_order(local, remote)?;
            }
        }
        Ok(())
    }

    /// Deferred link completion: add `local` and everything linked to it.
    fn add_all(&self, store: &mut Store, local: Handle) -> Result<()> {
        store.unhook_link(local, self.id, LinkKind::AddAll, local, local);
        store.add(local)?;
        let remotes = store
            .relations
            .get(&(local, self.id))
            .map(|data| data.remotes.clone())
            .unwrap_or_default();
        for remote in remotes {
            store.unhook_link(remote, self.id, LinkKind::AddAll, local, local);
            store.add(remote)?;
            self.add_flush_order(store, local, remote, !self.on_remote)?;
        }
        Ok(())
    }

    fn link_hook(self: &Arc<Self>, kind: LinkKind, local: Handle, remote: Handle) -> LinkHook {
        LinkHook {
            relation: Arc::clone(self),
            kind,
            local,
            remote,
        }
    }

    fn on_changed(&self, store: &mut Store, hook: &LinkHook, index: usize, change: &VariableChange) -> Result<()> {
        match hook.kind {
            LinkKind::TrackLocalChanges => {
                if let Some(remote_index) = self.remote_index_for(index) {
                    propagate(store, hook.local, index, hook.remote, remote_index, change)?;
                    self.add_flush_order(store, hook.local, hook.remote, false)?;
                }
            }
            LinkKind::TrackRemoteChanges => {
                if let Some(local_index) = self.local_index_for(index) {
                    propagate(store, hook.remote, index, hook.local, local_index, change)?;
                    self.add_flush_order(store, hook.local, hook.remote, true)?;
                }
            }
            LinkKind::BreakOnLocalDiverged => {
                if let Some(remote_index) = self.remote_index_for(index) {
                    let new = store.info(hook.local)?.variable(index).get(false)?;
                    let other = store.info(hook.remote)?.variable(remote_index);
                    let diverged = other.lazy().is_none()
                        && (!matches!(change.new, Field::Concrete(_)) || other.get(false)? != new);
                    if diverged {
                        self.unlink(store, hook.local, Some(hook.remote), false)?;
                    }
                }
            }
            LinkKind::BreakOnRemoteDiverged => {
                if let Some(local_index) = self.local_index_for(index) {
                    let new = store.info(hook.remote)?.variable(index).get(false)?;
                    let current = store.info(hook.local)?.variable(local_index).get(false)?;
                    if !matches!(change.new, Field::Concrete(_)) || current != new {
                        self.unlink(store, hook.local, Some(hook.remote), false)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_lifecycle(&self, store: &mut Store, hook: &LinkHook, point: Lifecycle) -> Result<()> {
        match (hook.kind, point) {
            (LinkKind::AddAll, Lifecycle::Added) => self.add_all(store, hook.local),
            (LinkKind::BreakOnLocalFlushed | LinkKind::BreakOnRemoteFlushed, Lifecycle::Flushed)
            | (LinkKind::BreakOnRemoteRemoved, Lifecycle::Removed) => {
                self.unlink(store, hook.local, Some(hook.remote), false)
            }
            _ => Ok(()),
        }
    }
}

/// Copy a change of `source`'s key column to `target`'s matching column.
fn propagate(
    store: &mut Store,
    source: Handle,
    source_index: usize,
    target: Handle,
    target_index: usize,
    change: &VariableChange,
) -> Result<()> {
    match &change.new {
        Field::Undefined => {
            let change = store.objects.get_mut(target)?.variables[target_index].delete();
            if let Some(change) = change {
                store.variable_changed(target, target_index, change)?;
            }
            Ok(())
        }
        Field::Lazy(lazy) => store.set_lazy_at(target, target_index, lazy.clone()),
        Field::Concrete(_) => {
            let value = store
                .info(source)?
                .variable(source_index)
                .get(false)?
                .unwrap_or(Value::Null);
            store.set_variable_at(target, target_index, value, false)
        }
    }
}

// ============================================================================
// Link records
// ============================================================================

/// Per-object state of one relation.
#[derive(Debug, Default)]
pub(crate) struct RelationData {
    pub(crate) remotes: Vec<Handle>,
    /// Remotes this relation recorded a flush order against.
    pub(crate) flush_order: HashSet<Handle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    TrackLocalChanges,
    TrackRemoteChanges,
    BreakOnLocalDiverged,
    BreakOnRemoteDiverged,
    BreakOnLocalFlushed,
    BreakOnRemoteFlushed,
    BreakOnRemoteRemoved,
    AddAll,
}

impl LinkKind {
    fn on_changed(self) -> bool {
        matches!(
            self,
            LinkKind::TrackLocalChanges
                | LinkKind::TrackRemoteChanges
                | LinkKind::BreakOnLocalDiverged
                | LinkKind::BreakOnRemoteDiverged
        )
    }
}

/// A hook installed on one side of a link.
#[derive(Debug, Clone)]
pub(crate) struct LinkHook {
    relation: Arc<Relation>,
    kind: LinkKind,
    local: Handle,
    remote: Handle,
}

impl LinkHook {
    fn matches(&self, relation: u64, kind: LinkKind, local: Handle, remote: Handle) -> bool {
        self.relation.id == relation && self.kind == kind && self.local == local && self.remote == remote
    }
}

impl Store {
    fn hook_link(&mut self, owner: Handle, hook: LinkHook) {
        let hooks = self.link_hooks.entry(owner).or_default();
        if !hooks
            .iter()
            .any(|h| h.matches(hook.relation.id, hook.kind, hook.local, hook.remote))
        {
            hooks.push(hook);
        }
    }

    fn unhook_link(&mut self, owner: Handle, relation: u64, kind: LinkKind, local: Handle, remote: Handle) {
        if let Some(hooks) = self.link_hooks.get_mut(&owner) {
            hooks.retain(|h| !h.matches(relation, kind, local, remote));
            if hooks.is_empty() {
                self.link_hooks.remove(&owner);
            }
        }
    }

    fn has_link_hook(&self, owner: Handle, hook: &LinkHook) -> bool {
        self.link_hooks.get(&owner).is_some_and(|hooks| {
            hooks
                .iter()
                .any(|h| h.matches(hook.relation.id, hook.kind, hook.local, hook.remote))
        })
    }

    /// Deliver a variable change to the link hooks of its object. Hooks
    /// removed by an earlier hook in the same dispatch are skipped.
    pub(crate) fn dispatch_changed(&mut self, owner: Handle, index: usize, change: &VariableChange) -> Result<()> {
        let Some(hooks) = self.link_hooks.get(&owner) else {
            return Ok(());
        };
        let snapshot: Vec<LinkHook> = hooks.iter().filter(|h| h.kind.on_changed()).cloned().collect();
        for hook in snapshot {
            if self.has_link_hook(owner, &hook) {
                let relation = Arc::clone(&hook.relation);
                relation.on_changed(self, &hook, index, change)?;
            }
        }
        Ok(())
    }

    pub(crate) fn dispatch_lifecycle(&mut self, owner: Handle, point: Lifecycle) -> Result<()> {
        let Some(hooks) = self.link_hooks.get(&owner) else {
            return Ok(());
        };
        let snapshot: Vec<LinkHook> = hooks.iter().filter(|h| !h.kind.on_changed()).cloned().collect();
        for hook in snapshot {
            if self.has_link_hook(owner, &hook) {
                let relation = Arc::clone(&hook.relation);
                relation.on_lifecycle(self, &hook, point)?;
            }
        }
        Ok(())
    }

    /// Record `remote` under the relation data at `key`. Returns false if
    /// it was already there.
    pub(crate) fn hold_remote(&mut self, key: (Handle, u64), remote: Handle) -> bool {
        let data = self.relations.entry(key).or_default();
        if data.remotes.contains(&remote) {
            return false;
        }
        data.remotes.push(remote);
        *self.remote_links.entry(remote).or_default() += 1;
        true
    }

    /// Forget `remote` from the relation data at `key`. Returns false if it
    /// was not held.
    pub(crate) fn release_remote(&mut self, key: (Handle, u64), remote: Handle) -> bool {
        let Some(data) = self.relations.get_mut(&key) else {
            return false;
        };
        let Some(position) = data.remotes.iter().position(|r| *r == remote) else {
            return false;
        };
        data.remotes.remove(position);
        self.forget_remote_link(remote);
        true
    }

    fn forget_remote_link(&mut self, remote: Handle) {
        if let Some(count) = self.remote_links.get_mut(&remote) {
            *count -= 1;
            if *count == 0 {
                self.remote_links.remove(&remote);
            }
        }
    }

    /// Whether some object holds `handle` as a linked remote.
    pub(crate) fn is_linked(&self, handle: Handle) -> bool {
        self.remote_links.contains_key(&handle)
    }

    /// Drop every link record involving a collected object.
    pub(crate) fn drop_links(&mut self, handle: Handle) {
        let owned: Vec<(Handle, u64)> =
            self.relations.keys().filter(|(local, _)| *local == handle).copied().collect();
        for key in owned {
            if let Some(data) = self.relations.remove(&key) {
                for remote in data.remotes {
                    self.forget_remote_link(remote);
                }
            }
        }
        self.link_hooks.remove(&handle);
        self.link_hooks.retain(|_, hooks| {
            hooks.retain(|h| h.local != handle && h.remote != handle);
            !hooks.is_empty()
        });
    }
}

// ============================================================================
// Declarations
// ============================================================================

fn attrs<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

fn resolved(cell: &OnceLock<Arc<Relation>>, build: impl FnOnce() -> Result<Relation>) -> Result<Arc<Relation>> {
    if let Some(relation) = cell.get() {
        return Ok(Arc::clone(relation));
    }
    let relation = Arc::new(build()?);
    Ok(Arc::clone(cell.get_or_init(|| relation)))
}

/// A single-valued relationship.
pub struct Reference {
    local: ClassFn,
    remote: ClassFn,
    local_key: Vec<String>,
    remote_key: Vec<String>,
    on_remote: bool,
    relation: OnceLock<Arc<Relation>>,
}

impl Reference {
    /// `L`'s `local_key` references `R`'s `remote_key`.
    pub fn new<L: Mapped, R: Mapped, I, S>(local_key: I, remote_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local: ClassInfo::of::<L>,
            remote: ClassInfo::of::<R>,
            local_key: attrs(local_key),
            remote_key: attrs(remote_key),
            on_remote: false,
            relation: OnceLock::new(),
        }
    }

    /// `R`'s `remote_key` references `L`'s `local_key`.
    pub fn on_remote<L: Mapped, R: Mapped, I, S>(local_key: I, remote_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            on_remote: true,
            ..Self::new::<L, R, I, S>(local_key, remote_key)
        }
    }

    pub fn relation(&self) -> Result<Arc<Relation>> {
        resolved(&self.relation, || {
            Relation::new(
                (self.local)()?,
                &self.local_key,
                (self.remote)()?,
                &self.remote_key,
                false,
                self.on_remote,
            )
        })
    }

    /// The related object, loading it if it is not linked yet.
    pub fn get(&self, store: &mut Store, local: Handle) -> Result<Option<Handle>> {
        let relation = self.relation()?;
        if let Some(remote) = relation.get_remote(store, local)? {
            return Ok(Some(remote));
        }
        if relation.local_variables_are_none(store, local)? || !store.is_attached(local)? {
            return Ok(None);
        }
        let remote = if relation.remote_key_is_primary {
            let key = Key(relation.local_values(store, local)?);
            store.get_by_info(&relation.remote_cls, key)?
        } else {
            let condition = relation.where_for_remote(store, local)?;
            let spec = FindSpec::single(SpecItem::Class(Arc::clone(&relation.remote_cls)));
            store
                .find_spec(spec, Some(condition))?
                .one(store)?
                .and_then(|found| found.handle())
        };
        if let Some(remote) = remote {
            relation.link(store, local, remote, false)?;
        }
        Ok(remote)
    }

    /// Relate `local` to `remote`, or break the relationship with `None`.
    pub fn set(&self, store: &mut Store, local: Handle, remote: Option<Handle>) -> Result<()> {
        let relation = self.relation()?;
        match remote {
            Some(remote) => relation.link(store, local, remote, true),
            None => {
                let remote = if relation.on_remote {
                    match self.get(store, local)? {
                        Some(remote) => Some(remote),
                        None => return Ok(()),
                    }
                } else {
                    relation.get_remote(store, local)?
                };
                relation.unlink(store, local, remote, true)
            }
        }
    }

    /// Point the local key at raw values.
    pub fn set_key(&self, store: &mut Store, local: Handle, values: Vec<Value>) -> Result<()> {
        let relation = self.relation()?;
        if values.len() != relation.local_key.len() {
            return Err(Error::Custom(format!(
                "expected {} key values, got {}",
                relation.local_key.len(),
                values.len()
            )));
        }
        for (&index, value) in relation.local_key.iter().zip(values) {
            store.set_variable_at(local, index, value, false)?;
        }
        Ok(())
    }

    /// Condition matching local objects related to `remote`.
    pub fn where_for_local(&self, store: &Store, remote: Handle) -> Result<Expr> {
        self.relation()?.where_for_local(store, remote)
    }

    pub fn where_for_local_values(&self, values: Vec<Value>) -> Result<Expr> {
        self.relation()?.where_for_local_values(values)
    }

    pub fn where_for_join(&self) -> Result<Expr> {
        Ok(self.relation()?.where_for_join())
    }
}

/// A remote attribute exposed on the local class through a [`Reference`].
///
/// Reading and writing go through the referenced object. In a query the
/// proxy stands for the remote column and brings in a LEFT JOIN from the
/// local table to the remote one.
///
/// ```ignore
/// static TEAM_NAME: LazyLock<Proxy> = LazyLock::new(|| Proxy::new(&TEAM, "name"));
///
/// TEAM_NAME.get(&mut store, player)?;
/// store.find::<Player>(Some(TEAM_NAME.expr()?.eq("Reds")))?;
/// ```
pub struct Proxy {
    reference: &'static Reference,
    attribute: String,
}

impl Proxy {
    pub fn new(reference: &'static Reference, attribute: impl Into<String>) -> Self {
        Self {
            reference,
            attribute: attribute.into(),
        }
    }

    pub fn column(&self) -> Result<Column> {
        let relation = self.reference.relation()?;
        Ok(relation.remote_cls.column(&self.attribute)?.clone())
    }

    /// The remote value, or `None` when nothing is referenced.
    pub fn get(&self, store: &mut Store, local: Handle) -> Result<Option<Value>> {
        match self.reference.get(store, local)? {
            Some(remote) => Ok(Some(store.get_value(remote, &self.attribute)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, store: &mut Store, local: Handle, value: impl Into<Value>) -> Result<()> {
        let Some(remote) = self.reference.get(store, local)? else {
            return Err(Error::Custom(format!(
                "Can't set {} through an empty reference",
                self.attribute
            )));
        };
        store.set_value(remote, &self.attribute, value)
    }

    /// The remote column, joined to the local table.
    pub fn expr(&self) -> Result<Expr> {
        let relation = self.reference.relation()?;
        let join = Join::new(
            JoinKind::Left,
            relation.local_cls.table().clone(),
            relation.remote_cls.table().clone(),
        )
        .on(relation.where_for_join());
        Ok(Expr::from(self.column()?).with_auto_tables(vec![Expr::from(join)], false))
    }
}

/// A many-valued relationship, direct or through a link class.
pub struct ReferenceSet {
    local: ClassFn,
    link: ClassFn,
    local_key1: Vec<String>,
    remote_key1: Vec<String>,
    /// Target class plus its key and the link class key, for
    /// many-to-many sets.
    indirect: Option<(ClassFn, Vec<String>, Vec<String>)>,
    order_by: Vec<Expr>,
    relations: OnceLock<Arc<Relation>>,
    relation2: OnceLock<Arc<Relation>>,
}

impl ReferenceSet {
    /// `R` objects whose `remote_key` references `L`'s `local_key`.
    pub fn new<L: Mapped, R: Mapped, I, S>(local_key: I, remote_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local: ClassInfo::of::<L>,
            link: ClassInfo::of::<R>,
            local_key1: attrs(local_key),
            remote_key1: attrs(remote_key),
            indirect: None,
            order_by: Vec::new(),
            relations: OnceLock::new(),
            relation2: OnceLock::new(),
        }
    }

    /// `R` objects related to `L` through rows of `Link`: `Link`'s
    /// `remote_key1` references `L`'s `local_key1`, and `Link`'s
    /// `remote_key2` references `R`'s `local_key2`.
    pub fn indirect<L: Mapped, Link: Mapped, R: Mapped, I, S>(
        local_key1: I,
        remote_key1: I,
        remote_key2: I,
        local_key2: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            indirect: Some((ClassInfo::of::<R>, attrs(local_key2), attrs(remote_key2))),
            ..Self::new::<L, Link, I, S>(local_key1, remote_key1)
        }
    }

    /// Default ordering of every find through this set.
    #[must_use]
    pub fn order_by<I, T>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        self.order_by = order.into_iter().map(Into::into).collect();
        self
    }

    fn relation1(&self) -> Result<Arc<Relation>> {
        resolved(&self.relations, || {
            Relation::new(
                (self.local)()?,
                &self.local_key1,
                (self.link)()?,
                &self.remote_key1,
                true,
                true,
            )
        })
    }

    fn relation2(&self) -> Result<Option<Arc<Relation>>> {
        let Some((target, local_key2, remote_key2)) = &self.indirect else {
            return Ok(None);
        };
        resolved(&self.relation2, || {
            Relation::new(target()?, local_key2, (self.link)()?, remote_key2, true, true)
        })
        .map(Some)
    }

    /// The set as seen from one local object.
    pub fn bind(&self, local: Handle) -> Result<BoundReferenceSet<'_>> {
        Ok(BoundReferenceSet {
            set: self,
            relation1: self.relation1()?,
            relation2: self.relation2()?,
            local,
        })
    }
}

/// A [`ReferenceSet`] bound to one local object.
pub struct BoundReferenceSet<'a> {
    set: &'a ReferenceSet,
    relation1: Arc<Relation>,
    relation2: Option<Arc<Relation>>,
    local: Handle,
}

impl BoundReferenceSet<'_> {
    fn target_cls(&self) -> &Arc<ClassInfo> {
        match &self.relation2 {
            Some(relation2) => &relation2.local_cls,
            None => &self.relation1.remote_cls,
        }
    }

    fn require_store(&self, store: &Store) -> Result<()> {
        if store.is_attached(self.local)? {
            Ok(())
        } else {
            Err(no_store())
        }
    }

    /// Related objects matching `condition`.
    pub fn find(&self, store: &mut Store, condition: Option<Expr>) -> Result<ResultSet> {
        self.require_store(store)?;
        let mut condition_all = self.relation1.where_for_remote(store, self.local)?;
        if let Some(relation2) = &self.relation2 {
            condition_all = condition_all.and(relation2.where_for_join());
        }
        if let Some(condition) = condition {
            condition_all = condition_all.and(condition);
        }
        let spec = FindSpec::single(SpecItem::Class(Arc::clone(self.target_cls())));
        let result = store.find_spec(spec, Some(condition_all))?;
        if self.set.order_by.is_empty() {
            Ok(result)
        } else {
            result.order_by(self.set.order_by.clone())
        }
    }

    pub fn all(&self, store: &mut Store) -> Result<Vec<Handle>> {
        self.find(store, None)?.handles(store)
    }

    pub fn count(&self, store: &mut Store) -> Result<i64> {
        self.find(store, None)?.count(store, None, false)
    }

    pub fn first(&self, store: &mut Store) -> Result<Option<Handle>> {
        Ok(self.find(store, None)?.first(store)?.and_then(|f| f.handle()))
    }

    pub fn last(&self, store: &mut Store) -> Result<Option<Handle>> {
        Ok(self.find(store, None)?.last(store)?.and_then(|f| f.handle()))
    }

    pub fn any(&self, store: &mut Store) -> Result<Option<Handle>> {
        Ok(self.find(store, None)?.any(store)?.and_then(|f| f.handle()))
    }

    pub fn one(&self, store: &mut Store) -> Result<Option<Handle>> {
        Ok(self.find(store, None)?.one(store)?.and_then(|f| f.handle()))
    }

    pub fn values(&self, store: &mut Store, columns: &[Column]) -> Result<Vec<Vec<Value>>> {
        self.find(store, None)?.values(store, columns)
    }

    pub fn order_by<I, T>(&self, store: &mut Store, order: I) -> Result<ResultSet>
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        self.find(store, None)?.order_by(order)
    }

    pub fn contains(&self, store: &mut Store, remote: Handle) -> Result<bool> {
        self.find(store, None)?.contains(store, &remote.into())
    }

    /// Relate `remote` to the local object. For a many-to-many set a new
    /// link object is created.
    pub fn add(&self, store: &mut Store, remote: Handle) -> Result<()> {
        match &self.relation2 {
            None => self.relation1.link(store, self.local, remote, true),
            Some(relation2) => {
                let link = store.create_from_info(Arc::clone(&self.relation1.remote_cls))?;
                self.relation1.link(store, self.local, link, true)?;
                relation2.link(store, remote, link, true)?;
                store.release(link)
            }
        }
    }

    pub fn remove(&self, store: &mut Store, remote: Handle) -> Result<()> {
        match &self.relation2 {
            None => self.relation1.unlink(store, self.local, Some(remote), true),
            Some(relation2) => {
                self.require_store(store)?;
                let condition = self
                    .relation1
                    .where_for_remote(store, self.local)?
                    .and(relation2.where_for_remote(store, remote)?);
                self.link_rows(store, condition)?.remove(store).map(|_| ())
            }
        }
    }

    /// Break every relationship, optionally only with targets matching
    /// `condition`.
    pub fn clear(&self, store: &mut Store, condition: Option<Expr>) -> Result<()> {
        self.require_store(store)?;
        let mut condition_all = self.relation1.where_for_remote(store, self.local)?;
        match &self.relation2 {
            None => {
                if let Some(condition) = condition {
                    condition_all = condition_all.and(condition);
                }
                let spec = FindSpec::single(SpecItem::Class(Arc::clone(&self.relation1.remote_cls)));
                let changes = self
                    .relation1
                    .remote_columns
                    .iter()
                    .map(|column| (column.clone(), Expr::Null))
                    .collect();
                store.find_spec(spec, Some(condition_all))?.set(store, changes)
            }
            Some(relation2) => {
                if let Some(condition) = condition {
                    let exists = Select::new([Expr::raw("*")])
                        .filter(relation2.where_for_join().and(condition))
                        .tables([relation2.local_cls.table().clone()]);
                    condition_all = condition_all.and(Expr::exists(exists));
                }
                self.link_rows(store, condition_all)?.remove(store).map(|_| ())
            }
        }
    }

    fn link_rows(&self, store: &mut Store, condition: Expr) -> Result<ResultSet> {
        let spec = FindSpec::single(SpecItem::Class(Arc::clone(&self.relation1.remote_cls)));
        store.find_spec(spec, Some(condition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Membership, Person, Player, Team, mock_store};
    use std::sync::LazyLock;

    static TEAM: LazyLock<Reference> =
        LazyLock::new(|| Reference::new::<Player, Team, _, _>(["team_id"], ["id"]));
    static PLAYERS: LazyLock<ReferenceSet> =
        LazyLock::new(|| ReferenceSet::new::<Team, Player, _, _>(["id"], ["team_id"]));
    static TEAM_NAME: LazyLock<Proxy> = LazyLock::new(|| Proxy::new(&TEAM, "name"));
    static TEAMS: LazyLock<ReferenceSet> = LazyLock::new(|| {
        ReferenceSet::indirect::<Person, Membership, Team, _, _>(
            ["id"],
            ["person_id"],
            ["team_id"],
            ["id"],
        )
    });

    fn row(values: &[i64], name: &str) -> Vec<Value> {
        let mut row: Vec<Value> = values.iter().map(|v| Value::BigInt(*v)).collect();
        row.insert(1.min(row.len()), Value::Text(name.to_string()));
        row
    }

    #[test]
    fn unknown_attribute_is_a_property_path_error() {
        let broken = Reference::new::<Player, Team, _, _>(["coach_id"], ["id"]);
        let err = broken.relation().unwrap_err();
        assert!(matches!(err, Error::Mapping(ref e) if e.kind == MappingErrorKind::PropertyPath));
    }

    #[test]
    fn deferred_link_adds_both_and_propagates_generated_key() {
        let (mut store, db) = mock_store();
        db.set_last_insert_id(10);
        db.respond("SELECT team.id FROM team", vec![vec![Value::BigInt(10)]]);

        let team = store.create::<Team>().unwrap();
        store.set_value(team, "name", "Reds").unwrap();
        let player = store.create::<Player>().unwrap();
        store.set_value(player, "id", 1).unwrap();
        store.set_value(player, "name", "Ann").unwrap();

        TEAM.set(&mut store, player, Some(team)).unwrap();
        assert_eq!(
            store.field(player, "team_id").unwrap(),
            Field::Lazy(LazyValue::PendingReference)
        );
        assert_eq!(TEAM.get(&mut store, player).unwrap(), Some(team));

        store.add(player).unwrap();
        assert!(store.is_attached(team).unwrap());
        store.flush().unwrap();

        let executed = db.executed();
        assert_eq!(executed[0].0, "INSERT INTO team (name) VALUES (?)");
        assert!(executed[1].0.starts_with("SELECT team.id FROM team"));
        assert_eq!(executed[2].0, "INSERT INTO player (id, name, team_id) VALUES (?, ?, ?)");
        assert_eq!(executed[2].1[2], Value::BigInt(10));

        db.clear();
        assert_eq!(TEAM.get(&mut store, player).unwrap(), Some(team));
        assert!(db.statements().is_empty());
    }

    #[test]
    fn get_loads_and_breaks_on_divergence() {
        let (mut store, db) = mock_store();
        db.respond("FROM player WHERE player.id", vec![row(&[1, 5], "Ann")]);
        let player = store.get::<Player>(1).unwrap().unwrap();

        db.respond("FROM team WHERE team.id", vec![row(&[5], "Reds")]);
        let reds = TEAM.get(&mut store, player).unwrap().unwrap();
        assert_eq!(store.get_value(reds, "name").unwrap(), Value::Text("Reds".into()));

        db.clear();
        assert_eq!(TEAM.get(&mut store, player).unwrap(), Some(reds));
        assert!(db.statements().is_empty());

        db.respond("FROM team WHERE team.id", vec![row(&[6], "Blues")]);
        store.set_value(player, "team_id", 6).unwrap();
        let blues = TEAM.get(&mut store, player).unwrap().unwrap();
        assert_ne!(blues, reds);
    }

    #[test]
    fn setting_none_nulls_the_foreign_key() {
        let (mut store, db) = mock_store();
        db.respond("FROM player WHERE player.id", vec![row(&[1, 5], "Ann")]);
        let player = store.get::<Player>(1).unwrap().unwrap();
        db.respond("FROM team WHERE team.id", vec![row(&[5], "Reds")]);
        TEAM.get(&mut store, player).unwrap();

        TEAM.set(&mut store, player, None).unwrap();
        assert_eq!(store.get_value(player, "team_id").unwrap(), Value::Null);
        assert!(store.is_dirty(player));
        assert!(store.link_hooks.is_empty());
    }

    #[test]
    fn reference_set_adds_and_finds() {
        let (mut store, db) = mock_store();
        db.respond("FROM team WHERE team.id", vec![row(&[3], "Reds")]);
        let team = store.get::<Team>(3).unwrap().unwrap();
        let player = store.create::<Player>().unwrap();
        store.set_value(player, "id", 7).unwrap();

        let players = PLAYERS.bind(team).unwrap();
        players.add(&mut store, player).unwrap();
        assert_eq!(store.get_value(player, "team_id").unwrap(), Value::BigInt(3));
        assert_eq!(store.pending(player).unwrap(), Some(crate::object::Pending::Add));

        db.clear();
        db.respond("FROM player WHERE player.team_id", vec![row(&[7, 3], "Bo")]);
        assert_eq!(players.all(&mut store).unwrap(), vec![player]);
        let statements = db.statements();
        assert!(statements[0].starts_with("INSERT INTO player"));
        assert_eq!(
            statements[1],
            "SELECT player.id, player.name, player.team_id FROM player WHERE player.team_id = ?"
        );
    }

    #[test]
    fn removing_the_remote_breaks_the_link() {
        let (mut store, db) = mock_store();
        db.respond("FROM team WHERE team.id", vec![row(&[3], "Reds")]);
        let team = store.get::<Team>(3).unwrap().unwrap();
        db.respond("FROM player WHERE player.id", vec![row(&[7, 3], "Bo")]);
        let player = store.get::<Player>(7).unwrap().unwrap();

        PLAYERS.bind(team).unwrap().add(&mut store, player).unwrap();
        assert!(store.is_linked(player));
        store.remove(player).unwrap();
        assert!(!store.is_linked(player));
    }

    #[test]
    fn shared_remote_stays_linked_until_every_local_lets_go() {
        let (mut store, db) = mock_store();
        db.respond("FROM team WHERE team.id", vec![row(&[5], "Reds")]);
        let reds = store.get::<Team>(5).unwrap().unwrap();
        db.respond("FROM player WHERE player.id", vec![row(&[1, 5], "Ann")]);
        let ann = store.get::<Player>(1).unwrap().unwrap();
        db.respond("FROM player WHERE player.id", vec![row(&[2, 5], "Bo")]);
        let bo = store.get::<Player>(2).unwrap().unwrap();

        TEAM.set(&mut store, ann, Some(reds)).unwrap();
        TEAM.set(&mut store, bo, Some(reds)).unwrap();
        assert_eq!(store.remote_links.get(&reds), Some(&2));

        store.release(reds).unwrap();
        store.set_cache_size(0);
        assert!(store.info(reds).is_ok());

        TEAM.set(&mut store, ann, None).unwrap();
        assert!(store.is_linked(reds));
        TEAM.set(&mut store, bo, None).unwrap();
        assert!(!store.is_linked(reds));
        assert!(store.remote_links.is_empty());
    }

    #[test]
    fn proxy_reads_through_the_reference() {
        let (mut store, db) = mock_store();
        let loose = store.create::<Player>().unwrap();
        assert_eq!(TEAM_NAME.get(&mut store, loose).unwrap(), None);
        assert!(TEAM_NAME.set(&mut store, loose, "Blues").is_err());

        db.respond("FROM player WHERE player.id", vec![row(&[1, 5], "Ann")]);
        let ann = store.get::<Player>(1).unwrap().unwrap();
        db.respond("FROM team WHERE team.id", vec![row(&[5], "Reds")]);
        assert_eq!(
            TEAM_NAME.get(&mut store, ann).unwrap(),
            Some(Value::Text("Reds".into()))
        );

        let condition = TEAM_NAME.expr().unwrap().eq("Reds");
        let statement = store.find::<Player>(Some(condition)).unwrap().statement();
        assert_eq!(
            tessera_query::compile(&statement).unwrap().sql,
            "SELECT player.id, player.name, player.team_id FROM player \
             LEFT JOIN team ON player.team_id = team.id WHERE team.name = ?"
        );

        TEAM_NAME.set(&mut store, ann, "Blues").unwrap();
        let reds = TEAM.get(&mut store, ann).unwrap().unwrap();
        assert!(store.is_dirty(reds));
        assert_eq!(store.get_value(reds, "name").unwrap(), Value::Text("Blues".into()));
    }

    #[test]
    fn detached_local_has_no_store() {
        let (mut store, _) = mock_store();
        let team = store.create::<Team>().unwrap();
        let err = PLAYERS.bind(team).unwrap().find(&mut store, None).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::NoStore));
    }

    #[test]
    fn objects_of_different_stores_cannot_be_linked() {
        let (mut one, _) = mock_store();
        let (mut two, _) = mock_store();
        let team = one.create::<Team>().unwrap();
        let player = two.create::<Player>().unwrap();
        let err = TEAM.set(&mut two, player, Some(team)).unwrap_err();
        assert_eq!(err.store_kind(), Some(StoreErrorKind::WrongStore));
    }

    #[test]
    fn indirect_set_manages_link_rows() {
        let (mut store, db) = mock_store();
        db.respond(
            "FROM person WHERE person.id",
            vec![vec![Value::BigInt(30), Value::BigInt(1), Value::Text("Joe".into())]],
        );
        let joe = store.get::<Person>(1).unwrap().unwrap();
        db.respond("FROM team WHERE team.id", vec![row(&[2], "Reds")]);
        let reds = store.get::<Team>(2).unwrap().unwrap();

        let teams = TEAMS.bind(joe).unwrap();
        teams.add(&mut store, reds).unwrap();
        db.clear();
        store.flush().unwrap();
        let executed = db.executed();
        assert_eq!(executed[0].0, "INSERT INTO membership (person_id, team_id) VALUES (?, ?)");
        assert_eq!(executed[0].1, vec![Value::BigInt(1), Value::BigInt(2)]);

        db.clear();
        teams.find(&mut store, None).unwrap().all(&mut store).unwrap();
        let sql = &db.statements()[0];
        assert!(sql.contains("membership.person_id = ?"));
        assert!(sql.contains("team.id = membership.team_id"));

        db.clear();
        teams.remove(&mut store, reds).unwrap();
        assert_eq!(
            db.statements()[0],
            "DELETE FROM membership WHERE membership.person_id = ? AND membership.team_id = ?"
        );
    }
}

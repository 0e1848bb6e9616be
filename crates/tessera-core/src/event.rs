//! Named-event hub for external collaborators.
//!
//! Callbacks are registered under an event name and receive the event's
//! payload. A callback returning [`HookFlow::Unhook`] is removed after the
//! call. Arguments a callback needs beyond the payload are captured by the
//! closure.

use std::collections::HashMap;
use std::fmt;

use crate::Result;

/// What a callback wants to happen after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Continue,
    Unhook,
}

/// Identifies one registration, for [`EventSystem::unhook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type Callback<P> = Box<dyn FnMut(&P) -> Result<HookFlow> + Send>;

/// A set of named events, each with an ordered list of callbacks.
pub struct EventSystem<P> {
    hooks: HashMap<String, Vec<(HookId, Callback<P>)>>,
    next_id: u64,
}

impl<P> Default for EventSystem<P> {
    fn default() -> Self {
        Self {
            hooks: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<P> EventSystem<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `name`.
    pub fn hook<F>(&mut self, name: impl Into<String>, callback: F) -> HookId
    where
        F: FnMut(&P) -> Result<HookFlow> + Send + 'static,
    {
        self.next_id += 1;
        let id = HookId(self.next_id);
        self.hooks
            .entry(name.into())
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Remove a registration. Returns false if it was not registered.
    pub fn unhook(&mut self, name: &str, id: HookId) -> bool {
        let Some(callbacks) = self.hooks.get_mut(name) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(hook, _)| *hook != id);
        before != callbacks.len()
    }

    /// Call every callback registered for `name`, in registration order.
    ///
    /// The first callback error stops the emission and is returned.
    /// Callbacks that already asked to be unhooked are still removed.
    pub fn emit(&mut self, name: &str, payload: &P) -> Result<()> {
        let Some(callbacks) = self.hooks.get_mut(name) else {
            return Ok(());
        };
        let mut unhooked = Vec::new();
        let mut outcome = Ok(());
        for (id, callback) in callbacks.iter_mut() {
            match callback(payload) {
                Ok(HookFlow::Continue) => {}
                Ok(HookFlow::Unhook) => unhooked.push(*id),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if !unhooked.is_empty() {
            callbacks.retain(|(id, _)| !unhooked.contains(id));
        }
        outcome
    }

    pub fn has_hooks(&self, name: &str) -> bool {
        self.hooks.get(name).is_some_and(|c| !c.is_empty())
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }
}

impl<P> fmt::Debug for EventSystem<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<(&str, usize)> = self
            .hooks
            .iter()
            .map(|(name, callbacks)| (name.as_str(), callbacks.len()))
            .collect();
        names.sort_unstable();
        f.debug_struct("EventSystem").field("hooks", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::{Arc, Mutex};

    #[test]
    fn emit_runs_callbacks_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut events: EventSystem<i32> = EventSystem::new();
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            events.hook("changed", move |n: &i32| {
                seen.lock().unwrap().push(format!("{tag}{n}"));
                Ok(HookFlow::Continue)
            });
        }
        events.emit("changed", &1).unwrap();
        events.emit("other", &2).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1"]);
    }

    #[test]
    fn callbacks_can_unhook_themselves() {
        let calls = Arc::new(Mutex::new(0));
        let mut events: EventSystem<()> = EventSystem::new();
        let counter = Arc::clone(&calls);
        events.hook("flush", move |_: &()| {
            *counter.lock().unwrap() += 1;
            Ok(HookFlow::Unhook)
        });
        events.emit("flush", &()).unwrap();
        events.emit("flush", &()).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(!events.has_hooks("flush"));
    }

    #[test]
    fn unhook_by_id() {
        let mut events: EventSystem<()> = EventSystem::new();
        let id = events.hook("commit", |_: &()| Ok(HookFlow::Continue));
        assert!(events.has_hooks("commit"));
        assert!(events.unhook("commit", id));
        assert!(!events.unhook("commit", id));
        assert!(!events.has_hooks("commit"));
    }

    #[test]
    fn errors_stop_emission() {
        let mut events: EventSystem<()> = EventSystem::new();
        events.hook("rollback", |_: &()| Err(Error::Custom("boom".to_string())));
        events.hook("rollback", |_: &()| panic!("must not run"));
        assert!(events.emit("rollback", &()).is_err());
    }
}

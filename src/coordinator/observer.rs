//! Fan-out of chosen-call changes to interested listeners.

use crate::types::{GroupCallDescription, GroupId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

/// Observer of chosen-call changes.
///
/// Callbacks are invoked synchronously from the refresh cycle and must not
/// block; hand off to your own task or channel for anything slow.
pub trait GroupCallObserver: Send + Sync {
    /// `call` is the chosen call for the observed scope, or `None` when no
    /// call is chosen (any more).
    fn on_group_call_update(&self, call: Option<&GroupCallDescription>);
}

/// Holds the per-group and general observer sets.
///
/// Per-group observers get that group's chosen-call changes and an immediate
/// replay of the current value on registration. General observers track the
/// locally joined call across groups.
#[derive(Default)]
pub struct ObserverHub {
    group_observers: Mutex<HashMap<GroupId, Vec<Arc<dyn GroupCallObserver>>>>,
    general_observers: Mutex<Vec<Arc<dyn GroupCallObserver>>>,
}

impl ObserverHub {
    /// Register a per-group observer and replay the current chosen call
    /// (or its absence) to it. Re-registering the same observer is a no-op.
    pub fn add_for_group(
        &self,
        group_id: GroupId,
        observer: Arc<dyn GroupCallObserver>,
        current: Option<&GroupCallDescription>,
    ) {
        let mut observers = self.group_observers.lock().unwrap();
        let entries = observers.entry(group_id).or_default();
        if entries.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return;
        }
        entries.push(observer.clone());
        drop(observers);
        observer.on_group_call_update(current);
    }

    pub fn remove_for_group(&self, group_id: GroupId, observer: &Arc<dyn GroupCallObserver>) {
        let mut observers = self.group_observers.lock().unwrap();
        if let Some(entries) = observers.get_mut(&group_id) {
            entries.retain(|o| !Arc::ptr_eq(o, observer));
        }
    }

    /// Register a general observer and replay the currently joined call.
    pub fn add_general(
        &self,
        observer: Arc<dyn GroupCallObserver>,
        current: Option<&GroupCallDescription>,
    ) {
        let mut observers = self.general_observers.lock().unwrap();
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return;
        }
        observers.push(observer.clone());
        drop(observers);
        observer.on_group_call_update(current);
    }

    pub fn remove_general(&self, observer: &Arc<dyn GroupCallObserver>) {
        self.general_observers
            .lock()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Notify the group's observers and the general observers.
    pub fn notify_group(&self, group_id: GroupId, call: Option<&GroupCallDescription>) {
        let observers = {
            let map = self.group_observers.lock().unwrap();
            map.get(&group_id).cloned().unwrap_or_default()
        };
        for observer in observers {
            observer.on_group_call_update(call);
        }
        self.notify_general(call);
    }

    pub fn notify_general(&self, call: Option<&GroupCallDescription>) {
        let observers = self.general_observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_group_call_update(call);
        }
    }
}

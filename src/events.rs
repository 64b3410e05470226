// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::sync::Mutex;

/// Push-style listener registry used by the background workers to publish
/// calibration and guiding events. Delivery is synchronous from the worker
/// thread, in registration order, with no queueing: a slow listener stalls
/// the worker, and events published with no listeners registered are
/// dropped.
///
/// Listeners must not register or unregister from within a callback.
pub struct ListenerRegistry<E> {
    inner: Mutex<Listeners<E>>,
}

struct Listeners<E> {
    next_id: i32,
    callbacks: HashMap<i32, Box<dyn Fn(&E) + Send>>,
    // Registration order; HashMap iteration order is arbitrary.
    order: Vec<i32>,
}

impl<E> ListenerRegistry<E> {
    pub fn new() -> Self {
        ListenerRegistry {
            inner: Mutex::new(Listeners {
                next_id: 0,
                callbacks: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Returns a handle for unregister().
    pub fn register(&self, callback: Box<dyn Fn(&E) + Send>) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.insert(id, callback);
        inner.order.push(id);
        id
    }

    /// Returns false if the handle was not registered.
    pub fn unregister(&self, id: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|&i| i != id);
        inner.callbacks.remove(&id).is_some()
    }

    pub fn notify(&self, event: &E) {
        let inner = self.inner.lock().unwrap();
        for id in &inner.order {
            (inner.callbacks[id])(event);
        }
    }
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

// mod tests.

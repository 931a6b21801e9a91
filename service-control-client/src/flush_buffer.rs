// Copyright 2021-Present Datadog, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, Mutex};

/// Outbound requests produced by cache evictions, collected while the cache
/// lock is held and delivered after it is released.
///
/// Without this buffer a flush callback would run under the cache lock and
/// could deadlock by calling back into the aggregator. Aggregator methods
/// fill a stack-local buffer inside their locked section and pass it to
/// [`FlushCallbackSlot::deliver`] once the lock guard has been dropped.
#[derive(Debug)]
pub(crate) struct FlushBuffer<T> {
    items: Vec<T>,
}

impl<T> FlushBuffer<T> {
    pub fn new() -> Self {
        FlushBuffer { items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends an item as-is.
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Offers `item` to the current tail through `try_merge` before appending
    /// it. `try_merge` returns `None` when it absorbed the item into the
    /// tail, or gives the item back to be appended as a separate entry.
    pub fn push_merged<F>(&mut self, item: T, try_merge: F)
    where F: FnOnce(&mut T, T) -> Option<T> {
        let Some(tail) = self.items.last_mut() else {
            self.items.push(item);
            return;
        };
        if let Some(unmerged) = try_merge(tail, item) {
            self.items.push(unmerged);
        }
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// A settable flush callback, shared between an aggregator and the client
/// façade that wires it to a transport.
pub(crate) struct FlushCallbackSlot<T> {
    callback: Mutex<Option<Arc<dyn Fn(T) + Send + Sync>>>,
}

impl<T> FlushCallbackSlot<T> {
    pub fn new() -> Self {
        FlushCallbackSlot {
            callback: Mutex::new(None),
        }
    }

    pub fn set(&self, callback: impl Fn(T) + Send + Sync + 'static) {
        *self.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Detaches the callback. Subsequent deliveries are dropped silently,
    /// which is what shutdown relies on.
    pub fn clear(&self) {
        *self.callback.lock().unwrap() = None;
    }

    /// Hands the buffered items to the registered callback, one at a time.
    ///
    /// Must be called without the cache lock held. The callback itself runs
    /// outside the slot lock too, so it may legally re-enter the aggregator
    /// or swap the callback.
    pub fn deliver(&self, buffer: FlushBuffer<T>) {
        if buffer.is_empty() {
            return;
        }
        for item in buffer.into_items() {
            let callback_opt = self.callback.lock().unwrap().clone();
            if let Some(callback) = callback_opt {
                callback(item);
            }
        }
    }
}

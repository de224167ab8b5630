//! # Bridge Resource
//!
//! A [`BridgeResource`] ties one registered object path to the process that
//! owns it and to a payload only that process interprets. It also owns the
//! bus-side registrations made on its behalf (signal subscriptions) and the
//! runtime resource handle, and gives all of them back exactly once in
//! [`release`](BridgeResource::release).

use crate::bus::{Connection, FilterId, ObjectPath};
use crate::process::{Pid, ProcessRuntime, ResourceHandle};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info};

struct Subscriptions {
    released: bool,
    filters: Vec<FilterId>,
}

pub struct BridgeResource<P> {
    path: ObjectPath,
    owner: Pid,
    payload: P,
    handle: ResourceHandle,
    subscriptions: Mutex<Subscriptions>,
    connection: Weak<dyn Connection>,
    runtime: Arc<dyn ProcessRuntime>,
}

impl<P> BridgeResource<P> {
    pub(crate) fn new(
        path: ObjectPath,
        owner: Pid,
        payload: P,
        connection: Weak<dyn Connection>,
        runtime: Arc<dyn ProcessRuntime>,
    ) -> Self {
        let handle = runtime.create_resource(owner);
        Self {
            path,
            owner,
            payload,
            handle,
            subscriptions: Mutex::new(Subscriptions {
                released: false,
                filters: Vec::new(),
            }),
            connection,
            runtime,
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// The owning process. Fixed at creation.
    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn is_released(&self) -> bool {
        self.subscriptions().released
    }

    /// Filters currently installed on behalf of this resource.
    pub fn subscriptions_installed(&self) -> Vec<FilterId> {
        self.subscriptions().filters.clone()
    }

    /// Records a filter. Fails once the resource has been released, in which
    /// case the caller must remove the filter itself.
    pub(crate) fn add_subscription(&self, id: FilterId) -> bool {
        let mut subscriptions = self.subscriptions();
        if subscriptions.released {
            return false;
        }
        subscriptions.filters.push(id);
        true
    }

    pub(crate) fn remove_subscription(&self, id: FilterId) -> bool {
        let mut subscriptions = self.subscriptions();
        let before = subscriptions.filters.len();
        subscriptions.filters.retain(|filter| *filter != id);
        subscriptions.filters.len() != before
    }

    /// Removes the subscriptions from the connection and releases the runtime
    /// handle. Idempotent: only the first call does anything, later calls
    /// return `false`.
    pub(crate) fn release(&self) -> bool {
        let filters = {
            let mut subscriptions = self.subscriptions();
            if subscriptions.released {
                return false;
            }
            subscriptions.released = true;
            std::mem::take(&mut subscriptions.filters)
        };

        if let Some(connection) = self.connection.upgrade() {
            for filter in &filters {
                if let Err(e) = connection.remove_filter(*filter) {
                    debug!(path = %self.path, %filter, error = %e, "Filter already gone");
                }
            }
        }
        self.runtime.release_resource(self.handle);
        info!(path = %self.path, owner = %self.owner, subscriptions = filters.len(), "Released");
        true
    }
}

impl<P: fmt::Debug> fmt::Debug for BridgeResource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeResource")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("payload", &self.payload)
            .field("handle", &self.handle)
            .field("released", &self.is_released())
            .finish()
    }
}

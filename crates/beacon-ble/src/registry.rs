//! Connection registry
//!
//! A physical beacon accepts a single GATT connection, so every caller that wants to
//! talk to an address must share one connection engine and its
//! transaction queue. The registry hands out [`BeaconHandle`]s keyed by hardware
//! address and only remembers them weakly: once the last handle for an address is
//! dropped the engine disconnects and stops, and the next request spawns a new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use beacon_core::{BeaconIdentity, HardwareAddress};

use crate::beacon::{BeaconHandle, WeakBeaconHandle};
use crate::config::ConnectionConfig;
use crate::platform::PlatformConnection;

// ----------------------------------------------------------------------------
// Beacon Registry
// ----------------------------------------------------------------------------

/// Source of [`BeaconHandle`]s, at most one live engine per address
pub struct BeaconRegistry {
    platform: Arc<dyn PlatformConnection>,
    config: ConnectionConfig,
    handles: Mutex<HashMap<HardwareAddress, WeakBeaconHandle>>,
}

impl BeaconRegistry {
    pub fn new(platform: Arc<dyn PlatformConnection>, config: ConnectionConfig) -> Self {
        Self {
            platform,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for the beacon at `identity.address`
    ///
    /// Returns a clone of the live handle when an engine already runs for that
    /// address, otherwise spawns a new engine on the current runtime.
    pub fn handle(&self, identity: BeaconIdentity) -> BeaconHandle {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|_, handle| handle.upgrade().is_some());

        if let Some(handle) = handles.get(&identity.address).and_then(WeakBeaconHandle::upgrade) {
            debug!("Reusing connection engine for {}", identity.address);
            return handle;
        }

        debug!("Spawning connection engine for {}", identity.address);
        let (handle, _task) =
            BeaconHandle::spawn(identity, self.platform.clone(), self.config.clone());
        handles.insert(identity.address, handle.downgrade());
        handle
    }

    /// Addresses with a running engine
    pub fn active(&self) -> Vec<HardwareAddress> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<_> = handles
            .iter()
            .filter(|(_, handle)| handle.upgrade().is_some())
            .map(|(address, _)| *address)
            .collect();
        active.sort();
        active
    }
}

impl std::fmt::Debug for BeaconRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaconRegistry")
            .field("active", &self.active())
            .finish()
    }
}

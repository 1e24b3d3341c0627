// Copyright 2025 eraflo
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

//! The shared device handle held by every pool, and the device-removed funnel.

use ferrite_core::rhi::{NativeDevice, RhiError, RhiResult, RhiSettings};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked once when the device is removed, with the diagnostic reason.
pub type DeviceRemovedCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Shared access to the native device, the settings and the device health.
///
/// Every pool and heap holds an `Arc<DeviceHandle>`. Native calls that can
/// report device loss are routed through [`DeviceHandle::check`], so removal
/// is handled in exactly one place no matter which thread notices it first.
pub struct DeviceHandle {
    native: Arc<dyn NativeDevice>,
    settings: RhiSettings,
    lost: AtomicBool,
    removal_reason: Mutex<Option<String>>,
    on_removed: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
}

impl DeviceHandle {
    /// Wraps a native device.
    pub fn new(native: Arc<dyn NativeDevice>, settings: RhiSettings) -> Arc<Self> {
        Arc::new(Self {
            native,
            settings,
            lost: AtomicBool::new(false),
            removal_reason: Mutex::new(None),
            on_removed: Mutex::new(None),
        })
    }

    /// The native device.
    pub fn native(&self) -> &dyn NativeDevice {
        self.native.as_ref()
    }

    /// The settings every pool was sized with.
    pub fn settings(&self) -> &RhiSettings {
        &self.settings
    }

    /// Passes `result` through, reporting device removal to the handler.
    pub fn check<T>(&self, result: RhiResult<T>) -> RhiResult<T> {
        if let Err(err) = &result {
            if err.is_device_removed() {
                self.handle_device_removed(err);
            }
        }
        result
    }

    /// Central device-removed handler.
    ///
    /// The first report logs a diagnostic dump, stores the reason, marks the
    /// device lost and invokes the registered callback. Later reports are ignored
    /// until [`clear_lost`](Self::clear_lost) is called by device recreation.
    ///
    /// Pools report through [`check`](Self::check) only after releasing their
    /// own locks, so the callback may read statistics of any pool.
    pub fn handle_device_removed(&self, err: &RhiError) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }

        let reason = self
            .native
            .device_removed_reason()
            .unwrap_or_else(|| err.to_string());
        log::error!("DeviceHandle: GPU device removed: {reason}");
        log::error!("DeviceHandle: native device state at removal: {:?}", self.native);
        log::error!("DeviceHandle: settings at removal: {:?}", self.settings);

        *self.removal_reason.lock() = Some(reason.clone());
        // Invoked with no lock held.
        let callback = self.on_removed.lock().clone();
        if let Some(callback) = callback {
            callback(&reason);
        }
    }

    /// Registers the callback notified on device removal, replacing any previous one.
    pub fn set_device_removed_callback(&self, callback: DeviceRemovedCallback) {
        *self.on_removed.lock() = Some(Arc::from(callback));
    }

    /// Whether the device has been removed.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// The diagnostics recorded at removal, if any.
    pub fn removal_reason(&self) -> Option<String> {
        self.removal_reason.lock().clone()
    }

    /// Marks the device healthy again after the native device recovered.
    pub(crate) fn clear_lost(&self) {
        *self.removal_reason.lock() = None;
        self.lost.store(false, Ordering::Release);
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("native", &self.native)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

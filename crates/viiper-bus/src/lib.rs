//! The virtual bus registry: stable `(busId, devId)` addressing, per-device
//! cancellation scopes, idle-timeout reclamation and the at-most-one-feeder
//! rule.
//!
//! Lock order is registry → bus; both locks are leaf-scoped and never held
//! across I/O or `.await`. Timers and reapers run as spawned tasks that
//! re-validate state under the locks before acting, so a racing `add` always
//! beats a stale timer.

mod cancel;
mod idle;

pub use cancel::CancelScope;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use idle::IdleTimer;
use viiper_devices::CreatedDevice;
use viiper_usb::ProfileError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus {0} is already allocated")]
    AlreadyAllocated(u32),

    #[error("device is already registered on this bus")]
    AlreadyRegistered,

    #[error("bus {0} does not exist")]
    BusNotFound(u32),

    #[error("device {0} does not exist on this bus")]
    DeviceNotFound(u32),

    #[error("device already has an attached stream")]
    StreamBusy,

    #[error("device profile is not exportable: {0}")]
    InvalidProfile(#[from] ProfileError),
}

/// Timeouts driving automatic reclamation.
#[derive(Debug, Clone, Copy)]
pub struct BusTimeouts {
    /// How long a device may sit without an attached feeder stream.
    pub device_handler_connect: Duration,
    /// How long an empty bus lingers before it is removed.
    pub bus_cleanup: Duration,
}

impl Default for BusTimeouts {
    fn default() -> Self {
        BusTimeouts {
            device_handler_connect: Duration::from_secs(30),
            bus_cleanup: Duration::from_secs(30),
        }
    }
}

/// USB/IP identity of a registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportMeta {
    pub bus_id: u32,
    pub dev_id: u32,
    /// `"<bus>-<dev>"`, the 32-byte wire field.
    pub usb_bus_id: String,
    /// Sysfs-style path, the 256-byte wire field.
    pub path: String,
}

impl ExportMeta {
    fn new(bus_id: u32, dev_id: u32) -> ExportMeta {
        ExportMeta {
            bus_id,
            dev_id,
            usb_bus_id: format!("{bus_id}-{dev_id}"),
            path: format!("/sys/devices/viiper/usb{bus_id}/{bus_id}-{dev_id}"),
        }
    }
}

/// Everything the URB loop and the stream path need about one device,
/// resolvable without another registry query.
#[derive(Clone)]
pub struct DeviceHandle {
    pub export: ExportMeta,
    pub type_name: String,
    pub device: CreatedDevice,
    pub cancel: CancelScope,
}

struct DeviceEntry {
    dev_id: u32,
    type_name: String,
    device: CreatedDevice,
    export: ExportMeta,
    cancel: CancelScope,
    idle: IdleTimer,
    feeder_attached: bool,
}

impl DeviceEntry {
    fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            export: self.export.clone(),
            type_name: self.type_name.clone(),
            device: self.device.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

struct BusState {
    devices: Vec<DeviceEntry>,
    allocated: BTreeSet<u32>,
    closed: bool,
}

pub struct Bus {
    id: u32,
    timeouts: BusTimeouts,
    state: Mutex<BusState>,
    /// Raised when the last device leaves, re-armed (false) on add. A fresh
    /// bus starts raised, so a bus nobody populates is also reclaimed.
    empty: watch::Sender<bool>,
    /// Cancelled when the bus is closed; stops the cleanup watcher.
    scope: CancelScope,
    /// Handed to timer tasks and feeder guards, which outlive the borrow
    /// they were created from.
    weak_self: Weak<Bus>,
}

impl Bus {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Register a device: assigns the smallest free `devId ≥ 1`, materializes
    /// the export metadata, creates the cancellation scope and arms the idle
    /// timer.
    pub fn add(&self, type_name: &str, device: CreatedDevice) -> Result<DeviceHandle, BusError> {
        device.model.profile().validate()?;

        let handle = {
            let mut state = self.state.lock().expect("bus state lock");
            if state.closed {
                return Err(BusError::BusNotFound(self.id));
            }
            if state
                .devices
                .iter()
                .any(|entry| Arc::ptr_eq(&entry.device.model, &device.model))
            {
                return Err(BusError::AlreadyRegistered);
            }

            let dev_id = smallest_free(&state.allocated);
            state.allocated.insert(dev_id);

            let entry = DeviceEntry {
                dev_id,
                type_name: type_name.to_owned(),
                device,
                export: ExportMeta::new(self.id, dev_id),
                cancel: CancelScope::new(),
                idle: IdleTimer::new(),
                feeder_attached: false,
            };
            let handle = entry.handle();
            state.devices.push(entry);
            self.empty.send_replace(false);
            handle
        };

        self.arm_idle(handle.export.dev_id);
        info!(
            bus = self.id,
            dev = handle.export.dev_id,
            r#type = %handle.type_name,
            "device registered"
        );
        Ok(handle)
    }

    /// Remove by id: cancels the context, returns the id to the pool and
    /// raises the empty signal when the last device leaves.
    pub fn remove_by_id(&self, dev_id: u32) -> Result<(), BusError> {
        let entry = {
            let mut state = self.state.lock().expect("bus state lock");
            let index = state
                .devices
                .iter()
                .position(|entry| entry.dev_id == dev_id)
                .ok_or(BusError::DeviceNotFound(dev_id))?;
            let entry = state.devices.remove(index);
            state.allocated.remove(&dev_id);
            if state.devices.is_empty() {
                self.empty.send_replace(true);
            }
            entry
        };
        entry.cancel.cancel();
        entry.idle.stop();
        info!(bus = self.id, dev = dev_id, "device removed");
        Ok(())
    }

    /// Remove by pointer identity.
    pub fn remove(&self, model: &Arc<dyn viiper_usb::UsbDeviceModel>) -> Result<(), BusError> {
        let dev_id = {
            let state = self.state.lock().expect("bus state lock");
            state
                .devices
                .iter()
                .find(|entry| Arc::ptr_eq(&entry.device.model, model))
                .map(|entry| entry.dev_id)
        }
        .ok_or(BusError::DeviceNotFound(0))?;
        self.remove_by_id(dev_id)
    }

    /// Cancel every device context and invalidate the bus.
    pub fn close(&self) {
        let entries = {
            let mut state = self.state.lock().expect("bus state lock");
            state.closed = true;
            state.allocated.clear();
            std::mem::take(&mut state.devices)
        };
        for entry in &entries {
            entry.cancel.cancel();
            entry.idle.stop();
        }
        self.scope.cancel();
        if !entries.is_empty() {
            info!(bus = self.id, devices = entries.len(), "bus closed");
        }
    }

    /// Devices in insertion order.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.state
            .lock()
            .expect("bus state lock")
            .devices
            .iter()
            .map(DeviceEntry::handle)
            .collect()
    }

    pub fn device(&self, dev_id: u32) -> Option<DeviceHandle> {
        self.state
            .lock()
            .expect("bus state lock")
            .devices
            .iter()
            .find(|entry| entry.dev_id == dev_id)
            .map(DeviceEntry::handle)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("bus state lock").devices.is_empty()
    }

    /// Claim the device's feeder slot, stopping its idle timer. Fails
    /// immediately with [`BusError::StreamBusy`] while another stream holds
    /// it.
    pub fn attach_feeder(&self, dev_id: u32) -> Result<FeederGuard, BusError> {
        let handle = {
            let mut state = self.state.lock().expect("bus state lock");
            let entry = state
                .devices
                .iter_mut()
                .find(|entry| entry.dev_id == dev_id)
                .ok_or(BusError::DeviceNotFound(dev_id))?;
            if entry.feeder_attached {
                return Err(BusError::StreamBusy);
            }
            entry.feeder_attached = true;
            entry.idle.stop();
            entry.handle()
        };
        debug!(bus = self.id, dev = dev_id, "feeder attached");
        Ok(FeederGuard {
            bus: self.weak_self.upgrade().expect("bus is alive while borrowed"),
            handle,
        })
    }

    fn detach_feeder(&self, dev_id: u32) {
        let still_registered = {
            let mut state = self.state.lock().expect("bus state lock");
            match state.devices.iter_mut().find(|entry| entry.dev_id == dev_id) {
                Some(entry) => {
                    entry.feeder_attached = false;
                    true
                }
                None => false,
            }
        };
        if still_registered {
            debug!(bus = self.id, dev = dev_id, "feeder detached, idle timer re-armed");
            self.arm_idle(dev_id);
        }
    }

    /// Arm the device's idle timer; firing removes the device unless a
    /// feeder attached (or the device went away) in the meantime.
    fn arm_idle(&self, dev_id: u32) {
        let timeout = self.timeouts.device_handler_connect;
        let (generation, cancel) = {
            let mut state = self.state.lock().expect("bus state lock");
            let Some(entry) = state.devices.iter_mut().find(|entry| entry.dev_id == dev_id)
            else {
                return;
            };
            (entry.idle.arm(), entry.cancel.clone())
        };

        let bus = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = cancel.cancelled() => return,
            }
            if let Some(bus) = bus.upgrade() {
                bus.reap_idle(dev_id, generation);
            }
        });
    }

    fn reap_idle(&self, dev_id: u32, generation: u64) {
        let fired = {
            let mut state = self.state.lock().expect("bus state lock");
            match state.devices.iter_mut().find(|entry| entry.dev_id == dev_id) {
                Some(entry) => !entry.feeder_attached && entry.idle.fire(generation),
                None => false,
            }
        };
        if fired {
            info!(bus = self.id, dev = dev_id, "no feeder within the idle window, removing device");
            let _ = self.remove_by_id(dev_id);
        }
    }
}

/// Holds a device's feeder slot; dropping re-arms the idle timer.
pub struct FeederGuard {
    bus: Arc<Bus>,
    handle: DeviceHandle,
}

impl FeederGuard {
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }
}

impl Drop for FeederGuard {
    fn drop(&mut self) {
        self.bus.detach_feeder(self.handle.export.dev_id);
    }
}

struct RegistryState {
    buses: BTreeMap<u32, Arc<Bus>>,
}

/// Process-wide bus directory.
pub struct BusRegistry {
    timeouts: BusTimeouts,
    state: Mutex<RegistryState>,
    weak_self: Weak<BusRegistry>,
}

impl BusRegistry {
    pub fn new(timeouts: BusTimeouts) -> Arc<BusRegistry> {
        Arc::new_cyclic(|weak_self| BusRegistry {
            timeouts,
            state: Mutex::new(RegistryState {
                buses: BTreeMap::new(),
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Create a bus with the requested id, or the smallest free id ≥ 1.
    pub fn create_bus(&self, id: Option<u32>) -> Result<Arc<Bus>, BusError> {
        let bus = {
            let mut state = self.state.lock().expect("registry lock");
            let id = match id {
                Some(id) => {
                    if state.buses.contains_key(&id) {
                        return Err(BusError::AlreadyAllocated(id));
                    }
                    id
                }
                None => {
                    let allocated: BTreeSet<u32> = state.buses.keys().copied().collect();
                    smallest_free(&allocated)
                }
            };
            let (empty, _) = watch::channel(true);
            let bus = Arc::new_cyclic(|weak_self| Bus {
                id,
                timeouts: self.timeouts,
                state: Mutex::new(BusState {
                    devices: Vec::new(),
                    allocated: BTreeSet::new(),
                    closed: false,
                }),
                empty,
                scope: CancelScope::new(),
                weak_self: weak_self.clone(),
            });
            state.buses.insert(id, bus.clone());
            bus
        };
        info!(bus = bus.id, "bus created");
        self.spawn_cleanup_watcher(&bus);
        Ok(bus)
    }

    /// Explicitly remove a bus, closing it first (which removes any devices).
    pub fn remove_bus(&self, id: u32) -> Result<(), BusError> {
        let bus = {
            let mut state = self.state.lock().expect("registry lock");
            state.buses.remove(&id).ok_or(BusError::BusNotFound(id))?
        };
        bus.close();
        info!(bus = id, "bus removed");
        Ok(())
    }

    pub fn bus(&self, id: u32) -> Option<Arc<Bus>> {
        self.state
            .lock()
            .expect("registry lock")
            .buses
            .get(&id)
            .cloned()
    }

    /// Bus ids in ascending order.
    pub fn list(&self) -> Vec<u32> {
        self.state
            .lock()
            .expect("registry lock")
            .buses
            .keys()
            .copied()
            .collect()
    }

    /// Every registered device, bus-ascending then insertion-ordered, as the
    /// devlist reply wants them.
    pub fn all_devices(&self) -> Vec<DeviceHandle> {
        let buses: Vec<Arc<Bus>> = {
            let state = self.state.lock().expect("registry lock");
            state.buses.values().cloned().collect()
        };
        buses.iter().flat_map(|bus| bus.devices()).collect()
    }

    /// Resolve `"<bus>-<dev>"` to a device, as used by OP_REQ_IMPORT.
    pub fn find_by_usb_bus_id(&self, usb_bus_id: &str) -> Option<DeviceHandle> {
        let (bus_id, dev_id) = usb_bus_id.split_once('-')?;
        let bus_id: u32 = bus_id.parse().ok()?;
        let dev_id: u32 = dev_id.parse().ok()?;
        self.bus(bus_id)?.device(dev_id)
    }

    /// Cancel everything; used on server shutdown.
    pub fn close_all(&self) {
        let buses: Vec<Arc<Bus>> = {
            let mut state = self.state.lock().expect("registry lock");
            let buses = state.buses.values().cloned().collect();
            state.buses.clear();
            buses
        };
        for bus in buses {
            bus.close();
        }
    }

    /// Watch the bus's empty signal; when it stays empty for the grace
    /// period the bus is removed. Best-effort: state is re-checked under the
    /// locks, so an add racing the sleep wins.
    fn spawn_cleanup_watcher(&self, bus: &Arc<Bus>) {
        let registry = self.weak_self.clone();
        let bus = Arc::clone(bus);
        let timeout = self.timeouts.bus_cleanup;
        tokio::spawn(async move {
            let mut empty_rx = bus.empty.subscribe();
            loop {
                let wait_empty = async {
                    loop {
                        if *empty_rx.borrow_and_update() {
                            return true;
                        }
                        if empty_rx.changed().await.is_err() {
                            return false;
                        }
                    }
                };
                tokio::select! {
                    still_open = wait_empty => {
                        if !still_open {
                            return;
                        }
                    }
                    _ = bus.scope.cancelled() => return,
                }

                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = bus.scope.cancelled() => return,
                }

                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let removed = {
                    let mut state = registry.state.lock().expect("registry lock");
                    if bus.is_empty() {
                        state.buses.remove(&bus.id).is_some()
                    } else {
                        false
                    }
                };
                if removed {
                    info!(bus = bus.id, "empty bus reclaimed");
                    bus.close();
                    return;
                }
            }
        });
    }
}

fn smallest_free(allocated: &BTreeSet<u32>) -> u32 {
    let mut candidate = 1;
    for id in allocated {
        if *id == candidate {
            candidate += 1;
        } else if *id > candidate {
            break;
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_free_scans_from_one() {
        let mut set = BTreeSet::new();
        assert_eq!(smallest_free(&set), 1);
        set.insert(1);
        assert_eq!(smallest_free(&set), 2);
        set.insert(2);
        set.insert(4);
        assert_eq!(smallest_free(&set), 3);
        set.remove(&1);
        assert_eq!(smallest_free(&set), 1);
    }
}

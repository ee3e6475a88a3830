//! Built-in emulated devices and the type-name registry the control plane
//! creates them through.
//!
//! Every device type contributes a factory producing two views of one shared
//! object: a [`UsbDeviceModel`] the USB/IP engine drives, and a
//! [`FeederSession`] that owns a feeder's control-plane stream for as long as
//! it stays connected. The factory consumes [`DeviceOptions`] (vid/pid
//! overrides plus a free-form `deviceSpecific` map whose interpretation is
//! entirely the device's business).

pub mod dualshock4;
pub mod keyboard;
pub mod mouse;
mod options;
mod session;
pub mod steamdeck;
pub mod xbox360;

pub use dualshock4::Dualshock4;
pub use keyboard::Keyboard;
pub use mouse::Mouse;
pub use options::{DeviceOptions, HexU16};
pub use session::{FeederReader, FeederSession, FeederWriter, IoFeederReader, IoFeederWriter};
pub use steamdeck::SteamDeck;
pub use xbox360::Xbox360;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use viiper_usb::UsbDeviceModel;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device type {0:?}")]
    UnknownType(String),

    #[error("invalid device options: {0}")]
    BadOptions(String),
}

/// A freshly created device: the same underlying object exposed to the URB
/// path and to the feeder stream path.
#[derive(Clone)]
pub struct CreatedDevice {
    pub model: Arc<dyn UsbDeviceModel>,
    pub session: Arc<dyn FeederSession>,
}

impl std::fmt::Debug for CreatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedDevice").finish()
    }
}

pub type DeviceFactory = fn(&DeviceOptions) -> Result<CreatedDevice, DeviceError>;

/// Case-insensitive name → factory map. Duplicate registration overrides,
/// which lets embedders shadow a built-in with their own implementation.
pub struct DeviceRegistry {
    factories: RwLock<HashMap<String, DeviceFactory>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-loaded with the built-in device types.
    pub fn with_builtins() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.register("xbox360", xbox360::create);
        registry.register("keyboard", keyboard::create);
        registry.register("mouse", mouse::create);
        registry.register("dualshock4", dualshock4::create);
        registry.register("steamdeck", steamdeck::create);
        registry
    }

    pub fn register(&self, name: &str, factory: DeviceFactory) {
        self.factories
            .write()
            .expect("registry lock")
            .insert(name.to_ascii_lowercase(), factory);
    }

    pub fn create(
        &self,
        type_name: &str,
        options: &DeviceOptions,
    ) -> Result<CreatedDevice, DeviceError> {
        let factory = self
            .factories
            .read()
            .expect("registry lock")
            .get(&type_name.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| DeviceError::UnknownType(type_name.to_owned()))?;
        factory(options)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories
            .read()
            .expect("registry lock")
            .contains_key(&type_name.to_ascii_lowercase())
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

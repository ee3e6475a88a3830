//! USB descriptor model and the polymorphic device-model contract.
//!
//! A device implementation hands the engine a static [`DeviceProfile`] (its
//! descriptor tree) and services transfers through [`UsbDeviceModel`]. The
//! engine owns EP0 enumeration; devices only see non-zero endpoints plus the
//! class-specific control requests the standard handler does not recognise.
//!
//! Descriptor encoders follow the USB convention: little-endian multi-byte
//! fields, UTF-16LE string descriptors, and a configuration descriptor whose
//! `wTotalLength` is patched after the interface/endpoint tree is assembled.

mod descriptor;
pub mod hid;
mod model;
mod setup;

pub use descriptor::{
    decode_configuration, decode_device_descriptor, encode_configuration,
    encode_device_descriptor, encode_hid_descriptor, encode_string_descriptor,
    ConfigurationDescriptor, DeviceDescriptor, DeviceProfile, EndpointDescriptor, HidFunction,
    InterfaceProfile, ProfileError, StringTable, CONFIGURATION_DESCRIPTOR_LEN,
    DEVICE_DESCRIPTOR_LEN, ENDPOINT_DESCRIPTOR_LEN, HID_DESCRIPTOR_LEN, INTERFACE_DESCRIPTOR_LEN,
};
pub use model::{OutputReceiver, OutputSink, UsbDeviceModel};
pub use setup::{Dir, SetupPacket};

/// Standard descriptor types (high byte of `wValue` in GET_DESCRIPTOR).
pub const DT_DEVICE: u8 = 1;
pub const DT_CONFIGURATION: u8 = 2;
pub const DT_STRING: u8 = 3;
pub const DT_INTERFACE: u8 = 4;
pub const DT_ENDPOINT: u8 = 5;

/// Standard device requests serviced by the engine's EP0 handler.
pub const REQ_GET_STATUS: u8 = 0;
pub const REQ_SET_ADDRESS: u8 = 5;
pub const REQ_GET_DESCRIPTOR: u8 = 6;
pub const REQ_GET_CONFIGURATION: u8 = 8;
pub const REQ_SET_CONFIGURATION: u8 = 9;

/// Endpoint attribute transfer types (`bmAttributes & 0x03`).
pub const EP_XFER_CONTROL: u8 = 0;
pub const EP_XFER_ISOC: u8 = 1;
pub const EP_XFER_BULK: u8 = 2;
pub const EP_XFER_INTERRUPT: u8 = 3;

/// Endpoint address direction bit.
pub const EP_DIR_IN: u8 = 0x80;

/// The conventional en-US language id used for string tables.
pub const LANG_ID_EN_US: u16 = 0x0409;

/// Bus speed classes as exported over USB/IP.
pub const SPEED_LOW: u32 = 1;
pub const SPEED_FULL: u32 = 2;
pub const SPEED_HIGH: u32 = 3;

//! Descriptor tree and little-endian encoders.

use thiserror::Error;

use crate::{
    DT_CONFIGURATION, DT_DEVICE, DT_ENDPOINT, DT_INTERFACE, DT_STRING, EP_XFER_ISOC,
    LANG_ID_EN_US,
};

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIGURATION_DESCRIPTOR_LEN: usize = 9;
pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;
pub const HID_DESCRIPTOR_LEN: usize = 9;

/// HID class descriptor type, also valid as an interface-targeted
/// GET_DESCRIPTOR type.
pub(crate) const DT_HID: u8 = 0x21;
pub(crate) const DT_HID_REPORT: u8 = 0x22;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("descriptor too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unexpected descriptor type {got:#04x}, wanted {want:#04x}")]
    WrongType { got: u8, want: u8 },

    #[error("interface {interface} endpoint {address:#04x} is isochronous")]
    IsochronousEndpoint { interface: u8, address: u8 },

    #[error("string index {0} is out of range")]
    BadStringIndex(u8),

    #[error("profile exports no interfaces")]
    NoInterfaces,
}

/// The fixed fields of the 18-byte device descriptor. `bNumConfigurations`
/// is always 1 for VIIPER devices; `iManufacturer`-style indexes refer to the
/// profile's string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn is_isochronous(&self) -> bool {
        self.attributes & 0x03 == EP_XFER_ISOC
    }
}

/// A HID function attached to one interface: the 9-byte class descriptor is
/// derived from these fields plus the report descriptor length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidFunction {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub report_descriptor: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceProfile {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub i_interface: u8,
    pub hid: Option<HidFunction>,
    /// Raw class-specific descriptors emitted verbatim after the HID
    /// descriptor (vendor interfaces like XUSB carry one).
    pub class_specific: Vec<Vec<u8>>,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Language-indexed string table. Index 0 on the wire is the LangID list;
/// `strings[0]` here is string descriptor index 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    pub lang_id: u16,
    pub strings: Vec<String>,
}

impl StringTable {
    pub fn en_us(strings: &[&str]) -> StringTable {
        StringTable {
            lang_id: LANG_ID_EN_US,
            strings: strings.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    pub fn get(&self, index: u8) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.strings.get(index as usize - 1).map(String::as_str)
    }
}

/// A device's complete static descriptor tree plus the USB/IP speed class it
/// is exported with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub device: DeviceDescriptor,
    pub configuration: ConfigurationDescriptor,
    pub interfaces: Vec<InterfaceProfile>,
    pub strings: StringTable,
    pub speed: u32,
}

impl DeviceProfile {
    /// Validate the tree at registration time. Isochronous endpoints are not
    /// exportable over this transport and fail here instead of at transfer
    /// time.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.interfaces.is_empty() {
            return Err(ProfileError::NoInterfaces);
        }
        for (num, intf) in self.interfaces.iter().enumerate() {
            for ep in &intf.endpoints {
                if ep.is_isochronous() {
                    return Err(ProfileError::IsochronousEndpoint {
                        interface: num as u8,
                        address: ep.address,
                    });
                }
            }
        }
        for index in [
            self.device.i_manufacturer,
            self.device.i_product,
            self.device.i_serial_number,
            self.configuration.i_configuration,
        ]
        .into_iter()
        .chain(self.interfaces.iter().map(|i| i.i_interface))
        {
            if index != 0 && self.strings.get(index).is_none() {
                return Err(ProfileError::BadStringIndex(index));
            }
        }
        Ok(())
    }

    /// Report-descriptor bytes for the given interface, if it is a HID
    /// function.
    pub fn report_descriptor(&self, interface: u8) -> Option<&[u8]> {
        self.interfaces
            .get(interface as usize)?
            .hid
            .as_ref()
            .map(|hid| hid.report_descriptor.as_slice())
    }
}

pub fn encode_device_descriptor(profile: &DeviceProfile) -> Vec<u8> {
    let d = &profile.device;
    let mut out = Vec::with_capacity(DEVICE_DESCRIPTOR_LEN);
    out.push(DEVICE_DESCRIPTOR_LEN as u8);
    out.push(DT_DEVICE);
    out.extend_from_slice(&d.bcd_usb.to_le_bytes());
    out.push(d.device_class);
    out.push(d.device_subclass);
    out.push(d.device_protocol);
    out.push(d.max_packet_size0);
    out.extend_from_slice(&d.id_vendor.to_le_bytes());
    out.extend_from_slice(&d.id_product.to_le_bytes());
    out.extend_from_slice(&d.bcd_device.to_le_bytes());
    out.push(d.i_manufacturer);
    out.push(d.i_product);
    out.push(d.i_serial_number);
    out.push(d.num_configurations);
    out
}

pub fn decode_device_descriptor(buf: &[u8]) -> Result<DeviceDescriptor, ProfileError> {
    if buf.len() < DEVICE_DESCRIPTOR_LEN {
        return Err(ProfileError::Truncated {
            need: DEVICE_DESCRIPTOR_LEN,
            have: buf.len(),
        });
    }
    if buf[1] != DT_DEVICE {
        return Err(ProfileError::WrongType {
            got: buf[1],
            want: DT_DEVICE,
        });
    }
    Ok(DeviceDescriptor {
        bcd_usb: u16::from_le_bytes([buf[2], buf[3]]),
        device_class: buf[4],
        device_subclass: buf[5],
        device_protocol: buf[6],
        max_packet_size0: buf[7],
        id_vendor: u16::from_le_bytes([buf[8], buf[9]]),
        id_product: u16::from_le_bytes([buf[10], buf[11]]),
        bcd_device: u16::from_le_bytes([buf[12], buf[13]]),
        i_manufacturer: buf[14],
        i_product: buf[15],
        i_serial_number: buf[16],
        num_configurations: buf[17],
    })
}

/// Encode the 9-byte HID class descriptor for a function, advertising one
/// report descriptor of the function's length.
pub fn encode_hid_descriptor(hid: &HidFunction) -> Vec<u8> {
    let mut out = Vec::with_capacity(HID_DESCRIPTOR_LEN);
    out.push(HID_DESCRIPTOR_LEN as u8);
    out.push(DT_HID);
    out.extend_from_slice(&hid.bcd_hid.to_le_bytes());
    out.push(hid.country_code);
    out.push(1);
    out.push(DT_HID_REPORT);
    out.extend_from_slice(&(hid.report_descriptor.len() as u16).to_le_bytes());
    out
}

/// Assemble the full configuration reply: configuration header (with
/// `wTotalLength` patched once the tree is known), then per interface the
/// interface descriptor, its HID class descriptor, its raw class-specific
/// descriptors, and its endpoint descriptors.
pub fn encode_configuration(profile: &DeviceProfile) -> Vec<u8> {
    let c = &profile.configuration;
    let mut out = Vec::new();
    out.push(CONFIGURATION_DESCRIPTOR_LEN as u8);
    out.push(DT_CONFIGURATION);
    out.extend_from_slice(&[0, 0]); // wTotalLength, patched below
    out.push(profile.interfaces.len() as u8);
    out.push(c.configuration_value);
    out.push(c.i_configuration);
    out.push(c.attributes);
    out.push(c.max_power);

    for (num, intf) in profile.interfaces.iter().enumerate() {
        out.push(INTERFACE_DESCRIPTOR_LEN as u8);
        out.push(DT_INTERFACE);
        out.push(num as u8);
        out.push(0); // bAlternateSetting
        out.push(intf.endpoints.len() as u8);
        out.push(intf.class);
        out.push(intf.subclass);
        out.push(intf.protocol);
        out.push(intf.i_interface);

        if let Some(hid) = &intf.hid {
            out.extend_from_slice(&encode_hid_descriptor(hid));
        }
        for extra in &intf.class_specific {
            out.extend_from_slice(extra);
        }
        for ep in &intf.endpoints {
            out.push(ENDPOINT_DESCRIPTOR_LEN as u8);
            out.push(DT_ENDPOINT);
            out.push(ep.address);
            out.push(ep.attributes);
            out.extend_from_slice(&ep.max_packet_size.to_le_bytes());
            out.push(ep.interval);
        }
    }

    let total = out.len() as u16;
    out[2..4].copy_from_slice(&total.to_le_bytes());
    out
}

/// Parse an assembled configuration back into its tree. Class-specific blobs
/// (anything that is not an interface, HID or endpoint descriptor) are
/// collected verbatim onto the interface they follow.
pub fn decode_configuration(
    buf: &[u8],
) -> Result<(ConfigurationDescriptor, Vec<InterfaceProfile>), ProfileError> {
    if buf.len() < CONFIGURATION_DESCRIPTOR_LEN {
        return Err(ProfileError::Truncated {
            need: CONFIGURATION_DESCRIPTOR_LEN,
            have: buf.len(),
        });
    }
    if buf[1] != DT_CONFIGURATION {
        return Err(ProfileError::WrongType {
            got: buf[1],
            want: DT_CONFIGURATION,
        });
    }
    let total = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < total {
        return Err(ProfileError::Truncated {
            need: total,
            have: buf.len(),
        });
    }
    let config = ConfigurationDescriptor {
        configuration_value: buf[5],
        i_configuration: buf[6],
        attributes: buf[7],
        max_power: buf[8],
    };

    let mut interfaces = Vec::new();
    let mut off = CONFIGURATION_DESCRIPTOR_LEN;
    while off < total {
        let len = buf[off] as usize;
        if len < 2 || off + len > total {
            return Err(ProfileError::Truncated {
                need: off + len.max(2),
                have: total,
            });
        }
        let desc = &buf[off..off + len];
        match desc[1] {
            DT_INTERFACE => {
                interfaces.push(InterfaceProfile {
                    class: desc[5],
                    subclass: desc[6],
                    protocol: desc[7],
                    i_interface: desc[8],
                    hid: None,
                    class_specific: Vec::new(),
                    endpoints: Vec::new(),
                });
            }
            DT_HID => {
                let intf = interfaces.last_mut().ok_or(ProfileError::WrongType {
                    got: DT_HID,
                    want: DT_INTERFACE,
                })?;
                intf.hid = Some(HidFunction {
                    bcd_hid: u16::from_le_bytes([desc[2], desc[3]]),
                    country_code: desc[4],
                    report_descriptor: Vec::new(),
                });
            }
            DT_ENDPOINT => {
                let intf = interfaces.last_mut().ok_or(ProfileError::WrongType {
                    got: DT_ENDPOINT,
                    want: DT_INTERFACE,
                })?;
                intf.endpoints.push(EndpointDescriptor {
                    address: desc[2],
                    attributes: desc[3],
                    max_packet_size: u16::from_le_bytes([desc[4], desc[5]]),
                    interval: desc[6],
                });
            }
            _ => {
                let intf = interfaces.last_mut().ok_or(ProfileError::WrongType {
                    got: desc[1],
                    want: DT_INTERFACE,
                })?;
                intf.class_specific.push(desc.to_vec());
            }
        }
        off += len;
    }

    // The report descriptor bytes are not part of the configuration reply,
    // so decoded HID functions come back with an empty descriptor body.
    Ok((config, interfaces))
}

/// Encode the string descriptor for `index`; index 0 is the LangID table.
/// `None` means the index is not populated (the engine stalls).
pub fn encode_string_descriptor(table: &StringTable, index: u8) -> Option<Vec<u8>> {
    if index == 0 {
        let mut out = Vec::with_capacity(4);
        out.push(4);
        out.push(DT_STRING);
        out.extend_from_slice(&table.lang_id.to_le_bytes());
        return Some(out);
    }
    let value = table.get(index)?;
    // A string descriptor is at most 255 bytes: 2 header bytes + 126 UTF-16
    // code units.
    let units: Vec<u16> = value.encode_utf16().take(126).collect();
    let mut out = Vec::with_capacity(2 + units.len() * 2);
    out.push((2 + units.len() * 2) as u8);
    out.push(DT_STRING);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Some(out)
}

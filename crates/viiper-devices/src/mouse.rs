//! HID mouse with 16-bit relative axes, wheel and horizontal (AC Pan) wheel.
//!
//! Unlike the gamepads, mouse input is relative: feeder frames accumulate
//! into the snapshot and each IN poll drains the accumulated deltas, so no
//! motion is lost between polls. Button state is last-writer-wins. The mouse
//! has no device-to-host events, so its s2c direction stays silent.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use viiper_usb::hid::{CLASS_HID, PROTOCOL_NONE};
use viiper_usb::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceProfile, Dir, EndpointDescriptor,
    HidFunction, InterfaceProfile, StringTable, UsbDeviceModel, EP_DIR_IN, EP_XFER_INTERRUPT,
    SPEED_FULL,
};

use crate::session::{read_or_eof, FeederReader, FeederSession, FeederWriter};
use crate::{CreatedDevice, DeviceError, DeviceOptions};

pub const VID: u16 = 0x1209;
pub const PID: u16 = 0x9002;

/// Feeder input frame: `buttons:u8 dx:i16 dy:i16 wheel:i16 pan:i16`.
pub const INPUT_FRAME_LEN: usize = 9;

const REPORT_LEN: usize = 9;

/// Report: 8 buttons, then X/Y/Wheel/AC-Pan as 16-bit relative values.
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xa1, 0x01, // Collection (Application)
    0x09, 0x01, //   Usage (Pointer)
    0xa1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Buttons)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x08, //     Usage Maximum (8)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x75, 0x01, //     Report Size (1)
    0x95, 0x08, //     Report Count (8)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x09, 0x38, //     Usage (Wheel)
    0x05, 0x0c, //     Usage Page (Consumer)
    0x0a, 0x38, 0x02, // Usage (AC Pan)
    0x16, 0x00, 0x80, // Logical Minimum (-32768)
    0x26, 0xff, 0x7f, // Logical Maximum (32767)
    0x75, 0x10, //     Report Size (16)
    0x95, 0x04, //     Report Count (4)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    0xc0, //   End Collection
    0xc0, // End Collection
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseFrame {
    pub buttons: u8,
    pub dx: i16,
    pub dy: i16,
    pub wheel: i16,
    pub pan: i16,
}

impl MouseFrame {
    pub fn decode(frame: &[u8; INPUT_FRAME_LEN]) -> MouseFrame {
        MouseFrame {
            buttons: frame[0],
            dx: i16::from_le_bytes([frame[1], frame[2]]),
            dy: i16::from_le_bytes([frame[3], frame[4]]),
            wheel: i16::from_le_bytes([frame[5], frame[6]]),
            pan: i16::from_le_bytes([frame[7], frame[8]]),
        }
    }

    pub fn encode(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut out = [0u8; INPUT_FRAME_LEN];
        out[0] = self.buttons;
        out[1..3].copy_from_slice(&self.dx.to_le_bytes());
        out[3..5].copy_from_slice(&self.dy.to_le_bytes());
        out[5..7].copy_from_slice(&self.wheel.to_le_bytes());
        out[7..9].copy_from_slice(&self.pan.to_le_bytes());
        out
    }
}

#[derive(Default)]
struct MouseState {
    buttons: u8,
    dx: i32,
    dy: i32,
    wheel: i32,
    pan: i32,
}

impl MouseState {
    fn accumulate(&mut self, frame: &MouseFrame) {
        self.buttons = frame.buttons;
        self.dx += i32::from(frame.dx);
        self.dy += i32::from(frame.dy);
        self.wheel += i32::from(frame.wheel);
        self.pan += i32::from(frame.pan);
    }

    /// Drain up to one report worth of motion, leaving any overflow for the
    /// next poll.
    fn drain_report(&mut self) -> Vec<u8> {
        fn take(acc: &mut i32) -> i16 {
            let step = (*acc).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            *acc -= i32::from(step);
            step
        }

        let dx = take(&mut self.dx);
        let dy = take(&mut self.dy);
        let wheel = take(&mut self.wheel);
        let pan = take(&mut self.pan);

        let mut report = vec![0u8; REPORT_LEN];
        report[0] = self.buttons;
        report[1..3].copy_from_slice(&dx.to_le_bytes());
        report[3..5].copy_from_slice(&dy.to_le_bytes());
        report[5..7].copy_from_slice(&wheel.to_le_bytes());
        report[7..9].copy_from_slice(&pan.to_le_bytes());
        report
    }
}

pub struct Mouse {
    profile: DeviceProfile,
    state: Mutex<MouseState>,
}

pub(crate) fn create(options: &DeviceOptions) -> Result<CreatedDevice, DeviceError> {
    let device = Arc::new(Mouse::new(options));
    Ok(CreatedDevice {
        model: device.clone(),
        session: device,
    })
}

impl Mouse {
    pub fn new(options: &DeviceOptions) -> Mouse {
        let (vid, pid) = options.vid_pid(VID, PID);
        Mouse {
            profile: profile(vid, pid),
            state: Mutex::new(MouseState::default()),
        }
    }

    pub fn push(&self, frame: &MouseFrame) {
        self.state.lock().expect("mouse state lock").accumulate(frame);
    }
}

impl UsbDeviceModel for Mouse {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn handle_transfer(&self, ep: u8, dir: Dir, _payload: &[u8]) -> Vec<u8> {
        match (ep, dir) {
            (1, Dir::In) => self.state.lock().expect("mouse state lock").drain_report(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl FeederSession for Mouse {
    async fn run(
        &self,
        reader: &mut (dyn FeederReader + '_),
        _writer: &mut (dyn FeederWriter + '_),
    ) -> io::Result<()> {
        let mut frame = [0u8; INPUT_FRAME_LEN];
        while read_or_eof(reader, &mut frame).await?.is_some() {
            self.push(&MouseFrame::decode(&frame));
        }
        Ok(())
    }
}

fn profile(vid: u16, pid: u16) -> DeviceProfile {
    DeviceProfile {
        device: DeviceDescriptor {
            bcd_usb: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: 64,
            id_vendor: vid,
            id_product: pid,
            bcd_device: 0x0100,
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 0,
            num_configurations: 1,
        },
        configuration: ConfigurationDescriptor {
            configuration_value: 1,
            i_configuration: 0,
            attributes: 0xa0,
            max_power: 50,
        },
        interfaces: vec![InterfaceProfile {
            class: CLASS_HID,
            subclass: 0,
            protocol: PROTOCOL_NONE,
            i_interface: 0,
            hid: Some(HidFunction {
                bcd_hid: 0x0111,
                country_code: 0,
                report_descriptor: REPORT_DESCRIPTOR.to_vec(),
            }),
            class_specific: Vec::new(),
            endpoints: vec![EndpointDescriptor {
                address: EP_DIR_IN | 1,
                attributes: EP_XFER_INTERRUPT,
                max_packet_size: 16,
                interval: 4,
            }],
        }],
        strings: StringTable::en_us(&["VIIPER", "Mouse"]),
        speed: SPEED_FULL,
    }
}

//! Sony DualShock 4 (CUH-ZCT1, USB).
//!
//! Input travels as the 64-byte USB report 0x01; host output arrives as
//! report 0x05 on the interrupt OUT endpoint and is condensed into a 7-byte
//! s2c frame (rumble pair, lightbar RGB, flash timings). Feature reports for
//! calibration, firmware info and the pairing address answer with fixed-size
//! zeroed bodies so host drivers proceed through their probe sequence.
//!
//! Feeder input frames are 31 bytes, little-endian:
//! `lx ly rx ry : u8 | l2 r2 : u8 | dpad : u8 | buttons : u16 | special : u8 |
//!  gyro x y z : i16 | accel x y z : i16 | touch_active : u8 | touch_id : u8 |
//!  touch_x : u16 | touch_y : u16 | battery : u8 | timestamp : u16`.

use bitflags::bitflags;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::select;

use async_trait::async_trait;
use viiper_usb::hid::{CLASS_HID, PROTOCOL_NONE, REPORT_TYPE_FEATURE, REQ_GET_REPORT};
use viiper_usb::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceProfile, Dir, EndpointDescriptor,
    HidFunction, InterfaceProfile, OutputSink, SetupPacket, StringTable, UsbDeviceModel,
    EP_DIR_IN, EP_XFER_INTERRUPT, SPEED_HIGH,
};

use crate::session::{read_or_eof, FeederReader, FeederSession, FeederWriter};
use crate::{CreatedDevice, DeviceError, DeviceOptions};

pub const VID: u16 = 0x054c;
pub const PID: u16 = 0x05c4;

pub const INPUT_FRAME_LEN: usize = 31;
pub const OUTPUT_FRAME_LEN: usize = 7;

const REPORT_LEN: usize = 64;
const IN_EP: u8 = 4;
const OUT_EP: u8 = 3;

/// Hat value reported when no d-pad direction is held.
pub const DPAD_RELEASED: u8 = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Buttons: u16 {
        const SQUARE = 0x0001;
        const CROSS = 0x0002;
        const CIRCLE = 0x0004;
        const TRIANGLE = 0x0008;
        const L1 = 0x0010;
        const R1 = 0x0020;
        const L2 = 0x0040;
        const R2 = 0x0080;
        const SHARE = 0x0100;
        const OPTIONS = 0x0200;
        const L3 = 0x0400;
        const R3 = 0x0800;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Special: u8 {
        const PS = 0x01;
        const TOUCHPAD = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ds4State {
    pub left_x: u8,
    pub left_y: u8,
    pub right_x: u8,
    pub right_y: u8,
    pub l2: u8,
    pub r2: u8,
    pub dpad: u8,
    pub buttons: u16,
    pub special: u8,
    pub gyro: [i16; 3],
    pub accel: [i16; 3],
    pub touch_active: bool,
    pub touch_id: u8,
    pub touch_x: u16,
    pub touch_y: u16,
    pub battery: u8,
    pub timestamp: u16,
}

impl Default for Ds4State {
    fn default() -> Ds4State {
        Ds4State {
            left_x: 0x80,
            left_y: 0x80,
            right_x: 0x80,
            right_y: 0x80,
            l2: 0,
            r2: 0,
            dpad: DPAD_RELEASED,
            buttons: 0,
            special: 0,
            gyro: [0; 3],
            accel: [0; 3],
            touch_active: false,
            touch_id: 0,
            touch_x: 0,
            touch_y: 0,
            battery: 0x0b,
            timestamp: 0,
        }
    }
}

impl Ds4State {
    pub fn decode(frame: &[u8; INPUT_FRAME_LEN]) -> Ds4State {
        let i16_at = |off: usize| i16::from_le_bytes([frame[off], frame[off + 1]]);
        Ds4State {
            left_x: frame[0],
            left_y: frame[1],
            right_x: frame[2],
            right_y: frame[3],
            l2: frame[4],
            r2: frame[5],
            dpad: frame[6].min(DPAD_RELEASED),
            buttons: u16::from_le_bytes([frame[7], frame[8]]),
            special: frame[9] & Special::all().bits(),
            gyro: [i16_at(10), i16_at(12), i16_at(14)],
            accel: [i16_at(16), i16_at(18), i16_at(20)],
            touch_active: frame[22] != 0,
            touch_id: frame[23],
            touch_x: u16::from_le_bytes([frame[24], frame[25]]) & 0x0fff,
            touch_y: u16::from_le_bytes([frame[26], frame[27]]) & 0x0fff,
            battery: frame[28],
            timestamp: u16::from_le_bytes([frame[29], frame[30]]),
        }
    }

    pub fn encode(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut out = [0u8; INPUT_FRAME_LEN];
        out[0] = self.left_x;
        out[1] = self.left_y;
        out[2] = self.right_x;
        out[3] = self.right_y;
        out[4] = self.l2;
        out[5] = self.r2;
        out[6] = self.dpad;
        out[7..9].copy_from_slice(&self.buttons.to_le_bytes());
        out[9] = self.special;
        for (i, v) in self.gyro.iter().enumerate() {
            out[10 + i * 2..12 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.accel.iter().enumerate() {
            out[16 + i * 2..18 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        out[22] = self.touch_active as u8;
        out[23] = self.touch_id;
        out[24..26].copy_from_slice(&self.touch_x.to_le_bytes());
        out[26..28].copy_from_slice(&self.touch_y.to_le_bytes());
        out[28] = self.battery;
        out[29..31].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Build the 64-byte USB input report 0x01.
    fn report(&self, counter: u8) -> Vec<u8> {
        let buttons = Buttons::from_bits_truncate(self.buttons);
        let mut report = vec![0u8; REPORT_LEN];
        report[0] = 0x01;
        report[1] = self.left_x;
        report[2] = self.left_y;
        report[3] = self.right_x;
        report[4] = self.right_y;
        report[5] = (self.dpad & 0x0f)
            | bit(buttons.contains(Buttons::SQUARE), 4)
            | bit(buttons.contains(Buttons::CROSS), 5)
            | bit(buttons.contains(Buttons::CIRCLE), 6)
            | bit(buttons.contains(Buttons::TRIANGLE), 7);
        report[6] = bit(buttons.contains(Buttons::L1), 0)
            | bit(buttons.contains(Buttons::R1), 1)
            | bit(buttons.contains(Buttons::L2), 2)
            | bit(buttons.contains(Buttons::R2), 3)
            | bit(buttons.contains(Buttons::SHARE), 4)
            | bit(buttons.contains(Buttons::OPTIONS), 5)
            | bit(buttons.contains(Buttons::L3), 6)
            | bit(buttons.contains(Buttons::R3), 7);
        report[7] = (self.special & Special::all().bits()) | (counter << 2);
        report[8] = self.l2;
        report[9] = self.r2;
        report[10..12].copy_from_slice(&self.timestamp.to_le_bytes());
        report[12] = self.battery;
        for (i, v) in self.gyro.iter().enumerate() {
            report[13 + i * 2..15 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.accel.iter().enumerate() {
            report[19 + i * 2..21 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        report[30] = self.battery | 0x10; // cable attached
        report[33] = 1; // one touch packet
        report[34] = self.timestamp as u8;
        report[35] = (self.touch_id & 0x7f) | if self.touch_active { 0 } else { 0x80 };
        report[36] = (self.touch_x & 0xff) as u8;
        report[37] = ((self.touch_x >> 8) as u8 & 0x0f) | (((self.touch_y & 0x0f) as u8) << 4);
        report[38] = (self.touch_y >> 4) as u8;
        report[39] = 0x80; // second finger inactive
        report
    }
}

fn bit(set: bool, shift: u8) -> u8 {
    (set as u8) << shift
}

pub struct Dualshock4 {
    profile: DeviceProfile,
    state: Mutex<Ds4State>,
    counter: Mutex<u8>,
    sink: Mutex<Option<OutputSink>>,
}

pub(crate) fn create(options: &DeviceOptions) -> Result<CreatedDevice, DeviceError> {
    let device = Arc::new(Dualshock4::new(options));
    Ok(CreatedDevice {
        model: device.clone(),
        session: device,
    })
}

impl Dualshock4 {
    pub fn new(options: &DeviceOptions) -> Dualshock4 {
        let (vid, pid) = options.vid_pid(VID, PID);
        Dualshock4 {
            profile: profile(vid, pid),
            state: Mutex::new(Ds4State::default()),
            counter: Mutex::new(0),
            sink: Mutex::new(None),
        }
    }

    fn set_sink(&self, sink: Option<OutputSink>) {
        *self.sink.lock().expect("sink lock") = sink;
    }

    fn handle_output_report(&self, payload: &[u8]) {
        if payload.len() < 11 || payload[0] != 0x05 {
            return;
        }
        let frame = vec![
            payload[4],  // weak (right) rumble
            payload[5],  // strong (left) rumble
            payload[6],  // lightbar red
            payload[7],  // lightbar green
            payload[8],  // lightbar blue
            payload[9],  // flash on duration
            payload[10], // flash off duration
        ];
        if let Some(sink) = self.sink.lock().expect("sink lock").as_ref() {
            sink.emit(frame);
        }
    }
}

impl UsbDeviceModel for Dualshock4 {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn handle_transfer(&self, ep: u8, dir: Dir, payload: &[u8]) -> Vec<u8> {
        match (ep, dir) {
            (IN_EP, Dir::In) => {
                let counter = {
                    let mut c = self.counter.lock().expect("counter lock");
                    *c = (*c + 1) & 0x3f;
                    *c
                };
                self.state.lock().expect("ds4 state lock").report(counter)
            }
            (OUT_EP, Dir::Out) => {
                self.handle_output_report(payload);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_control(&self, setup: SetupPacket, _payload: &[u8]) -> Option<Vec<u8>> {
        // Feature reports host drivers read while probing. Sizes match the
        // hardware; contents are neutral (zero calibration, zero MAC).
        if setup.bm_request_type == 0xa1
            && setup.b_request == REQ_GET_REPORT
            && setup.descriptor_type() == REPORT_TYPE_FEATURE
        {
            let body_len = match setup.descriptor_index() {
                0x02 => 36, // motion calibration
                0xa3 => 48, // firmware/date info
                0x12 => 15, // pairing address
                _ => return None,
            };
            let mut report = vec![0u8; body_len + 1];
            report[0] = setup.descriptor_index();
            return Some(report);
        }
        None
    }
}

#[async_trait]
impl FeederSession for Dualshock4 {
    async fn run(
        &self,
        reader: &mut (dyn FeederReader + '_),
        writer: &mut (dyn FeederWriter + '_),
    ) -> io::Result<()> {
        let (sink, mut events) = OutputSink::channel();
        self.set_sink(Some(sink));

        let input = async {
            let mut frame = [0u8; INPUT_FRAME_LEN];
            while read_or_eof(reader, &mut frame).await?.is_some() {
                *self.state.lock().expect("ds4 state lock") = Ds4State::decode(&frame);
            }
            Ok(())
        };
        let output = async {
            while let Some(frame) = events.recv().await {
                writer.write_frame(&frame).await?;
            }
            Ok(())
        };

        let result = select! {
            r = input => r,
            w = output => w,
        };
        self.set_sink(None);
        result
    }
}

/// Compact report descriptor for report 0x01 (input), 0x05 (output) and the
/// probed feature reports. Axis and button fields mirror the hardware; the
/// sensor/touch tail is vendor-typed padding.
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x05, // Usage (Gamepad)
    0xa1, 0x01, // Collection (Application)
    0x85, 0x01, //   Report ID (1)
    0x09, 0x30, //   Usage (X)
    0x09, 0x31, //   Usage (Y)
    0x09, 0x32, //   Usage (Z)
    0x09, 0x35, //   Usage (Rz)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xff, 0x00, // Logical Maximum (255)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x04, //   Report Count (4)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x09, 0x39, //   Usage (Hat Switch)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x07, //   Logical Maximum (7)
    0x35, 0x00, //   Physical Minimum (0)
    0x46, 0x3b, 0x01, // Physical Maximum (315)
    0x65, 0x14, //   Unit (Degrees)
    0x75, 0x04, //   Report Size (4)
    0x95, 0x01, //   Report Count (1)
    0x81, 0x42, //   Input (Data, Variable, Absolute, Null State)
    0x65, 0x00, //   Unit (None)
    0x05, 0x09, //   Usage Page (Buttons)
    0x19, 0x01, //   Usage Minimum (1)
    0x29, 0x0e, //   Usage Maximum (14)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x0e, //   Report Count (14)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x06, 0x00, 0xff, // Usage Page (Vendor)
    0x09, 0x20, //   Usage (0x20)
    0x75, 0x06, //   Report Size (6)
    0x95, 0x01, //   Report Count (1)
    0x81, 0x02, //   Input - report counter
    0x05, 0x01, //   Usage Page (Generic Desktop)
    0x09, 0x33, //   Usage (Rx)
    0x09, 0x34, //   Usage (Ry)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xff, 0x00, // Logical Maximum (255)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x02, //   Report Count (2)
    0x81, 0x02, //   Input - triggers
    0x06, 0x00, 0xff, // Usage Page (Vendor)
    0x09, 0x21, //   Usage (0x21)
    0x95, 0x36, //   Report Count (54)
    0x81, 0x02, //   Input - sensors, touch and padding
    0x85, 0x05, //   Report ID (5)
    0x09, 0x22, //   Usage (0x22)
    0x95, 0x1f, //   Report Count (31)
    0x91, 0x02, //   Output - rumble and lightbar
    0x85, 0x02, //   Report ID (2)
    0x09, 0x24, //   Usage (0x24)
    0x95, 0x24, //   Report Count (36)
    0xb1, 0x02, //   Feature - calibration
    0x85, 0xa3, //   Report ID (163)
    0x09, 0x25, //   Usage (0x25)
    0x95, 0x30, //   Report Count (48)
    0xb1, 0x02, //   Feature - firmware info
    0x85, 0x12, //   Report ID (18)
    0x09, 0x26, //   Usage (0x26)
    0x95, 0x0f, //   Report Count (15)
    0xb1, 0x02, //   Feature - pairing address
    0xc0, // End Collection
];

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
            attributes: 0xc0,
            max_power: 250,
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
            endpoints: vec![
                EndpointDescriptor {
                    address: EP_DIR_IN | IN_EP,
                    attributes: EP_XFER_INTERRUPT,
                    max_packet_size: 64,
                    interval: 5,
                },
                EndpointDescriptor {
                    address: OUT_EP,
                    attributes: EP_XFER_INTERRUPT,
                    max_packet_size: 64,
                    interval: 5,
                },
            ],
        }],
        strings: StringTable::en_us(&["Sony Interactive Entertainment", "Wireless Controller"]),
        speed: SPEED_HIGH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_frame_roundtrip() {
        let state = Ds4State {
            left_x: 1,
            left_y: 2,
            right_x: 3,
            right_y: 4,
            l2: 5,
            r2: 6,
            dpad: 2,
            buttons: (Buttons::CROSS | Buttons::R3).bits(),
            special: Special::PS.bits(),
            gyro: [-100, 200, -300],
            accel: [400, -500, 600],
            touch_active: true,
            touch_id: 17,
            touch_x: 1920,
            touch_y: 941,
            battery: 9,
            timestamp: 0xbeef,
        };
        assert_eq!(Ds4State::decode(&state.encode()), state);
    }

    #[test]
    fn report_packs_hat_and_face_buttons() {
        let ds4 = Dualshock4::new(&DeviceOptions::default());
        *ds4.state.lock().unwrap() = Ds4State {
            dpad: 6,
            buttons: (Buttons::SQUARE | Buttons::TRIANGLE | Buttons::L1 | Buttons::R3).bits(),
            special: Special::TOUCHPAD.bits(),
            ..Ds4State::default()
        };
        let report = ds4.handle_transfer(IN_EP, Dir::In, &[]);
        assert_eq!(report.len(), 64);
        assert_eq!(report[0], 0x01);
        assert_eq!(report[5] & 0x0f, 6);
        assert_eq!(report[5] >> 4, 0b1001); // square + triangle
        assert_eq!(report[6], 0x81); // L1 + R3
        assert_eq!(report[7] & 0x03, Special::TOUCHPAD.bits());
    }

    #[test]
    fn report_counter_increments_per_poll() {
        let ds4 = Dualshock4::new(&DeviceOptions::default());
        let first = ds4.handle_transfer(IN_EP, Dir::In, &[]);
        let second = ds4.handle_transfer(IN_EP, Dir::In, &[]);
        assert_ne!(first[7] >> 2, second[7] >> 2);
    }

    #[test]
    fn touch_point_is_packed_as_12_bit_pair() {
        let ds4 = Dualshock4::new(&DeviceOptions::default());
        *ds4.state.lock().unwrap() = Ds4State {
            touch_active: true,
            touch_id: 3,
            touch_x: 0x0abc,
            touch_y: 0x0345,
            ..Ds4State::default()
        };
        let report = ds4.handle_transfer(IN_EP, Dir::In, &[]);
        assert_eq!(report[35], 3); // active finger keeps bit 7 clear
        assert_eq!(report[36], 0xbc);
        assert_eq!(report[37], 0x5a);
        assert_eq!(report[38], 0x34);
    }

    #[test]
    fn output_report_becomes_a_seven_byte_frame() {
        let ds4 = Dualshock4::new(&DeviceOptions::default());
        let (sink, mut rx) = OutputSink::channel();
        ds4.set_sink(Some(sink));
        let mut report = vec![0u8; 32];
        report[0] = 0x05;
        report[1] = 0xf7;
        report[4] = 0x40; // weak rumble
        report[5] = 0xff; // strong rumble
        report[6] = 0x10;
        report[7] = 0x20;
        report[8] = 0x30;
        report[9] = 0x0a;
        report[10] = 0x05;
        ds4.handle_transfer(OUT_EP, Dir::Out, &report);
        assert_eq!(
            rx.try_recv().unwrap(),
            vec![0x40, 0xff, 0x10, 0x20, 0x30, 0x0a, 0x05]
        );
    }

    #[test]
    fn feature_reports_answer_with_probed_sizes() {
        let ds4 = Dualshock4::new(&DeviceOptions::default());
        let get_feature = |id: u8, len: u16| SetupPacket {
            bm_request_type: 0xa1,
            b_request: REQ_GET_REPORT,
            w_value: u16::from_be_bytes([REPORT_TYPE_FEATURE, id]),
            w_index: 0,
            w_length: len,
        };
        let calib = ds4.handle_control(get_feature(0x02, 37), &[]).unwrap();
        assert_eq!(calib.len(), 37);
        assert_eq!(calib[0], 0x02);
        let info = ds4.handle_control(get_feature(0xa3, 49), &[]).unwrap();
        assert_eq!(info.len(), 49);
        let mac = ds4.handle_control(get_feature(0x12, 16), &[]).unwrap();
        assert_eq!(mac.len(), 16);
        assert!(ds4.handle_control(get_feature(0x55, 8), &[]).is_none());
    }

    #[test]
    fn profile_passes_registration_validation() {
        Dualshock4::new(&DeviceOptions::default())
            .profile()
            .validate()
            .unwrap();
    }
}

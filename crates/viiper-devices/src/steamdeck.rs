//! Valve Steam Deck controller.
//!
//! The Deck reports through a vendor HID interface: 64-byte input reports
//! with a fixed `0x01 0x00 0x09 0x40` header and a monotonic sequence
//! counter, and host-to-device commands through SET_REPORT(Feature) on EP0.
//! The only command surfaced to feeders is the haptic pulse (0x8f), reduced
//! to a 4-byte s2c frame `pad:u8 repeat:u8 intensity:u16`.
//!
//! Feeder input frames are 52 bytes in SDL field order, little-endian:
//! `buttons:u64 | lpad x,y:i16 | rpad x,y:i16 | ltrig,rtrig:u16 |
//!  lx,ly,rx,ry:i16 | gyro x,y,z:i16 | accel x,y,z:i16 |
//!  lpad_pressure,rpad_pressure:u16 | quat w,x,y,z:i16`.

use std::io;
use std::sync::{Arc, Mutex};
use tokio::select;

use async_trait::async_trait;
use viiper_usb::hid::{CLASS_HID, PROTOCOL_NONE, REPORT_TYPE_FEATURE, REQ_SET_REPORT};
use viiper_usb::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceProfile, Dir, EndpointDescriptor,
    HidFunction, InterfaceProfile, OutputSink, SetupPacket, StringTable, UsbDeviceModel,
    EP_DIR_IN, EP_XFER_INTERRUPT, SPEED_HIGH,
};

use crate::session::{read_or_eof, FeederReader, FeederSession, FeederWriter};
use crate::{CreatedDevice, DeviceError, DeviceOptions};

pub const VID: u16 = 0x28de;
pub const PID: u16 = 0x1205;

pub const INPUT_FRAME_LEN: usize = 52;
pub const OUTPUT_FRAME_LEN: usize = 4;

const REPORT_LEN: usize = 64;
const CMD_HAPTIC_PULSE: u8 = 0x8f;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeckState {
    pub buttons: u64,
    pub left_pad_x: i16,
    pub left_pad_y: i16,
    pub right_pad_x: i16,
    pub right_pad_y: i16,
    pub left_trigger: u16,
    pub right_trigger: u16,
    pub left_x: i16,
    pub left_y: i16,
    pub right_x: i16,
    pub right_y: i16,
    pub gyro: [i16; 3],
    pub accel: [i16; 3],
    pub left_pad_pressure: u16,
    pub right_pad_pressure: u16,
    pub quat: [i16; 4],
}

impl DeckState {
    pub fn decode(frame: &[u8; INPUT_FRAME_LEN]) -> DeckState {
        let i16_at = |off: usize| i16::from_le_bytes([frame[off], frame[off + 1]]);
        let u16_at = |off: usize| u16::from_le_bytes([frame[off], frame[off + 1]]);
        DeckState {
            buttons: u64::from_le_bytes(frame[0..8].try_into().expect("button bytes")),
            left_pad_x: i16_at(8),
            left_pad_y: i16_at(10),
            right_pad_x: i16_at(12),
            right_pad_y: i16_at(14),
            left_trigger: u16_at(16),
            right_trigger: u16_at(18),
            left_x: i16_at(20),
            left_y: i16_at(22),
            right_x: i16_at(24),
            right_y: i16_at(26),
            gyro: [i16_at(28), i16_at(30), i16_at(32)],
            accel: [i16_at(34), i16_at(36), i16_at(38)],
            left_pad_pressure: u16_at(40),
            right_pad_pressure: u16_at(42),
            quat: [i16_at(44), i16_at(46), i16_at(48), i16_at(50)],
        }
    }

    pub fn encode(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut out = [0u8; INPUT_FRAME_LEN];
        out[0..8].copy_from_slice(&self.buttons.to_le_bytes());
        out[8..10].copy_from_slice(&self.left_pad_x.to_le_bytes());
        out[10..12].copy_from_slice(&self.left_pad_y.to_le_bytes());
        out[12..14].copy_from_slice(&self.right_pad_x.to_le_bytes());
        out[14..16].copy_from_slice(&self.right_pad_y.to_le_bytes());
        out[16..18].copy_from_slice(&self.left_trigger.to_le_bytes());
        out[18..20].copy_from_slice(&self.right_trigger.to_le_bytes());
        out[20..22].copy_from_slice(&self.left_x.to_le_bytes());
        out[22..24].copy_from_slice(&self.left_y.to_le_bytes());
        out[24..26].copy_from_slice(&self.right_x.to_le_bytes());
        out[26..28].copy_from_slice(&self.right_y.to_le_bytes());
        for (i, v) in self.gyro.iter().enumerate() {
            out[28 + i * 2..30 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.accel.iter().enumerate() {
            out[34 + i * 2..36 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        out[40..42].copy_from_slice(&self.left_pad_pressure.to_le_bytes());
        out[42..44].copy_from_slice(&self.right_pad_pressure.to_le_bytes());
        for (i, v) in self.quat.iter().enumerate() {
            out[44 + i * 2..46 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Build the 64-byte input report with the given sequence number.
    fn report(&self, seq: u32) -> Vec<u8> {
        let mut report = vec![0u8; REPORT_LEN];
        report[0] = 0x01;
        report[1] = 0x00;
        report[2] = 0x09;
        report[3] = 0x40;
        report[4..8].copy_from_slice(&seq.to_le_bytes());
        report[8..16].copy_from_slice(&self.buttons.to_le_bytes());
        report[16..18].copy_from_slice(&self.left_pad_x.to_le_bytes());
        report[18..20].copy_from_slice(&self.left_pad_y.to_le_bytes());
        report[20..22].copy_from_slice(&self.right_pad_x.to_le_bytes());
        report[22..24].copy_from_slice(&self.right_pad_y.to_le_bytes());
        for (i, v) in self.accel.iter().enumerate() {
            report[24 + i * 2..26 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.gyro.iter().enumerate() {
            report[30 + i * 2..32 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.quat.iter().enumerate() {
            report[36 + i * 2..38 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        report[44..46].copy_from_slice(&self.left_trigger.to_le_bytes());
        report[46..48].copy_from_slice(&self.right_trigger.to_le_bytes());
        report[48..50].copy_from_slice(&self.left_x.to_le_bytes());
        report[50..52].copy_from_slice(&self.left_y.to_le_bytes());
        report[52..54].copy_from_slice(&self.right_x.to_le_bytes());
        report[54..56].copy_from_slice(&self.right_y.to_le_bytes());
        report[56..58].copy_from_slice(&self.left_pad_pressure.to_le_bytes());
        report[58..60].copy_from_slice(&self.right_pad_pressure.to_le_bytes());
        report
    }
}

pub struct SteamDeck {
    profile: DeviceProfile,
    state: Mutex<DeckState>,
    seq: Mutex<u32>,
    sink: Mutex<Option<OutputSink>>,
}

pub(crate) fn create(options: &DeviceOptions) -> Result<CreatedDevice, DeviceError> {
    let device = Arc::new(SteamDeck::new(options));
    Ok(CreatedDevice {
        model: device.clone(),
        session: device,
    })
}

impl SteamDeck {
    pub fn new(options: &DeviceOptions) -> SteamDeck {
        let (vid, pid) = options.vid_pid(VID, PID);
        SteamDeck {
            profile: profile(vid, pid),
            state: Mutex::new(DeckState::default()),
            seq: Mutex::new(0),
            sink: Mutex::new(None),
        }
    }

    fn set_sink(&self, sink: Option<OutputSink>) {
        *self.sink.lock().expect("sink lock") = sink;
    }

    fn handle_command(&self, payload: &[u8]) {
        // Commands are `id len body…`; only the haptic pulse is feeder
        // visible: pad:u8, duration:u16, interval:u16, count:u16.
        if payload.len() < 9 || payload[0] != CMD_HAPTIC_PULSE {
            return;
        }
        let pad = payload[2];
        let duration = u16::from_le_bytes([payload[3], payload[4]]);
        let count = u16::from_le_bytes([payload[7], payload[8]]);
        let mut frame = vec![pad, count.min(255) as u8];
        frame.extend_from_slice(&duration.to_le_bytes());
        if let Some(sink) = self.sink.lock().expect("sink lock").as_ref() {
            sink.emit(frame);
        }
    }
}

impl UsbDeviceModel for SteamDeck {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn handle_transfer(&self, ep: u8, dir: Dir, _payload: &[u8]) -> Vec<u8> {
        match (ep, dir) {
            (2, Dir::In) => {
                let seq = {
                    let mut s = self.seq.lock().expect("seq lock");
                    *s = s.wrapping_add(1);
                    *s
                };
                self.state.lock().expect("deck state lock").report(seq)
            }
            _ => Vec::new(),
        }
    }

    fn handle_control(&self, setup: SetupPacket, payload: &[u8]) -> Option<Vec<u8>> {
        if setup.bm_request_type == 0x21
            && setup.b_request == REQ_SET_REPORT
            && setup.descriptor_type() == REPORT_TYPE_FEATURE
        {
            self.handle_command(payload);
            return Some(Vec::new());
        }
        None
    }
}

#[async_trait]
impl FeederSession for SteamDeck {
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
                *self.state.lock().expect("deck state lock") = DeckState::decode(&frame);
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

/// Vendor HID interface: one 64-byte input report plus a 64-byte feature
/// report the host sends commands through.
const REPORT_DESCRIPTOR: &[u8] = &[
    0x06, 0xff, 0xff, // Usage Page (Vendor 0xFFFF)
    0x09, 0x01, // Usage (1)
    0xa1, 0x01, // Collection (Application)
    0x09, 0x02, //   Usage (2)
    0x09, 0x03, //   Usage (3)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xff, 0x00, // Logical Maximum (255)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x40, //   Report Count (64)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x09, 0x06, //   Usage (6)
    0x09, 0x07, //   Usage (7)
    0x95, 0x40, //   Report Count (64)
    0xb1, 0x02, //   Feature (Data, Variable, Absolute)
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
            bcd_device: 0x0200,
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 0,
            num_configurations: 1,
        },
        configuration: ConfigurationDescriptor {
            configuration_value: 1,
            i_configuration: 0,
            attributes: 0x80,
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
            endpoints: vec![EndpointDescriptor {
                address: EP_DIR_IN | 2,
                attributes: EP_XFER_INTERRUPT,
                max_packet_size: 64,
                interval: 4,
            }],
        }],
        strings: StringTable::en_us(&["Valve Software", "Steam Deck Controller"]),
        speed: SPEED_HIGH,
    }
}

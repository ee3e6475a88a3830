//! Xbox 360 wired controller (XUSB).
//!
//! The pad is a vendor-specific device: no HID function, one interface of
//! class 0xff/0x5d/0x01 carrying the XUSB class descriptor, an interrupt IN
//! endpoint for 20-byte input reports and an interrupt OUT endpoint for
//! rumble and LED commands. Only rumble is surfaced to the feeder (2-byte
//! s2c frames); LED commands are acknowledged and dropped.

use bitflags::bitflags;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::select;

use async_trait::async_trait;
use viiper_usb::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceProfile, Dir, EndpointDescriptor,
    InterfaceProfile, OutputSink, StringTable, UsbDeviceModel, EP_DIR_IN, EP_XFER_INTERRUPT,
    SPEED_HIGH,
};

use crate::session::{read_or_eof, FeederReader, FeederSession, FeederWriter};
use crate::{CreatedDevice, DeviceError, DeviceOptions};

pub const VID: u16 = 0x045e;
pub const PID: u16 = 0x028e;

/// Feeder input frame: `buttons:u32 lt:u8 rt:u8 lx:i16 ly:i16 rx:i16 ry:i16`.
pub const INPUT_FRAME_LEN: usize = 14;
/// Feeder output frame: `left_motor:u8 right_motor:u8`.
pub const OUTPUT_FRAME_LEN: usize = 2;

const REPORT_LEN: usize = 20;

bitflags! {
    /// XUSB digital button bits as they appear in report bytes 2-3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Buttons: u32 {
        const DPAD_UP = 0x0001;
        const DPAD_DOWN = 0x0002;
        const DPAD_LEFT = 0x0004;
        const DPAD_RIGHT = 0x0008;
        const START = 0x0010;
        const BACK = 0x0020;
        const LEFT_STICK = 0x0040;
        const RIGHT_STICK = 0x0080;
        const LEFT_SHOULDER = 0x0100;
        const RIGHT_SHOULDER = 0x0200;
        const GUIDE = 0x0400;
        const A = 0x1000;
        const B = 0x2000;
        const X = 0x4000;
        const Y = 0x8000;
    }
}

/// Latest feeder-written pad state; the URB loop snapshots it per IN poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PadState {
    pub buttons: u32,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub left_x: i16,
    pub left_y: i16,
    pub right_x: i16,
    pub right_y: i16,
}

impl PadState {
    pub fn decode(frame: &[u8; INPUT_FRAME_LEN]) -> PadState {
        PadState {
            buttons: u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]),
            left_trigger: frame[4],
            right_trigger: frame[5],
            left_x: i16::from_le_bytes([frame[6], frame[7]]),
            left_y: i16::from_le_bytes([frame[8], frame[9]]),
            right_x: i16::from_le_bytes([frame[10], frame[11]]),
            right_y: i16::from_le_bytes([frame[12], frame[13]]),
        }
    }

    pub fn encode(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut out = [0u8; INPUT_FRAME_LEN];
        out[0..4].copy_from_slice(&self.buttons.to_le_bytes());
        out[4] = self.left_trigger;
        out[5] = self.right_trigger;
        out[6..8].copy_from_slice(&self.left_x.to_le_bytes());
        out[8..10].copy_from_slice(&self.left_y.to_le_bytes());
        out[10..12].copy_from_slice(&self.right_x.to_le_bytes());
        out[12..14].copy_from_slice(&self.right_y.to_le_bytes());
        out
    }

    /// Build the 20-byte XUSB input report.
    fn report(&self) -> Vec<u8> {
        let mut report = vec![0u8; REPORT_LEN];
        report[0] = 0x00;
        report[1] = REPORT_LEN as u8;
        report[2..4].copy_from_slice(&((self.buttons & 0xffff) as u16).to_le_bytes());
        report[4] = self.left_trigger;
        report[5] = self.right_trigger;
        report[6..8].copy_from_slice(&self.left_x.to_le_bytes());
        report[8..10].copy_from_slice(&self.left_y.to_le_bytes());
        report[10..12].copy_from_slice(&self.right_x.to_le_bytes());
        report[12..14].copy_from_slice(&self.right_y.to_le_bytes());
        report
    }
}

pub struct Xbox360 {
    profile: DeviceProfile,
    state: Mutex<PadState>,
    sink: Mutex<Option<OutputSink>>,
}

pub(crate) fn create(options: &DeviceOptions) -> Result<CreatedDevice, DeviceError> {
    let device = Arc::new(Xbox360::new(options));
    Ok(CreatedDevice {
        model: device.clone(),
        session: device,
    })
}

impl Xbox360 {
    pub fn new(options: &DeviceOptions) -> Xbox360 {
        let (vid, pid) = options.vid_pid(VID, PID);
        Xbox360 {
            profile: profile(vid, pid),
            state: Mutex::new(PadState::default()),
            sink: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PadState {
        *self.state.lock().expect("pad state lock")
    }

    fn set_sink(&self, sink: Option<OutputSink>) {
        *self.sink.lock().expect("sink lock") = sink;
    }

    fn handle_output(&self, payload: &[u8]) {
        // 00 08 00 <left> <right> 00 00 00 is the rumble command; 01 03 <led>
        // selects the LED ring pattern, which has no feeder-visible effect.
        if payload.len() >= 5 && payload[0] == 0x00 && payload[1] == 0x08 {
            let frame = vec![payload[3], payload[4]];
            if let Some(sink) = self.sink.lock().expect("sink lock").as_ref() {
                sink.emit(frame);
            }
        }
    }
}

impl UsbDeviceModel for Xbox360 {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn handle_transfer(&self, ep: u8, dir: Dir, payload: &[u8]) -> Vec<u8> {
        match (ep, dir) {
            (1, Dir::In) => self.state.lock().expect("pad state lock").report(),
            (1, Dir::Out) => {
                self.handle_output(payload);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl FeederSession for Xbox360 {
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
                *self.state.lock().expect("pad state lock") = PadState::decode(&frame);
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

fn profile(vid: u16, pid: u16) -> DeviceProfile {
    DeviceProfile {
        device: DeviceDescriptor {
            bcd_usb: 0x0200,
            device_class: 0xff,
            device_subclass: 0xff,
            device_protocol: 0xff,
            max_packet_size0: 8,
            id_vendor: vid,
            id_product: pid,
            bcd_device: 0x0114,
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 0,
            num_configurations: 1,
        },
        configuration: ConfigurationDescriptor {
            configuration_value: 1,
            i_configuration: 0,
            attributes: 0xa0,
            max_power: 250,
        },
        interfaces: vec![InterfaceProfile {
            class: 0xff,
            subclass: 0x5d,
            protocol: 0x01,
            i_interface: 0,
            hid: None,
            // XUSB interface descriptor the official driver expects.
            class_specific: vec![vec![
                0x11, 0x21, 0x00, 0x01, 0x01, 0x25, 0x81, 0x14, 0x00, 0x00, 0x00, 0x00, 0x13,
                0x01, 0x08, 0x00, 0x00,
            ]],
            endpoints: vec![
                EndpointDescriptor {
                    address: EP_DIR_IN | 1,
                    attributes: EP_XFER_INTERRUPT,
                    max_packet_size: 32,
                    interval: 4,
                },
                EndpointDescriptor {
                    address: 1,
                    attributes: EP_XFER_INTERRUPT,
                    max_packet_size: 32,
                    interval: 8,
                },
            ],
        }],
        strings: StringTable::en_us(&["VIIPER", "Xbox 360 Controller"]),
        speed: SPEED_HIGH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_encodes_scenario_fields_little_endian() {
        let pad = Xbox360::new(&DeviceOptions::default());
        *pad.state.lock().unwrap() = PadState {
            buttons: Buttons::A.bits(),
            left_x: 20000,
            left_y: 20000,
            ..PadState::default()
        };
        let report = pad.handle_transfer(1, Dir::In, &[]);
        assert_eq!(report.len(), 20);
        assert_eq!(report[0], 0x00);
        assert_eq!(report[1], 0x14);
        assert_eq!(u16::from_le_bytes([report[2], report[3]]), 0x1000);
        assert_eq!(i16::from_le_bytes([report[6], report[7]]), 20000);
        assert_eq!(i16::from_le_bytes([report[8], report[9]]), 20000);
    }

    #[test]
    fn input_frame_roundtrip() {
        let state = PadState {
            buttons: 0x0001_1234,
            left_trigger: 9,
            right_trigger: 0xff,
            left_x: -32768,
            left_y: 32767,
            right_x: -1,
            right_y: 1,
        };
        assert_eq!(PadState::decode(&state.encode()), state);
    }

    #[test]
    fn rumble_command_reaches_the_sink_as_two_bytes() {
        let pad = Xbox360::new(&DeviceOptions::default());
        let (sink, mut rx) = OutputSink::channel();
        pad.set_sink(Some(sink));
        pad.handle_transfer(
            1,
            Dir::Out,
            &[0x00, 0x08, 0x00, 0xec, 0x41, 0x00, 0x00, 0x00],
        );
        assert_eq!(rx.try_recv().unwrap(), vec![0xec, 0x41]);
    }

    #[test]
    fn led_command_is_swallowed() {
        let pad = Xbox360::new(&DeviceOptions::default());
        let (sink, mut rx) = OutputSink::channel();
        pad.set_sink(Some(sink));
        pad.handle_transfer(1, Dir::Out, &[0x01, 0x03, 0x06]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn vid_pid_overrides_apply() {
        let options = DeviceOptions {
            id_vendor: Some(0x1234),
            id_product: Some(0xabcd),
            ..DeviceOptions::default()
        };
        let pad = Xbox360::new(&options);
        assert_eq!(pad.profile().device.id_vendor, 0x1234);
        assert_eq!(pad.profile().device.id_product, 0xabcd);
    }

    #[test]
    fn profile_passes_registration_validation() {
        let pad = Xbox360::new(&DeviceOptions::default());
        pad.profile().validate().unwrap();
    }
}

//! HID boot keyboard.
//!
//! Input reports are the classic 8-byte boot layout (modifiers, reserved,
//! six usage codes). LED state arrives from the host as a SET_REPORT(Output)
//! on EP0; the five defined LED usages are masked and forwarded to the feeder
//! as a 1-byte frame. Feeder input frames are variable length:
//! `modifiers:u8 count:u8 keys[count]`, truncated to the six slots a boot
//! report can carry.

use std::io;
use std::sync::{Arc, Mutex};
use tokio::select;

use async_trait::async_trait;
use viiper_usb::hid::{
    CLASS_HID, PROTOCOL_KEYBOARD, REPORT_TYPE_INPUT, REPORT_TYPE_OUTPUT, REQ_GET_IDLE,
    REQ_GET_PROTOCOL, REQ_GET_REPORT, REQ_SET_IDLE, REQ_SET_PROTOCOL, REQ_SET_REPORT,
    SUBCLASS_BOOT,
};
use viiper_usb::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceProfile, Dir, EndpointDescriptor,
    HidFunction, InterfaceProfile, OutputSink, SetupPacket, StringTable, UsbDeviceModel,
    EP_DIR_IN, EP_XFER_INTERRUPT, SPEED_FULL,
};

use crate::session::{read_or_eof, FeederReader, FeederSession, FeederWriter};
use crate::{CreatedDevice, DeviceError, DeviceOptions};

pub const VID: u16 = 0x1209;
pub const PID: u16 = 0x9001;

pub const LED_NUM_LOCK: u8 = 1 << 0;
pub const LED_CAPS_LOCK: u8 = 1 << 1;
pub const LED_SCROLL_LOCK: u8 = 1 << 2;
pub const LED_COMPOSE: u8 = 1 << 3;
pub const LED_KANA: u8 = 1 << 4;
pub const LED_MASK: u8 =
    LED_NUM_LOCK | LED_CAPS_LOCK | LED_SCROLL_LOCK | LED_COMPOSE | LED_KANA;

const REPORT_LEN: usize = 8;
const MAX_KEYS: usize = 6;

/// Standard boot keyboard report descriptor, LED output report included.
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xa1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0xe0, //   Usage Minimum (Left Control)
    0x29, 0xe7, //   Usage Maximum (Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute) - modifiers
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant) - reserved byte
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (Num Lock)
    0x29, 0x05, //   Usage Maximum (Kana)
    0x91, 0x02, //   Output (Data, Variable, Absolute) - LEDs
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant) - LED padding
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x81, 0x00, //   Input (Data, Array) - key slots
    0xc0, // End Collection
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyboardState {
    pub modifiers: u8,
    pub keys: [u8; MAX_KEYS],
}

impl KeyboardState {
    fn report(&self) -> Vec<u8> {
        let mut report = vec![0u8; REPORT_LEN];
        report[0] = self.modifiers;
        report[2..].copy_from_slice(&self.keys);
        report
    }
}

#[derive(Default)]
struct HidControlState {
    leds: u8,
    idle_rate: u8,
    protocol: u8,
}

pub struct Keyboard {
    profile: DeviceProfile,
    state: Mutex<KeyboardState>,
    control: Mutex<HidControlState>,
    sink: Mutex<Option<OutputSink>>,
}

pub(crate) fn create(options: &DeviceOptions) -> Result<CreatedDevice, DeviceError> {
    let device = Arc::new(Keyboard::new(options));
    Ok(CreatedDevice {
        model: device.clone(),
        session: device,
    })
}

impl Keyboard {
    pub fn new(options: &DeviceOptions) -> Keyboard {
        let (vid, pid) = options.vid_pid(VID, PID);
        Keyboard {
            profile: profile(vid, pid),
            state: Mutex::new(KeyboardState::default()),
            control: Mutex::new(HidControlState {
                leds: 0,
                idle_rate: 0,
                protocol: 1,
            }),
            sink: Mutex::new(None),
        }
    }

    pub fn leds(&self) -> u8 {
        self.control.lock().expect("control lock").leds
    }

    fn set_sink(&self, sink: Option<OutputSink>) {
        *self.sink.lock().expect("sink lock") = sink;
    }

    fn apply_input(&self, modifiers: u8, pressed: &[u8]) {
        let mut keys = [0u8; MAX_KEYS];
        for (slot, key) in keys.iter_mut().zip(pressed.iter()) {
            *slot = *key;
        }
        *self.state.lock().expect("keyboard state lock") = KeyboardState { modifiers, keys };
    }

    fn set_leds(&self, raw: u8) {
        let leds = raw & LED_MASK;
        self.control.lock().expect("control lock").leds = leds;
        if let Some(sink) = self.sink.lock().expect("sink lock").as_ref() {
            sink.emit(vec![leds]);
        }
    }
}

impl UsbDeviceModel for Keyboard {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn handle_transfer(&self, ep: u8, dir: Dir, _payload: &[u8]) -> Vec<u8> {
        match (ep, dir) {
            (1, Dir::In) => self.state.lock().expect("keyboard state lock").report(),
            _ => Vec::new(),
        }
    }

    fn handle_control(&self, setup: SetupPacket, payload: &[u8]) -> Option<Vec<u8>> {
        match (setup.bm_request_type, setup.b_request) {
            (0x21, REQ_SET_REPORT) => {
                if setup.descriptor_type() == REPORT_TYPE_OUTPUT && !payload.is_empty() {
                    self.set_leds(payload[0]);
                }
                Some(Vec::new())
            }
            (0xa1, REQ_GET_REPORT) => {
                if setup.descriptor_type() == REPORT_TYPE_INPUT {
                    Some(self.state.lock().expect("keyboard state lock").report())
                } else {
                    Some(vec![self.leds()])
                }
            }
            (0x21, REQ_SET_IDLE) => {
                self.control.lock().expect("control lock").idle_rate =
                    (setup.w_value >> 8) as u8;
                Some(Vec::new())
            }
            (0xa1, REQ_GET_IDLE) => {
                Some(vec![self.control.lock().expect("control lock").idle_rate])
            }
            (0x21, REQ_SET_PROTOCOL) => {
                self.control.lock().expect("control lock").protocol = setup.w_value as u8;
                Some(Vec::new())
            }
            (0xa1, REQ_GET_PROTOCOL) => {
                Some(vec![self.control.lock().expect("control lock").protocol])
            }
            _ => None,
        }
    }
}

#[async_trait]
impl FeederSession for Keyboard {
    async fn run(
        &self,
        reader: &mut (dyn FeederReader + '_),
        writer: &mut (dyn FeederWriter + '_),
    ) -> io::Result<()> {
        let (sink, mut events) = OutputSink::channel();
        self.set_sink(Some(sink));

        let input = async {
            loop {
                let mut head = [0u8; 2];
                if read_or_eof(reader, &mut head).await?.is_none() {
                    return Ok(());
                }
                let count = head[1] as usize;
                let mut keys = vec![0u8; count];
                if count > 0 && read_or_eof(reader, &mut keys).await?.is_none() {
                    return Ok(());
                }
                keys.truncate(MAX_KEYS);
                self.apply_input(head[0], &keys);
            }
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
            subclass: SUBCLASS_BOOT,
            protocol: PROTOCOL_KEYBOARD,
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
                max_packet_size: 8,
                interval: 10,
            }],
        }],
        strings: StringTable::en_us(&["VIIPER", "Keyboard"]),
        speed: SPEED_FULL,
    }
}

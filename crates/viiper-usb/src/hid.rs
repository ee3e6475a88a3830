//! HID class constants shared by the built-in devices and the engine's
//! interface-targeted GET_DESCRIPTOR path.

/// Interface class for HID functions.
pub const CLASS_HID: u8 = 0x03;
/// Boot-interface subclass.
pub const SUBCLASS_BOOT: u8 = 0x01;
pub const PROTOCOL_NONE: u8 = 0x00;
pub const PROTOCOL_KEYBOARD: u8 = 0x01;
pub const PROTOCOL_MOUSE: u8 = 0x02;

/// Interface-targeted descriptor types.
pub const DT_HID: u8 = 0x21;
pub const DT_REPORT: u8 = 0x22;

/// Class-specific requests (bmRequestType 0x21/0xA1).
pub const REQ_GET_REPORT: u8 = 0x01;
pub const REQ_GET_IDLE: u8 = 0x02;
pub const REQ_GET_PROTOCOL: u8 = 0x03;
pub const REQ_SET_REPORT: u8 = 0x09;
pub const REQ_SET_IDLE: u8 = 0x0a;
pub const REQ_SET_PROTOCOL: u8 = 0x0b;

/// Report types (high byte of wValue in GET_REPORT / SET_REPORT).
pub const REPORT_TYPE_INPUT: u8 = 1;
pub const REPORT_TYPE_OUTPUT: u8 = 2;
pub const REPORT_TYPE_FEATURE: u8 = 3;

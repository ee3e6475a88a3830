//! One-shot control-plane requests.
//!
//! Handlers are pure request → JSON value (or problem) functions; the
//! connection pipeline in `control` owns all socket writes.

use serde::Deserialize;
use serde_json::json;

use crate::problem::Problem;
use crate::router::{Params, Router};
use crate::ServerState;
use viiper_bus::DeviceHandle;
use viiper_devices::{DeviceOptions, HexU16};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OneShot {
    Ping,
    BusCreate,
    BusRemove,
    BusList,
    DeviceAdd,
    DeviceRemove,
    DeviceList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    DeviceStream,
}

pub(crate) fn routers() -> (Router<OneShot>, Router<StreamKind>) {
    let mut one_shot = Router::new();
    one_shot.add("ping", OneShot::Ping);
    one_shot.add("bus/create", OneShot::BusCreate);
    one_shot.add("bus/remove", OneShot::BusRemove);
    one_shot.add("bus/list", OneShot::BusList);
    one_shot.add("bus/{id}/add", OneShot::DeviceAdd);
    one_shot.add("bus/{id}/remove", OneShot::DeviceRemove);
    one_shot.add("bus/{id}/list", OneShot::DeviceList);

    let mut streams = Router::new();
    streams.add("bus/{busid}/{deviceid}", StreamKind::DeviceStream);

    (one_shot, streams)
}

/// Strict add-device body; unknown fields are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddDeviceBody {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(rename = "idVendor")]
    id_vendor: Option<HexU16>,
    #[serde(rename = "idProduct")]
    id_product: Option<HexU16>,
    #[serde(rename = "deviceSpecific")]
    device_specific: Option<serde_json::Map<String, serde_json::Value>>,
}

pub(crate) fn dispatch(
    route: OneShot,
    params: &Params,
    payload: Option<&[u8]>,
    state: &ServerState,
) -> Result<serde_json::Value, Problem> {
    match route {
        OneShot::Ping => Ok(json!({
            "server": "viiper",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        OneShot::BusCreate => {
            let id = match payload_str(payload)? {
                Some(text) => Some(parse_decimal(text, "busId")?),
                None => None,
            };
            let bus = state.buses.create_bus(id)?;
            Ok(json!({ "busId": bus.id() }))
        }
        OneShot::BusRemove => {
            let id = parse_decimal(require_payload(payload)?, "busId")?;
            state.buses.remove_bus(id)?;
            Ok(json!({ "busId": id }))
        }
        OneShot::BusList => Ok(json!({ "buses": state.buses.list() })),
        OneShot::DeviceAdd => {
            let bus_id = param_decimal(params, "id")?;
            let bus = state
                .buses
                .bus(bus_id)
                .ok_or_else(|| Problem::not_found(format!("bus {bus_id} does not exist")))?;

            let body: AddDeviceBody = serde_json::from_slice(require_payload_bytes(payload)?)
                .map_err(|e| Problem::bad_request(format!("invalid device body: {e}")))?;
            let options = DeviceOptions {
                id_vendor: body.id_vendor.map(|v| v.0),
                id_product: body.id_product.map(|v| v.0),
                device_specific: body.device_specific.unwrap_or_default(),
            };

            let created = state.devices.create(&body.type_name, &options)?;
            let handle = bus.add(&body.type_name, created)?;

            if let Some(hook) = &state.attach_hook {
                hook(&handle.export);
            }
            Ok(device_json(&handle))
        }
        OneShot::DeviceRemove => {
            let bus_id = param_decimal(params, "id")?;
            let bus = state
                .buses
                .bus(bus_id)
                .ok_or_else(|| Problem::not_found(format!("bus {bus_id} does not exist")))?;
            let dev_id = parse_decimal(require_payload(payload)?, "devId")?;
            bus.remove_by_id(dev_id)?;
            Ok(json!({ "busId": bus_id, "devId": dev_id.to_string() }))
        }
        OneShot::DeviceList => {
            let bus_id = param_decimal(params, "id")?;
            let bus = state
                .buses
                .bus(bus_id)
                .ok_or_else(|| Problem::not_found(format!("bus {bus_id} does not exist")))?;
            let devices: Vec<serde_json::Value> =
                bus.devices().iter().map(device_json).collect();
            Ok(json!({ "devices": devices }))
        }
    }
}

fn device_json(handle: &DeviceHandle) -> serde_json::Value {
    let device = &handle.device.model.profile().device;
    json!({
        "busId": handle.export.bus_id,
        "devId": handle.export.dev_id.to_string(),
        "vid": format!("0x{:04x}", device.id_vendor),
        "pid": format!("0x{:04x}", device.id_product),
        "type": handle.type_name,
    })
}

fn payload_str(payload: Option<&[u8]>) -> Result<Option<&str>, Problem> {
    match payload {
        None => Ok(None),
        Some(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| Problem::bad_request("payload is not valid UTF-8"))?
                .trim();
            Ok(if text.is_empty() { None } else { Some(text) })
        }
    }
}

fn require_payload(payload: Option<&[u8]>) -> Result<&str, Problem> {
    payload_str(payload)?.ok_or_else(|| Problem::bad_request("request requires a payload"))
}

fn require_payload_bytes(payload: Option<&[u8]>) -> Result<&[u8], Problem> {
    match payload {
        Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => Ok(bytes),
        _ => Err(Problem::bad_request("request requires a JSON payload")),
    }
}

fn parse_decimal(text: &str, what: &str) -> Result<u32, Problem> {
    text.parse()
        .map_err(|_| Problem::bad_request(format!("{what} must be a decimal integer")))
}

pub(crate) fn param_decimal(params: &Params, name: &str) -> Result<u32, Problem> {
    let raw = params
        .get(name)
        .ok_or_else(|| Problem::internal(format!("route parameter {name} missing")))?;
    raw.parse()
        .map_err(|_| Problem::bad_request(format!("{name} must be a decimal integer")))
}

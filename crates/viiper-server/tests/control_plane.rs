//! Control-plane request/response behavior: routing, problem responses,
//! strict bodies, and the bus/device management surface.

mod util;

use std::sync::{Arc, Mutex};

use util::{control_json, control_raw, open_stream, start, test_config};
use viiper_devices::DeviceRegistry;
use viiper_server::{AttachHook, Server};

use tokio::io::AsyncReadExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_reports_server_and_version() {
    let server = start(test_config()).await;
    let pong = control_json(server.control_addr(), "ping").await;
    assert_eq!(pong["server"], "viiper");
    assert_eq!(pong["version"], env!("CARGO_PKG_VERSION"));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paths_match_case_insensitively() {
    let server = start(test_config()).await;
    let pong = control_json(server.control_addr(), "PiNg").await;
    assert_eq!(pong["server"], "viiper");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bus_lifecycle_over_the_wire() {
    let server = start(test_config()).await;
    let control = server.control_addr();

    // Auto-picked ids go 1, 2; explicit 5 then auto picks 3.
    assert_eq!(control_json(control, "bus/create").await["busId"], 1);
    assert_eq!(control_json(control, "bus/create").await["busId"], 2);
    assert_eq!(control_json(control, "bus/create 5").await["busId"], 5);
    assert_eq!(control_json(control, "bus/create").await["busId"], 3);
    assert_eq!(
        control_json(control, "bus/list").await["buses"],
        serde_json::json!([1, 2, 3, 5])
    );

    assert_eq!(control_json(control, "bus/remove 2").await["busId"], 2);
    assert_eq!(
        control_json(control, "bus/list").await["buses"],
        serde_json::json!([1, 3, 5])
    );

    // Recreating a taken id conflicts.
    let conflict = control_json(control, "bus/create 5").await;
    assert_eq!(conflict["status"], 409);
    assert_eq!(conflict["title"], "Conflict");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_add_list_remove_roundtrip() {
    let server = start(test_config()).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;

    let added = control_json(
        control,
        "bus/1/add {\"type\": \"dualshock4\", \"idProduct\": \"0x09cc\"}",
    )
    .await;
    assert_eq!(added["busId"], 1);
    assert_eq!(added["devId"], "1");
    assert_eq!(added["vid"], "0x054c");
    assert_eq!(added["pid"], "0x09cc");
    assert_eq!(added["type"], "dualshock4");

    let listed = control_json(control, "bus/1/list").await;
    assert_eq!(listed["devices"].as_array().unwrap().len(), 1);
    assert_eq!(listed["devices"][0]["devId"], "1");
    assert_eq!(listed["devices"][0]["type"], "dualshock4");

    let removed = control_json(control, "bus/1/remove 1").await;
    assert_eq!(removed["busId"], 1);
    assert_eq!(removed["devId"], "1");
    assert_eq!(
        control_json(control, "bus/1/list").await["devices"],
        serde_json::json!([])
    );

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dev_ids_recycle_through_the_api() {
    let server = start(test_config()).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;

    assert_eq!(
        control_json(control, "bus/1/add {\"type\": \"mouse\"}").await["devId"],
        "1"
    );
    assert_eq!(
        control_json(control, "bus/1/add {\"type\": \"mouse\"}").await["devId"],
        "2"
    );
    control_json(control, "bus/1/remove 1").await;
    assert_eq!(
        control_json(control, "bus/1/add {\"type\": \"mouse\"}").await["devId"],
        "1"
    );

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn problems_cover_the_error_taxonomy() {
    let server = start(test_config()).await;
    let control = server.control_addr();

    // Unknown route.
    let problem = control_json(control, "bogus/route").await;
    assert_eq!(problem["status"], 404);

    // Unknown bus.
    let problem = control_json(control, "bus/9/list").await;
    assert_eq!(problem["status"], 404);
    assert_eq!(problem["title"], "Not Found");

    // Missing payload.
    let problem = control_json(control, "bus/remove").await;
    assert_eq!(problem["status"], 400);

    // Bad decimal payload.
    let problem = control_json(control, "bus/create x7").await;
    assert_eq!(problem["status"], 400);

    control_json(control, "bus/create 1").await;

    // Unknown device type.
    let problem = control_json(control, "bus/1/add {\"type\": \"gamecube\"}").await;
    assert_eq!(problem["status"], 400);

    // Unknown fields in strict bodies.
    let problem =
        control_json(control, "bus/1/add {\"type\": \"mouse\", \"color\": \"red\"}").await;
    assert_eq!(problem["status"], 400);

    // Out-of-range vendor id.
    let problem =
        control_json(control, "bus/1/add {\"type\": \"mouse\", \"idVendor\": 65536}").await;
    assert_eq!(problem["status"], 400);

    // Removing a device that does not exist.
    let problem = control_json(control, "bus/1/remove 3").await;
    assert_eq!(problem["status"], 404);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn payload_may_contain_newlines() {
    let server = start(test_config()).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;

    let added = control_json(control, "bus/1/add {\n  \"type\": \"keyboard\"\n}").await;
    assert_eq!(added["type"], "keyboard");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_requests_are_refused() {
    let server = start(test_config()).await;
    let mut request = b"bus/1/add ".to_vec();
    request.resize(70 * 1024, b'x');
    let response = control_raw(server.control_addr(), &request).await;
    let value: serde_json::Value =
        serde_json::from_slice(response.strip_suffix(b"\n").unwrap()).unwrap();
    assert_eq!(value["status"], 400);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attach_hook_fires_after_every_device_add() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let hook: AttachHook = Arc::new(move |meta| {
        sink.lock().unwrap().push(meta.usb_bus_id.clone());
    });

    let server = Server::start_with(
        test_config(),
        Arc::new(DeviceRegistry::with_builtins()),
        Some(hook),
    )
    .await
    .expect("start server");
    let control = server.control_addr();

    control_json(control, "bus/create 1").await;
    control_json(control, "bus/1/add {\"type\": \"xbox360\"}").await;
    control_json(control, "bus/1/add {\"type\": \"mouse\"}").await;

    assert_eq!(*seen.lock().unwrap(), vec!["1-1".to_owned(), "1-2".to_owned()]);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_feeder_stream_conflicts_cleanly() {
    let server = start(test_config()).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;
    control_json(control, "bus/1/add {\"type\": \"xbox360\"}").await;

    let _first = open_stream(control, "bus/1/1").await;
    // Give the first stream time to claim the slot.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut second = open_stream(control, "bus/1/1").await;
    let mut response = Vec::new();
    second.read_to_end(&mut response).await.unwrap();
    let value: serde_json::Value =
        serde_json::from_slice(response.strip_suffix(b"\n").unwrap()).unwrap();
    assert_eq!(value["status"], 409);
    assert_eq!(value["title"], "Conflict");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_for_a_missing_device_is_not_found() {
    let server = start(test_config()).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;

    let mut stream = open_stream(control, "bus/1/9").await;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let value: serde_json::Value =
        serde_json::from_slice(response.strip_suffix(b"\n").unwrap()).unwrap();
    assert_eq!(value["status"], 404);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_device_closes_its_feeder_stream() {
    let server = start(test_config()).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;
    control_json(control, "bus/1/add {\"type\": \"xbox360\"}").await;

    let mut feeder = open_stream(control, "bus/1/1").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    control_json(control, "bus/1/remove 1").await;

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(std::time::Duration::from_secs(5), feeder.read(&mut buf))
        .await
        .expect("feeder close within deadline")
        .unwrap();
    assert_eq!(n, 0, "feeder socket should reach EOF after removal");

    server.shutdown().await;
}

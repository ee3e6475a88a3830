//! Idle-timeout reclamation through the public API.

mod util;

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use util::{control_json, eventually, open_stream, start, test_config};
use viiper_server::ServerConfig;

fn reaping_config(idle_ms: u64, cleanup_ms: u64) -> ServerConfig {
    ServerConfig {
        device_handler_connect_timeout: Duration::from_millis(idle_ms),
        bus_cleanup_timeout: Duration::from_millis(cleanup_ms),
        ..test_config()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_without_a_feeder_is_reaped() {
    let server = start(reaping_config(200, 60_000)).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;
    control_json(control, "bus/1/add {\"type\": \"xbox360\"}").await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    eventually("device list to empty after the idle window", move || async move {
        control_json(control, "bus/1/list").await["devices"] == serde_json::json!([])
    })
    .await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connected_feeder_holds_the_device_and_disconnect_restarts_the_clock() {
    let server = start(reaping_config(300, 60_000)).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;
    control_json(control, "bus/1/add {\"type\": \"xbox360\"}").await;

    let mut feeder = open_stream(control, "bus/1/1").await;
    feeder.write_all(&[0u8; 14]).await.unwrap();

    // Well past the idle window with the feeder attached: still there.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let listed = control_json(control, "bus/1/list").await;
    assert_eq!(listed["devices"].as_array().unwrap().len(), 1);

    // Disconnect; the clock restarts and eventually reaps.
    drop(feeder);
    eventually("device to be reaped after feeder disconnect", move || async move {
        control_json(control, "bus/1/list").await["devices"] == serde_json::json!([])
    })
    .await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feeder_reconnect_before_expiry_keeps_the_device() {
    let server = start(reaping_config(400, 60_000)).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;
    control_json(control, "bus/1/add {\"type\": \"keyboard\"}").await;

    let feeder = open_stream(control, "bus/1/1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(feeder);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut feeder = open_stream(control, "bus/1/1").await;
    feeder.write_all(&[0x00, 0x00]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let listed = control_json(control, "bus/1/list").await;
    assert_eq!(
        listed["devices"].as_array().unwrap().len(),
        1,
        "reconnected feeder must keep the device alive"
    );

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_bus_is_removed_after_its_grace_period() {
    let server = start(reaping_config(60_000, 200)).await;
    let control = server.control_addr();
    control_json(control, "bus/create 1").await;
    control_json(control, "bus/1/add {\"type\": \"mouse\"}").await;
    control_json(control, "bus/1/remove 1").await;

    eventually("bus to be reclaimed once empty", move || async move {
        control_json(control, "bus/list").await["buses"] == serde_json::json!([])
    })
    .await;

    server.shutdown().await;
}

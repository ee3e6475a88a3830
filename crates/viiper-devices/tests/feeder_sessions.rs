//! End-to-end pumps of the per-device feeder sessions over an in-memory
//! duplex stream: input frames land in the device snapshot, device output
//! events come back as s2c frames, and EOF detaches cleanly.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use viiper_devices::{DeviceOptions, FeederSession, IoFeederReader, IoFeederWriter, Keyboard, Xbox360};
use viiper_usb::{Dir, SetupPacket, UsbDeviceModel};

async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test timed out")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn xbox360_session_applies_input_and_forwards_rumble() {
    let pad = Arc::new(Xbox360::new(&DeviceOptions::default()));
    let (mut feeder, device_side) = tokio::io::duplex(1024);
    let (read_half, write_half) = tokio::io::split(device_side);
    let (mut read_half, mut write_half) = (IoFeederReader(read_half), IoFeederWriter(write_half));

    let session = pad.clone();
    let task = tokio::spawn(async move {
        session.run(&mut read_half, &mut write_half).await
    });

    // buttons=A, lx=ly=20000.
    let mut frame = [0u8; 14];
    frame[0..4].copy_from_slice(&0x1000u32.to_le_bytes());
    frame[6..8].copy_from_slice(&20000i16.to_le_bytes());
    frame[8..10].copy_from_slice(&20000i16.to_le_bytes());
    feeder.write_all(&frame).await.unwrap();

    with_timeout(async {
        loop {
            if pad.state().buttons == 0x1000 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    // Host writes a rumble command; the feeder sees the 2-byte frame.
    pad.handle_transfer(1, Dir::Out, &[0x00, 0x08, 0x00, 0xec, 0x41, 0x00, 0x00, 0x00]);
    let mut rumble = [0u8; 2];
    with_timeout(feeder.read_exact(&mut rumble)).await.unwrap();
    assert_eq!(rumble, [0xec, 0x41]);

    // Closing the feeder ends the session cleanly.
    drop(feeder);
    with_timeout(task).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keyboard_session_reads_variable_frames_and_sends_leds() {
    let kb = Arc::new(Keyboard::new(&DeviceOptions::default()));
    let (mut feeder, device_side) = tokio::io::duplex(1024);
    let (read_half, write_half) = tokio::io::split(device_side);
    let (mut read_half, mut write_half) = (IoFeederReader(read_half), IoFeederWriter(write_half));

    let session = kb.clone();
    let task = tokio::spawn(async move {
        session.run(&mut read_half, &mut write_half).await
    });

    // modifiers=shift, two keys.
    feeder.write_all(&[0x02, 0x02, 0x04, 0x05]).await.unwrap();
    with_timeout(async {
        loop {
            let report = kb.handle_transfer(1, Dir::In, &[]);
            if report[0] == 0x02 && report[2] == 0x04 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    // Host sets the LED output report; the feeder receives one byte.
    let setup = SetupPacket {
        bm_request_type: 0x21,
        b_request: 0x09,
        w_value: 0x0200,
        w_index: 0,
        w_length: 1,
    };
    kb.handle_control(setup, &[0x03]).unwrap();
    let mut led = [0u8; 1];
    with_timeout(feeder.read_exact(&mut led)).await.unwrap();
    assert_eq!(led[0], 0x03);

    drop(feeder);
    with_timeout(task).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_survives_a_burst_of_frames() {
    let pad = Arc::new(Xbox360::new(&DeviceOptions::default()));
    let (mut feeder, device_side) = tokio::io::duplex(64);
    let (read_half, write_half) = tokio::io::split(device_side);
    let (mut read_half, mut write_half) = (IoFeederReader(read_half), IoFeederWriter(write_half));

    let session = pad.clone();
    let task = tokio::spawn(async move {
        session.run(&mut read_half, &mut write_half).await
    });

    for i in 0..200u32 {
        let mut frame = [0u8; 14];
        frame[0..4].copy_from_slice(&i.to_le_bytes());
        feeder.write_all(&frame).await.unwrap();
    }
    with_timeout(async {
        loop {
            if pad.state().buttons == 199 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    drop(feeder);
    with_timeout(task).await.unwrap().unwrap();
}

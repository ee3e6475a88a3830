//! The device-model contract between the USB/IP engine, the bus registry and
//! the feeder stream sessions.

use tokio::sync::mpsc;

use crate::{DeviceProfile, Dir, SetupPacket};

/// An emulated USB device.
///
/// A model is shared between the URB loop, a feeder stream and (for some
/// devices) timers, so implementations keep their input snapshot behind a
/// single internal mutex and must never block in these methods. Device-to-host
/// events go out through an [`OutputSink`] with non-blocking sends.
pub trait UsbDeviceModel: Send + Sync {
    /// The static descriptor tree the device enumerates with.
    fn profile(&self) -> &DeviceProfile;

    /// Service one URB on a non-zero endpoint.
    ///
    /// For `Dir::In`, the returned bytes are the next report for `ep`; an
    /// empty vector means "no data available" and the engine will not respond
    /// to the URB. For `Dir::Out`, `payload` is consumed and the return value
    /// is ignored.
    fn handle_transfer(&self, ep: u8, dir: Dir, payload: &[u8]) -> Vec<u8>;

    /// Service a class- or vendor-specific EP0 request.
    ///
    /// `None` hands the request back to the engine's standard handler, which
    /// stalls it. `Some(bytes)` completes the request; for OUT requests the
    /// response is empty.
    fn handle_control(&self, setup: SetupPacket, payload: &[u8]) -> Option<Vec<u8>> {
        let _ = (setup, payload);
        None
    }
}

/// Receiver half handed to the feeder stream session.
pub type OutputReceiver = mpsc::Receiver<Vec<u8>>;

/// Bounded, non-blocking path for device-to-feeder frames (rumble, LEDs,
/// haptics). When no feeder is attached, or the feeder is too slow and the
/// queue is full, frames are dropped rather than stalling the URB loop.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl OutputSink {
    /// Queue capacity used by every built-in device.
    pub const CAPACITY: usize = 32;

    pub fn channel() -> (OutputSink, OutputReceiver) {
        let (tx, rx) = mpsc::channel(Self::CAPACITY);
        (OutputSink { tx }, rx)
    }

    /// Best-effort delivery; drops the frame when the queue is full or the
    /// feeder went away.
    pub fn emit(&self, frame: Vec<u8>) {
        let _ = self.tx.try_send(frame);
    }
}

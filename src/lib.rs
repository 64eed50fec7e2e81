//! UVC camera to HTTP MJPEG streamer.
//!
//! Frames captured from a V4L2 (UVC) camera are served, unmodified and
//! without copying, to any number of HTTP clients as a
//! `multipart/x-mixed-replace` stream.
//!
//! # Architecture
//!
//! Everything runs on one thread with non-blocking I/O:
//!
//! 1. `capture::FrameSource` dequeues a filled buffer from the device and
//!    lends it out as a `FrameHandle`.
//! 2. `fanout::FrameFanoutQueue` wraps it in a multipart envelope and counts
//!    the clients currently sending it.
//! 3. `server::StreamServer` accepts clients and pushes envelope bytes to each
//!    one at its own pace.
//! 4. Frames no client needs any more go back to the device.
//!
//! `streamer::Streamer` drives the four steps and rebuilds the capture side
//! when the camera disappears.
//!
//! # Module Structure
//!
//! - `capture`: device seam, buffer pool, frame source, V4L2 and `stub://` backends
//! - `mjpeg`: wire format
//! - `fanout`: frame queue with per-frame viewer counts
//! - `poll`: readiness multiplexing
//! - `server`: client connections and the send state machine
//! - `streamer`: the driving loop and capture statistics
//! - `config`: layered configuration

pub mod capture;
pub mod config;
pub mod fanout;
pub mod mjpeg;
pub mod poll;
pub mod server;
pub mod streamer;

pub use capture::{
    CaptureConfig, CaptureDevice, CaptureFormat, DeviceBufferPool, DeviceTuner, FrameHandle,
    FrameSource, FrameStore, FrameTimestamp,
};
pub use config::StreamerConfig;
pub use fanout::{FrameFanoutQueue, FrameLease, QueueRejected};
pub use server::{ServerConfig, StreamServer};
pub use streamer::{LoopConfig, Streamer};

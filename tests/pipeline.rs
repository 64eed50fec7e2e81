use std::cell::Cell;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::bail;
use uvc_streamer::capture::{
    CaptureConfig, CaptureDevice, Faults, FrameSource, SyntheticConfig, SyntheticDevice,
};
use uvc_streamer::mjpeg::STREAM_HEADER;
use uvc_streamer::server::{ServerConfig, StreamServer};
use uvc_streamer::streamer::{LoopConfig, Streamer};

fn capture_config() -> CaptureConfig {
    CaptureConfig {
        device: "stub://pipeline".to_string(),
        format: SyntheticConfig::small("stub://pipeline").format,
        buffer_count: 4,
        ioctl_retries: 3,
    }
}

fn loop_config() -> LoopConfig {
    LoopConfig {
        recovery_interval: Duration::ZERO,
        drain_attempts: 3,
        drain_wait: Duration::from_millis(1),
        stats_window: 10,
        ..LoopConfig::default()
    }
}

fn loopback_server() -> StreamServer {
    StreamServer::bind(ServerConfig {
        bind: vec!["127.0.0.1".to_string()],
        port: 0,
        ..ServerConfig::default()
    })
    .expect("bind loopback")
}

/// Source whose devices come from `make`, called with the open count.
fn source_with(
    mut make: impl FnMut(u32) -> anyhow::Result<SyntheticDevice> + 'static,
) -> (FrameSource, Rc<Cell<u32>>) {
    let opens = Rc::new(Cell::new(0));
    let counter = Rc::clone(&opens);
    let source = FrameSource::with_opener(
        capture_config(),
        Box::new(move |config: &CaptureConfig| {
            let attempt = counter.get();
            counter.set(attempt + 1);
            let device = make(attempt)?;
            assert_eq!(device.name(), config.device);
            Ok(Box::new(device) as Box<dyn CaptureDevice>)
        }),
    );
    (source, opens)
}

fn healthy(faults: Faults) -> SyntheticDevice {
    SyntheticDevice::new(SyntheticConfig::small("stub://pipeline")).with_faults(faults)
}

fn step_until(streamer: &mut Streamer, mut done: impl FnMut(&Streamer) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(streamer) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        streamer.step();
    }
}

#[test]
fn client_receives_consecutive_frames() {
    let (source, _) = source_with(|_| Ok(healthy(Faults::default())));
    let mut streamer = Streamer::with_source(source, loopback_server(), loop_config());
    assert!(streamer.source().is_ready());

    let mut client = TcpStream::connect(streamer.server().local_addrs()[0]).unwrap();
    client.set_nonblocking(true).unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    let deadline = Instant::now() + Duration::from_secs(5);
    while count(&received, b"X-Timestamp:") < 4 && Instant::now() < deadline {
        streamer.step();
        match client.read(&mut buf) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => panic!("client read failed: {}", err),
        }
    }

    assert!(received.starts_with(STREAM_HEADER));
    let text = String::from_utf8_lossy(&received);
    let stamps: Vec<f64> = text
        .split("X-Timestamp: ")
        .skip(1)
        .map(|rest| rest.split("\r\n").next().unwrap().parse().unwrap())
        .collect();
    assert!(stamps.len() >= 4);
    assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));

    streamer.shutdown();
    assert!(!streamer.source().is_ready());
    assert_eq!(streamer.server().connection_count(), 0);
}

#[test]
fn recovers_after_device_disappears() {
    let (source, opens) = source_with(|attempt| {
        let faults = if attempt == 0 {
            Faults {
                fail_dequeue_after: Some(5),
                ..Faults::default()
            }
        } else {
            Faults::default()
        };
        Ok(healthy(faults))
    });
    let mut streamer = Streamer::with_source(source, loopback_server(), loop_config());

    step_until(&mut streamer, |s| s.source().is_broken());
    assert_eq!(streamer.stats().total_frames(), 5);

    step_until(&mut streamer, |s| s.recoveries() >= 1 && s.stats().total_frames() >= 10);
    assert_eq!(opens.get(), 2);
    assert!(streamer.source().is_ready());
    assert!(!streamer.source().is_broken());
    assert_eq!(streamer.source().device_held_count() + streamer.queue().len(), 4);
}

#[test]
fn keeps_retrying_a_missing_device() {
    let plugged = Rc::new(Cell::new(false));
    let plug = Rc::clone(&plugged);
    let (source, opens) = source_with(move |_| {
        if !plug.get() {
            bail!("no such device");
        }
        Ok(healthy(Faults::default()))
    });
    let mut streamer = Streamer::with_source(source, loopback_server(), loop_config());
    assert!(!streamer.source().is_ready());

    // Clients are still accepted and get the stream header while capture is down.
    let mut client = TcpStream::connect(streamer.server().local_addrs()[0]).unwrap();
    client.set_nonblocking(true).unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n").unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < STREAM_HEADER.len() && Instant::now() < deadline {
        streamer.step();
        match client.read(&mut buf) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => panic!("client read failed: {}", err),
        }
    }
    assert_eq!(received, STREAM_HEADER);
    assert!(!streamer.source().is_ready());
    assert!(opens.get() >= 2);

    plugged.set(true);
    step_until(&mut streamer, |s| s.source().is_ready());
    assert_eq!(u64::from(opens.get()), streamer.recoveries() + 1);
    assert_eq!(streamer.server().serving_count(), 1);
}

#[test]
fn sequence_gap_counts_missed_frames() {
    let skipped: Vec<u32> = (0..10).chain([12]).collect();
    let (source, _) = source_with(move |_| {
        Ok(healthy(Faults {
            skip_sequences: skipped.clone(),
            ..Faults::default()
        }))
    });
    let mut streamer = Streamer::with_source(source, loopback_server(), loop_config());

    step_until(&mut streamer, |s| s.queue().stats().queued >= 3);
    let stats = streamer.queue().stats();
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.missed, 1);
}

#[test]
fn idle_frames_go_straight_back_to_the_device() {
    let (source, _) = source_with(|_| Ok(healthy(Faults::default())));
    let mut streamer = Streamer::with_source(source, loopback_server(), loop_config());

    for _ in 0..20 {
        streamer.step();
    }
    assert_eq!(streamer.stats().total_frames(), 20);
    assert!(streamer.queue().is_empty());
    assert_eq!(streamer.source().device_held_count(), 4);
    assert!(streamer.stats().last_report().is_some());
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

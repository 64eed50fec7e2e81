//! The driving loop: capture, queue, serve, reclaim.
//!
//! One `Streamer` owns the frame source, the fan-out queue and the server,
//! and runs them cooperatively on the calling thread. Device failures never
//! end the loop; the source is drained and re-initialized on a fixed
//! interval until the camera comes back.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::capture::FrameSource;
use crate::config::StreamerConfig;
use crate::fanout::FrameFanoutQueue;
use crate::server::StreamServer;

#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Minimum time between re-initialization attempts.
    pub recovery_interval: Duration,
    /// Pumps granted to in-flight sends before a drain drops their clients.
    pub drain_attempts: u32,
    pub drain_wait: Duration,
    /// Captured frames per statistics window.
    pub stats_window: u64,
    /// Pause after an iteration that moved no data.
    pub loop_sleep: Duration,
    /// Pause while the device is unavailable.
    pub idle_sleep: Duration,
    /// Splice standard Huffman tables into frames that lack them. Off by
    /// default, which forwards every frame exactly as the device filled it.
    pub insert_huffman: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            recovery_interval: Duration::from_secs(1),
            drain_attempts: 100,
            drain_wait: Duration::from_millis(5),
            stats_window: 500,
            loop_sleep: Duration::from_millis(2),
            idle_sleep: Duration::from_millis(50),
            insert_huffman: false,
        }
    }
}

/// Capture statistics for one measurement window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WindowReport {
    pub frames: u64,
    /// Dequeue attempts that found no frame ready.
    pub empty_polls: u64,
    /// Frames lost to sequence gaps.
    pub missed: u64,
    /// Forced reclaims while clients were streaming.
    pub starvations: u64,
    pub duration: Duration,
    pub fps: f64,
}

#[derive(Debug)]
pub struct CaptureStats {
    window: u64,
    started: Option<Instant>,
    frames: u64,
    empty_polls: u64,
    starvations: u64,
    missed_at_start: u64,
    total_frames: u64,
    last_report: Option<WindowReport>,
}

impl CaptureStats {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            started: None,
            frames: 0,
            empty_polls: 0,
            starvations: 0,
            missed_at_start: 0,
            total_frames: 0,
            last_report: None,
        }
    }

    pub fn record_frame(&mut self) {
        self.started.get_or_insert_with(Instant::now);
        self.frames += 1;
        self.total_frames += 1;
    }

    pub fn record_empty_poll(&mut self) {
        self.empty_polls += 1;
    }

    pub fn record_starvation(&mut self) {
        self.starvations += 1;
    }

    /// Closes the window once it holds enough frames. `missed_total` is the
    /// queue's running missed-frame count.
    pub fn finish_window(&mut self, missed_total: u64) -> Option<WindowReport> {
        if self.frames < self.window {
            return None;
        }
        let duration = self.started.map(|t| t.elapsed()).unwrap_or_default();
        let secs = duration.as_secs_f64();
        let report = WindowReport {
            frames: self.frames,
            empty_polls: self.empty_polls,
            missed: missed_total.saturating_sub(self.missed_at_start),
            starvations: self.starvations,
            duration,
            fps: if secs > 0.0 {
                self.frames as f64 / secs
            } else {
                0.0
            },
        };
        log::info!(
            "capture: {} frames in {:.1}s ({:.1} fps), {} empty polls, {} missed, {} starvations",
            report.frames,
            secs,
            report.fps,
            report.empty_polls,
            report.missed,
            report.starvations
        );
        self.last_report = Some(report);
        self.reset(missed_total);
        Some(report)
    }

    /// Drops a window cut short by a device failure.
    pub fn discard_window(&mut self, missed_total: u64) {
        self.reset(missed_total);
    }

    fn reset(&mut self, missed_total: u64) {
        self.started = None;
        self.frames = 0;
        self.empty_polls = 0;
        self.starvations = 0;
        self.missed_at_start = missed_total;
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn last_report(&self) -> Option<WindowReport> {
        self.last_report
    }
}

pub struct Streamer {
    config: LoopConfig,
    source: FrameSource,
    queue: FrameFanoutQueue,
    server: StreamServer,
    stats: CaptureStats,
    last_recovery: Option<Instant>,
    recoveries: u64,
}

impl Streamer {
    /// Binds the server and starts capture. A missing camera is not an
    /// error; the loop keeps retrying it.
    pub fn new(config: &StreamerConfig) -> Result<Self> {
        let server = StreamServer::bind(config.server_config())?;
        let preset = config.control_preset()?;
        let mut source = FrameSource::new(config.capture_config());
        if !preset.is_empty() {
            source = source.with_tuner(Box::new(preset));
        }
        Ok(Self::with_source(source, server, config.loop_config()))
    }

    pub fn with_source(mut source: FrameSource, server: StreamServer, config: LoopConfig) -> Self {
        let mut last_recovery = None;
        if !source.is_ready() && !source.init() {
            log::warn!(
                "capture device {} unavailable, retrying every {:?}",
                source.config().device,
                config.recovery_interval
            );
            last_recovery = Some(Instant::now());
        }
        Self {
            queue: FrameFanoutQueue::new(config.insert_huffman),
            stats: CaptureStats::new(config.stats_window),
            config,
            source,
            server,
            last_recovery,
            recoveries: 0,
        }
    }

    /// Runs until `should_exit` returns true, then shuts down.
    pub fn run(&mut self, mut should_exit: impl FnMut() -> bool) {
        log::info!("streamer running");
        while !should_exit() {
            let busy = self.step();
            if busy {
                continue;
            }
            let pause = if self.source.is_ready() && !self.source.is_broken() {
                self.config.loop_sleep
            } else {
                self.config.idle_sleep
            };
            std::thread::sleep(pause);
        }
        self.shutdown();
    }

    /// One loop iteration. Returns whether any frame or byte moved.
    pub fn step(&mut self) -> bool {
        if !self.source.is_ready() || self.source.is_broken() {
            self.recover();
            return false;
        }

        let mut busy = false;
        match self.source.dequeue_frame() {
            Some(handle) => {
                busy = true;
                self.stats.record_frame();
                if let Err(rejected) = self.queue.queue_frame(handle, &self.source) {
                    log::warn!(
                        "frame {} dropped: {:#}",
                        rejected.handle.sequence(),
                        rejected.error
                    );
                    self.source.requeue_frame(rejected.handle);
                }
            }
            None if !self.source.is_broken() => self.stats.record_empty_poll(),
            None => {}
        }

        let outcome = self.server.serve(&mut self.queue, &self.source);
        busy |= outcome.bytes_written > 0;

        self.reclaim();
        self.stats.finish_window(self.queue.stats().missed);
        busy
    }

    /// Returns evictable frames to the source. Eviction is forced when nobody
    /// is streaming or the device is down to its last queued buffer.
    fn reclaim(&mut self) {
        let serving = self.server.serving_count();
        let starving = self.source.device_held_count() <= 1;
        let force = serving == 0 || starving;
        let handles = self.queue.evict_ready(force);
        if starving && serving > 0 && !handles.is_empty() {
            self.stats.record_starvation();
        }
        for handle in handles {
            self.source.requeue_frame(handle);
        }
    }

    fn recover(&mut self) {
        if self.source.is_ready() || !self.queue.is_empty() {
            let handles = self.server.drain(
                &mut self.queue,
                &self.source,
                self.config.drain_attempts,
                self.config.drain_wait,
            );
            for handle in handles {
                self.source.requeue_frame(handle);
            }
            self.queue.reset_sequence();
            self.stats.discard_window(self.queue.stats().missed);
        }

        self.server.serve(&mut self.queue, &self.source);

        let due = self
            .last_recovery
            .map_or(true, |at| at.elapsed() >= self.config.recovery_interval);
        if !due {
            return;
        }
        self.last_recovery = Some(Instant::now());
        self.recoveries += 1;
        log::warn!(
            "capture device {} not streaming, re-initializing (attempt {})",
            self.source.config().device,
            self.recoveries
        );
        if self.source.reinit() {
            log::info!("capture device {} recovered", self.source.config().device);
        }
    }

    /// Drains clients, returns every buffer and stops the device. Idempotent.
    pub fn shutdown(&mut self) {
        let handles = self.server.shutdown(
            &mut self.queue,
            &self.source,
            self.config.drain_attempts,
            self.config.drain_wait,
        );
        for handle in handles {
            self.source.requeue_frame(handle);
        }
        self.source.shutdown();
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn queue(&self) -> &FrameFanoutQueue {
        &self.queue
    }

    pub fn server(&self) -> &StreamServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut StreamServer {
        &mut self.server
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Re-initialization attempts so far.
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }
}

//! Encoded media samples and admission gating.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::fanout::FanoutReport;
use crate::peer::TrackKind;
use crate::session::SessionManager;

/// Default duration of one video frame (30 fps)
pub const VIDEO_FRAME_DURATION: Duration = Duration::from_nanos(33_333_333);
/// Default duration of one Opus frame
pub const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Buffer flags reported by the capture pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub key_frame: bool,
    /// Pipeline marked the buffer as droppable
    pub dropped: bool,
    pub corrupted: bool,
}

/// One encoded sample from the capture pipeline
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub track: TrackKind,
    pub data: Bytes,
    pub flags: SampleFlags,
    pub duration: Duration,
    /// Presentation timestamp in nanoseconds
    pub pts_ns: u64,
}

impl MediaSample {
    pub fn video(data: impl Into<Bytes>, key_frame: bool, pts_ns: u64) -> Self {
        Self {
            track: TrackKind::Video,
            data: data.into(),
            flags: SampleFlags {
                key_frame,
                ..Default::default()
            },
            duration: VIDEO_FRAME_DURATION,
            pts_ns,
        }
    }

    pub fn audio(data: impl Into<Bytes>, pts_ns: u64) -> Self {
        Self {
            track: TrackKind::Audio,
            data: data.into(),
            flags: SampleFlags::default(),
            duration: AUDIO_FRAME_DURATION,
            pts_ns,
        }
    }

    pub fn with_flags(mut self, flags: SampleFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Presentation timestamp in 100 ns units
    pub fn pts_100ns(&self) -> u64 {
        self.pts_ns / 100
    }
}

/// Why a sample was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Dropped,
    Corrupted,
    OutOfOrder,
}

/// Filters samples before fan-out.
///
/// Rejects flagged samples and any sample whose timestamp does not advance
/// past the last admitted one on the same track.
#[derive(Debug, Default)]
pub struct SampleGate {
    last_video_pts: Option<u64>,
    last_audio_pts: Option<u64>,
}

impl SampleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, sample: &MediaSample) -> Result<(), Rejection> {
        if sample.flags.dropped {
            return Err(Rejection::Dropped);
        }
        if sample.flags.corrupted {
            return Err(Rejection::Corrupted);
        }

        let last = match sample.track {
            TrackKind::Video => &mut self.last_video_pts,
            TrackKind::Audio => &mut self.last_audio_pts,
        };
        if matches!(*last, Some(prev) if sample.pts_ns <= prev) {
            return Err(Rejection::OutOfOrder);
        }
        *last = Some(sample.pts_ns);
        Ok(())
    }

    pub fn admit(&mut self, sample: &MediaSample) -> bool {
        self.check(sample).is_ok()
    }

    /// Forget timestamps, e.g. after a pipeline restart
    pub fn reset(&mut self) {
        self.last_video_pts = None;
        self.last_audio_pts = None;
    }
}

/// Ingest statistics (atomic, lock-free)
#[derive(Default)]
pub struct IngestStats {
    pub admitted: AtomicU64,
    pub rejected_dropped: AtomicU64,
    pub rejected_corrupted: AtomicU64,
    pub rejected_out_of_order: AtomicU64,
    pub write_failures: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub admitted: u64,
    pub rejected_dropped: u64,
    pub rejected_corrupted: u64,
    pub rejected_out_of_order: u64,
    pub write_failures: u64,
}

/// Entry point for the capture pipeline: gates samples and fans them out.
pub struct MediaIngest {
    manager: Arc<SessionManager>,
    gate: Mutex<SampleGate>,
    pub stats: Arc<IngestStats>,
}

impl MediaIngest {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            gate: Mutex::new(SampleGate::new()),
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Route one sample; `None` if the gate rejected it.
    pub fn push_sample(&self, sample: &MediaSample) -> Option<FanoutReport> {
        if let Err(rejection) = self.gate.lock().check(sample) {
            let counter = match rejection {
                Rejection::Dropped => &self.stats.rejected_dropped,
                Rejection::Corrupted => &self.stats.rejected_corrupted,
                Rejection::OutOfOrder => &self.stats.rejected_out_of_order,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            log::trace!("[MediaIngest] {:?} sample rejected: {:?}", sample.track, rejection);
            return None;
        }

        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        let report = self.manager.route_frame(sample);
        if report.failed > 0 {
            self.stats.write_failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        Some(report)
    }

    pub fn reset(&self) {
        self.gate.lock().reset();
    }

    pub fn get_stats(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            rejected_dropped: self.stats.rejected_dropped.load(Ordering::Relaxed),
            rejected_corrupted: self.stats.rejected_corrupted.load(Ordering::Relaxed),
            rejected_out_of_order: self.stats.rejected_out_of_order.load(Ordering::Relaxed),
            write_failures: self.stats.write_failures.load(Ordering::Relaxed),
        }
    }
}

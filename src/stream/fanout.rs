//! Frame fan-out: one encoded sample to every live session.

use super::now_100ns;
use super::sample::MediaSample;
use crate::peer::{EncodedFrame, TrackKind};
use crate::session::SessionManager;

/// Outcome of routing one sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped_terminated: usize,
}

impl SessionManager {
    /// Write `sample` to the matching transceiver of every live session.
    ///
    /// Each live session consumes one frame index per call, even when its
    /// write fails. Video is stamped with the receipt time, audio with the
    /// sample's own presentation time.
    pub fn route_frame(&self, sample: &MediaSample) -> FanoutReport {
        let receipt_ts = now_100ns();
        let timestamp = match sample.track {
            TrackKind::Video => receipt_ts,
            TrackKind::Audio => sample.pts_100ns(),
        };

        self.with_sessions(|sessions| {
            let mut report = FanoutReport::default();

            for session in sessions.values() {
                if session.is_terminated() {
                    report.skipped_terminated += 1;
                    continue;
                }

                let frame = EncodedFrame {
                    data: sample.data.clone(),
                    duration: sample.duration,
                    key_frame: sample.flags.key_frame,
                    presentation_ts: timestamp,
                    decoding_ts: timestamp,
                    index: session.next_frame_index(),
                };

                match session.transceiver(sample.track).write_frame(&frame) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        report.failed += 1;
                        log::warn!(
                            "[Fanout] {:?} frame {} to '{}' failed: {}",
                            sample.track,
                            frame.index,
                            session.peer_id(),
                            e
                        );
                    }
                }
            }

            report
        })
    }
}

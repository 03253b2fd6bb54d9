//! Frame-loss based connection quality estimation.
//!
//! Frame sightings are folded into 3 second windows. A window ending with a
//! high loss rate flips the status to POOR: immediately at 30%, or at 15%
//! when the previous window was also at 15% or worse. A window at 5% loss or
//! better flips it back to OKAY. Only actual transitions are surfaced.

use crate::shared::ConnectionStatus;

const IMMEDIATE_POOR_LOSS_RATE: i32 = 30;
const CONSECUTIVE_POOR_LOSS_RATE: i32 = 15;
const OKAY_LOSS_RATE: i32 = 5;
const SAMPLE_PERIOD_MS: u64 = 3000;

pub struct FrameHealth {
    interval_start_ms: u64,
    interval_good_frames: i32,
    interval_total_frames: i32,
    last_interval_loss_percent: i32,
    last_status: ConnectionStatus,
    last_seen_frame: i32,
}

impl FrameHealth {
    #[inline]
    pub fn new() -> FrameHealth {
        FrameHealth {
            interval_start_ms: 0,
            interval_good_frames: 0,
            interval_total_frames: 0,
            last_interval_loss_percent: 0,
            last_status: ConnectionStatus::Okay,
            last_seen_frame: 0,
        }
    }

    #[inline]
    pub fn status(&self) -> ConnectionStatus {
        self.last_status
    }

    /// Records a completely received frame.
    #[inline]
    pub fn received_frame(&mut self) {
        self.interval_good_frames += 1;
    }

    /// Records a frame sighting. Frame indices never go backwards. Returns
    /// the new status when the loss rate crossed a threshold at the end of a
    /// sample window.
    pub fn saw_frame(&mut self, frame_index: i32, now_ms: u64) -> Option<ConnectionStatus> {
        let mut update = None;

        if now_ms - self.interval_start_ms >= SAMPLE_PERIOD_MS {
            if self.interval_total_frames != 0 {
                let loss_percent =
                    100 - (self.interval_good_frames * 100) / self.interval_total_frames;

                if self.last_status != ConnectionStatus::Poor
                    && (loss_percent >= IMMEDIATE_POOR_LOSS_RATE
                        || (loss_percent >= CONSECUTIVE_POOR_LOSS_RATE
                            && self.last_interval_loss_percent >= CONSECUTIVE_POOR_LOSS_RATE))
                {
                    self.last_status = ConnectionStatus::Poor;
                    update = Some(ConnectionStatus::Poor);
                } else if loss_percent <= OKAY_LOSS_RATE
                    && self.last_status != ConnectionStatus::Okay
                {
                    self.last_status = ConnectionStatus::Okay;
                    update = Some(ConnectionStatus::Okay);
                }

                self.last_interval_loss_percent = loss_percent;
            }

            self.interval_start_ms = now_ms;
            self.interval_good_frames = 0;
            self.interval_total_frames = 0;
        }

        self.interval_total_frames += frame_index - self.last_seen_frame;
        self.last_seen_frame = frame_index;

        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Feeds one full sample window: `total` frames seen, `good` of them
    // complete, closed by a sighting at `end_ms`.
    fn run_window(
        health: &mut FrameHealth,
        good: i32,
        total: i32,
        start_ms: u64,
        end_ms: u64,
    ) -> Option<ConnectionStatus> {
        let base = health.last_seen_frame;
        assert_eq!(health.saw_frame(base + total, start_ms), None);

        for _ in 0..good {
            health.received_frame();
        }

        health.saw_frame(base + total, end_ms)
    }

    #[test]
    fn test_clean_window_stays_okay() {
        let mut health = FrameHealth::new();

        let update = run_window(&mut health, 100, 100, 1, 3001);

        assert_eq!(update, None);
        assert_eq!(health.status(), ConnectionStatus::Okay);
    }

    #[test]
    fn test_heavy_loss_is_poor_immediately() {
        let mut health = FrameHealth::new();

        let update = run_window(&mut health, 65, 100, 1, 3001);

        assert_eq!(update, Some(ConnectionStatus::Poor));
        assert_eq!(health.status(), ConnectionStatus::Poor);
    }

    #[test]
    fn test_moderate_loss_needs_two_windows() {
        let mut health = FrameHealth::new();

        assert_eq!(run_window(&mut health, 80, 100, 1, 3001), None);
        assert_eq!(
            run_window(&mut health, 80, 100, 3002, 6002),
            Some(ConnectionStatus::Poor)
        );
    }

    #[test]
    fn test_recovery_transitions_back_to_okay() {
        let mut health = FrameHealth::new();

        run_window(&mut health, 65, 100, 1, 3001);
        assert_eq!(health.status(), ConnectionStatus::Poor);

        let update = run_window(&mut health, 97, 100, 3002, 6002);

        assert_eq!(update, Some(ConnectionStatus::Okay));
        assert_eq!(health.status(), ConnectionStatus::Okay);
    }

    #[test]
    fn test_poor_is_reported_once() {
        let mut health = FrameHealth::new();

        assert_eq!(
            run_window(&mut health, 65, 100, 1, 3001),
            Some(ConnectionStatus::Poor)
        );
        // Still losing frames, but the status did not change.
        assert_eq!(run_window(&mut health, 65, 100, 3002, 6002), None);
    }

    #[test]
    fn test_moderate_loss_after_clean_window_does_not_flip() {
        let mut health = FrameHealth::new();

        assert_eq!(run_window(&mut health, 100, 100, 1, 3001), None);
        // 20% loss once, previous window clean: stays OKAY.
        assert_eq!(run_window(&mut health, 80, 100, 3002, 6002), None);
        assert_eq!(health.status(), ConnectionStatus::Okay);
    }
}

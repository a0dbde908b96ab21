use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::TRANSFER_RATE_WINDOW;
use crate::peer::PeerId;

/// Lifecycle of a transfer. `Completed`, `Failed`, and `Cancelled` are
/// absorbing: [`TransferStatus::can_transition`] refuses to leave them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Starting,
    InProgress,
    Paused,
    Resuming,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferStatus::Starting | TransferStatus::InProgress | TransferStatus::Resuming
        )
    }

    /// Whether the state machine may move from `self` to `next`.
    pub fn can_transition(&self, next: TransferStatus) -> bool {
        !self.is_terminal() && *self != next
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Starting => "starting",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Paused => "paused",
            TransferStatus::Resuming => "resuming",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Sliding-window rate meter.
///
/// Samples of cumulative byte counts are pushed by the engine's one
/// second meter tick; the instant rate is read off the window edges and
/// the average off the transfer lifetime.
#[derive(Debug)]
pub struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
    started_at: Instant,
}

impl RateWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            started_at: Instant::now(),
        }
    }

    /// Records the current cumulative byte count and prunes samples older
    /// than the window.
    pub fn sample(&mut self, cumulative_bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, cumulative_bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > TRANSFER_RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the sliding window.
    pub fn instant_rate_bps(&self) -> f64 {
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let span = t1.duration_since(t0).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (b1.saturating_sub(b0)) as f64 / span
    }

    /// Bytes per second since the transfer started.
    pub fn average_rate_bps(&self, cumulative_bytes: u64) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        cumulative_bytes as f64 / elapsed
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of one transfer, handed to the progress
/// callback and returned by `transfer_progress`.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: Uuid,
    pub peer_id: PeerId,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub filename: String,
    pub local_path: PathBuf,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub chunks_completed: u32,
    pub total_chunks: u32,
    pub instant_rate_bps: f64,
    pub average_rate_bps: f64,
    pub eta_ms: u64,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl TransferProgress {
    /// Completion percentage, 0.0 to 100.0.
    pub fn completion_pct(&self) -> f64 {
        if self.file_size == 0 {
            return if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.bytes_transferred as f64 / self.file_size as f64) * 100.0
    }
}

/// Time left at the current instant rate.
pub fn eta_ms(total_bytes: u64, bytes_transferred: u64, instant_rate_bps: f64) -> u64 {
    let remaining = total_bytes.saturating_sub(bytes_transferred) as f64;
    let rate = instant_rate_bps.max(1.0);
    ((remaining / rate) * 1000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Cancelled,
        ] {
            for next in [
                TransferStatus::Pending,
                TransferStatus::InProgress,
                TransferStatus::Paused,
                TransferStatus::Completed,
                TransferStatus::Failed,
            ] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn test_active_states_transition() {
        assert!(TransferStatus::Pending.can_transition(TransferStatus::Starting));
        assert!(TransferStatus::InProgress.can_transition(TransferStatus::Paused));
        assert!(TransferStatus::Paused.can_transition(TransferStatus::Resuming));
        assert!(TransferStatus::Resuming.can_transition(TransferStatus::InProgress));
        assert!(TransferStatus::InProgress.can_transition(TransferStatus::Cancelled));
    }

    #[test]
    fn test_eta_uses_rate_floor() {
        // Rate below one byte per second clamps to one.
        assert_eq!(eta_ms(1000, 0, 0.0), 1_000_000);
        assert_eq!(eta_ms(1000, 500, 500.0), 1000);
        assert_eq!(eta_ms(1000, 1000, 500.0), 0);
    }

    #[test]
    fn test_rate_window_measures_flow() {
        let mut window = RateWindow::new();
        window.sample(0);
        std::thread::sleep(std::time::Duration::from_millis(50));
        window.sample(5000);

        let rate = window.instant_rate_bps();
        assert!(rate > 0.0, "rate should be positive, got {}", rate);
    }

    #[test]
    fn test_rate_window_empty_is_zero() {
        let window = RateWindow::new();
        assert_eq!(window.instant_rate_bps(), 0.0);
    }
}

//! Maps harness iteration boundaries onto the recorder's sample clock.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::TraceBounds;

/// Half-open `[start_ns, end_ns)` range in nanoseconds since the recorder started sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeasurementWindow {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl MeasurementWindow {
    pub fn empty() -> Self {
        Self {
            start_ns: 0,
            end_ns: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_ns >= self.end_ns
    }

    pub fn contains(&self, time_ns: u64) -> bool {
        time_ns >= self.start_ns && time_ns < self.end_ns
    }

    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReconciler {
    pub fix_start_time: bool,
}

impl Default for WindowReconciler {
    fn default() -> Self {
        Self {
            fix_start_time: true,
        }
    }
}

impl WindowReconciler {
    pub fn new(fix_start_time: bool) -> Self {
        Self { fix_start_time }
    }

    /// Wall-clock instant that sample timestamp zero corresponds to.
    pub fn origin(
        &self,
        spawned_at: OffsetDateTime,
        record_start: Option<OffsetDateTime>,
    ) -> OffsetDateTime {
        if !self.fix_start_time {
            return spawned_at;
        }
        match record_start {
            Some(start) => {
                debug!(
                    startup_delay_ms = (start - spawned_at).whole_milliseconds() as i64,
                    "recorder start latency"
                );
                start
            }
            None => {
                warn!("trace has no recording start date; using spawn time as origin");
                spawned_at
            }
        }
    }

    pub fn reconcile(
        &self,
        begin: OffsetDateTime,
        end: OffsetDateTime,
        origin: OffsetDateTime,
        bounds: &TraceBounds,
    ) -> MeasurementWindow {
        let (Some(first), Some(last)) = (bounds.first_ns, bounds.last_ns) else {
            debug!("trace has no samples; window is empty");
            return MeasurementWindow::empty();
        };
        let start_ns = to_trace_ns(begin, origin).max(first);
        let end_ns = to_trace_ns(end, origin).min(last.saturating_add(1));
        if start_ns >= end_ns {
            debug!(start_ns, end_ns, "measurement window does not overlap samples");
            return MeasurementWindow::empty();
        }
        MeasurementWindow { start_ns, end_ns }
    }
}

fn to_trace_ns(instant: OffsetDateTime, origin: OffsetDateTime) -> u64 {
    let nanos = (instant - origin).whole_nanoseconds();
    if nanos <= 0 {
        0
    } else {
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

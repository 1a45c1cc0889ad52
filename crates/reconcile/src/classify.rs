//! Decide what a resource needs from its spec/status pair.

use std::fmt;

use crust_core::{OrderSpec, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Delivered. Nothing left to do.
    Terminal,
    /// Placed but not delivered: refresh tracking.
    TrackingPoll,
    /// Ordering requested and not yet placed: run the placement pipeline.
    PlaceNew,
    Idle,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Terminal => "terminal",
            Verdict::TrackingPoll => "tracking_poll",
            Verdict::PlaceNew => "place_new",
            Verdict::Idle => "idle",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Checked in priority order so a delivered order is never placed again,
/// whatever `place_order` and a stale `placed` flag say.
pub fn classify(spec: &OrderSpec, status: &OrderStatus) -> Verdict {
    if status.delivered {
        Verdict::Terminal
    } else if status.placed {
        Verdict::TrackingPoll
    } else if spec.place_order {
        Verdict::PlaceNew
    } else {
        Verdict::Idle
    }
}

//! Sphere and wrangler state machines.

use std::fmt;

/// Lifecycle of a sphere.
///
/// `Empty → Accumulating` on the first arch, `Accumulating → Reintegrating`
/// while a by-arch re-integration runs and back when it completes, and any
/// state `→ Closed` on reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SphereStatus {
    #[default]
    Empty,
    Accumulating,
    Reintegrating,
    Closed,
}

/// Phase of the wrangler worker within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Waiting,
    Reading,
    Integrating,
    Persisting,
    Paused,
    Terminating,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Reading => "reading",
            Self::Integrating => "integrating",
            Self::Persisting => "persisting",
            Self::Paused => "paused",
            Self::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

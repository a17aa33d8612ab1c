//! Device lifecycle states.
//!
//! The state word is atomic so the submission path can check it without
//! a lock. Construction walks the init prefix forward; teardown resumes
//! from the highest init state ever reached and walks the symmetric
//! cleanup, so a half-constructed instance tears down exactly the levels
//! it reached.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

/// Ordered lifecycle states. The numeric order of the init prefix is
/// load-bearing: teardown compares against it to decide which levels
/// need cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LayerState {
    Uninitialized = 0,
    SimpleInit = 1,
    BufferPoolsInit = 2,
    RequestQueueInit = 3,
    BioDataInit = 4,
    BioAckQueueInit = 5,
    CpuQueueInit = 6,
    Starting = 7,
    Running = 8,
    Suspended = 9,
    Stopping = 10,
    Stopped = 11,
}

impl LayerState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::SimpleInit => "SimpleInit",
            Self::BufferPoolsInit => "BufferPoolsInit",
            Self::RequestQueueInit => "RequestQueueInit",
            Self::BioDataInit => "BioDataInit",
            Self::BioAckQueueInit => "BioAckQueueInit",
            Self::CpuQueueInit => "CpuQueueInit",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::SimpleInit,
            2 => Self::BufferPoolsInit,
            3 => Self::RequestQueueInit,
            4 => Self::BioDataInit,
            5 => Self::BioAckQueueInit,
            6 => Self::CpuQueueInit,
            7 => Self::Starting,
            8 => Self::Running,
            9 => Self::Suspended,
            10 => Self::Stopping,
            11 => Self::Stopped,
            other => unreachable!("invalid lifecycle state word {other}"),
        }
    }

    /// True for the construction prefix, `SimpleInit` through
    /// `CpuQueueInit`.
    #[must_use]
    pub fn is_init_state(self) -> bool {
        (Self::SimpleInit..=Self::CpuQueueInit).contains(&self)
    }
}

/// Lock-free holder for the lifecycle state plus the highest init level
/// ever reached.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU32,
    highest_init: AtomicU32,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(LayerState::Uninitialized as u32),
            highest_init: AtomicU32::new(LayerState::Uninitialized as u32),
        }
    }

    #[must_use]
    pub fn load(&self) -> LayerState {
        LayerState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn store(&self, state: LayerState) {
        let previous = self.state.swap(state as u32, Ordering::AcqRel);
        if state.is_init_state() {
            self.highest_init.fetch_max(state as u32, Ordering::AcqRel);
        }
        info!(
            target: "fvdo::lifecycle",
            event = "state_transition",
            from = LayerState::from_u32(previous).name(),
            to = state.name()
        );
    }

    /// The highest init-prefix state this instance ever reached; the
    /// starting point for teardown.
    #[must_use]
    pub fn highest_init(&self) -> LayerState {
        LayerState::from_u32(self.highest_init.load(Ordering::Acquire))
    }
}

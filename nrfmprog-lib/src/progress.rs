//! Progress callback system
//!
//! Sessions report what they are doing through [`ProgressCallback`] so a
//! front end (terminal, GUI, log) can render it. Many sessions run at once,
//! so every progress item carries the target it belongs to.

use crate::TargetId;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// Kind of progress indicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressType {
    /// Operation of unknown duration
    Spinner,
    /// Operation with a known amount of work
    Bar { total: u64 },
}

/// What a progress item is tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressOperation {
    Connect,
    RecoverErase,
    EraseUicr,
    ErasePages { address: u32, count: usize },
    Write { address: u32, size: u64 },
    Verify { address: u32, size: u64 },
    SystemReset,
    Disconnect,
}

impl fmt::Display for ProgressOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressOperation::Connect => write!(f, "Connecting..."),
            ProgressOperation::RecoverErase => write!(f, "Erasing all flash and UICR..."),
            ProgressOperation::EraseUicr => write!(f, "Erasing UICR..."),
            ProgressOperation::ErasePages { address, count } => {
                write!(f, "Erasing {} page(s) at 0x{:08X}...", count, address)
            }
            ProgressOperation::Write { address, size } => {
                write!(f, "Writing 0x{:X} bytes at 0x{:08X}...", size, address)
            }
            ProgressOperation::Verify { address, size } => {
                write!(f, "Verifying 0x{:X} bytes at 0x{:08X}...", size, address)
            }
            ProgressOperation::SystemReset => write!(f, "Resetting..."),
            ProgressOperation::Disconnect => write!(f, "Disconnecting..."),
        }
    }
}

/// How a progress item ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Success,
    Failed,
    /// Dropped before it was finished, e.g. an error unwound past it
    Aborted,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::Success => write!(f, "Done"),
            ProgressStatus::Failed => write!(f, "Failed"),
            ProgressStatus::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Everything needed to render a new progress item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressInfo {
    pub progress_type: ProgressType,
    /// Target the operation runs against
    pub target: TargetId,
    /// Step prefix, `<serial>:0x<step>`
    pub prefix: String,
    pub operation: ProgressOperation,
    /// Starting position (Bar only)
    pub current: Option<u64>,
}

/// Progress callback trait
///
/// Called concurrently from every worker of a run.
pub trait ProgressCallback: Send + Sync {
    /// Starts a progress item and returns the id used for later updates.
    fn start(&self, info: ProgressInfo) -> ProgressId;

    fn update_message(&self, id: ProgressId, message: String);

    /// Advances a Bar item.
    fn increment(&self, id: ProgressId, delta: u64);

    fn finish(&self, id: ProgressId, status: ProgressStatus);
}

/// Progress item id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressId(pub u64);

/// Callback that renders nothing
#[derive(Debug, Default)]
pub struct NoOpProgressCallback;

impl ProgressCallback for NoOpProgressCallback {
    fn start(&self, _info: ProgressInfo) -> ProgressId {
        ProgressId(0)
    }

    fn update_message(&self, _id: ProgressId, _message: String) {}

    fn increment(&self, _id: ProgressId, _delta: u64) {}

    fn finish(&self, _id: ProgressId, _status: ProgressStatus) {}
}

pub type ProgressCallbackArc = Arc<dyn ProgressCallback>;

pub fn no_op_progress_callback() -> ProgressCallbackArc {
    Arc::new(NoOpProgressCallback)
}

/// Per-session progress factory; numbers the steps of one target.
pub struct ProgressHelper {
    callback: ProgressCallbackArc,
    target: TargetId,
    step_counter: AtomicI32,
}

impl ProgressHelper {
    pub fn new(callback: ProgressCallbackArc, target: TargetId) -> Self {
        Self {
            callback,
            target,
            step_counter: AtomicI32::new(0),
        }
    }

    fn next_step(&self) -> i32 {
        self.step_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn start(&self, progress_type: ProgressType, operation: ProgressOperation) -> ProgressHandler {
        let step = self.next_step();
        let current = match progress_type {
            ProgressType::Bar { .. } => Some(0),
            ProgressType::Spinner => None,
        };
        let info = ProgressInfo {
            progress_type,
            target: self.target.clone(),
            prefix: format!("{}:0x{:02X}", self.target, step),
            operation,
            current,
        };
        let id = self.callback.start(info);
        ProgressHandler {
            callback: Arc::clone(&self.callback),
            id,
            finished: false,
        }
    }

    pub fn create_spinner(&self, operation: ProgressOperation) -> ProgressHandler {
        self.start(ProgressType::Spinner, operation)
    }

    pub fn create_bar(&self, total: u64, operation: ProgressOperation) -> ProgressHandler {
        self.start(ProgressType::Bar { total }, operation)
    }

    pub fn current_step(&self) -> i32 {
        self.step_counter.load(Ordering::SeqCst)
    }
}

/// Handle to one live progress item. Dropping it unfinished reports
/// [`ProgressStatus::Aborted`].
pub struct ProgressHandler {
    callback: ProgressCallbackArc,
    id: ProgressId,
    finished: bool,
}

impl ProgressHandler {
    pub fn set_operation(&self, operation: ProgressOperation) {
        self.callback.update_message(self.id, operation.to_string());
    }

    pub fn inc(&self, delta: u64) {
        self.callback.increment(self.id, delta);
    }

    pub fn finish(mut self, status: ProgressStatus) {
        self.finished = true;
        self.callback.finish(self.id, status);
    }
}

impl Drop for ProgressHandler {
    fn drop(&mut self) {
        if !self.finished {
            self.callback.finish(self.id, ProgressStatus::Aborted);
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    finished: AtomicBool,
}

/// Control-side half of a scheduled start.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

/// Renderer-side half of a scheduled start.
///
/// The renderer checks [`AbortRegistration::is_aborted`] before producing any
/// sample, so an abort issued before the start time fires wins even when the
/// stop command itself is still queued.
#[derive(Debug, Clone)]
pub struct AbortRegistration {
    state: Arc<AbortState>,
}

pub fn abortable() -> (AbortHandle, AbortRegistration) {
    let state = Arc::new(AbortState::default());
    (
        AbortHandle {
            state: state.clone(),
        },
        AbortRegistration { state },
    )
}

impl AbortHandle {
    pub fn abort(&self) {
        self.state.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// The renderer played the registration to completion.
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }
}

impl AbortRegistration {
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// Mark natural completion. Ignored once aborted.
    pub fn finish(&self) {
        if !self.is_aborted() {
            self.state.finished.store(true, Ordering::Release);
        }
    }
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lock;

/// Lifecycle of the tracker's single capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Acquiring,
    Active,
}

/// One live webcam acquisition. Owned by the tracker; the render loop only
/// holds a handle to observe the active flag.
#[derive(Debug)]
pub struct CaptureSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    active: AtomicBool,
    dimensions: Mutex<Option<(u32, u32)>>,
}

impl CaptureSession {
    pub(crate) fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            active: AtomicBool::new(true),
            dimensions: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        *lock(&self.dimensions)
    }

    pub(crate) fn set_dimensions(&self, width: u32, height: u32) {
        *lock(&self.dimensions) = Some((width, height));
    }
}

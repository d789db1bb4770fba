//! Shared state between the Tracking and Local Mapping threads.
//!
//! `SharedState` holds everything both threads touch, each field behind the
//! cheapest primitive that keeps it consistent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::atlas::Atlas;
use crate::geometry::SE3;

pub struct SharedState {
    /// The map and its keyframe database. Tracking takes short read
    /// snapshots; every structural change happens under the write lock.
    pub atlas: RwLock<Atlas>,

    /// Signal to abort Local BA early when a new keyframe arrives.
    /// Set by Tracking when sending a new keyframe to Local Mapping.
    pub abort_ba: AtomicBool,

    /// Request Local Mapping to finish processing and exit.
    pub shutdown_requested: AtomicBool,

    /// Local Mapping is waiting for work.
    pub mapper_idle: AtomicBool,

    /// Latest tracked camera pose (T_wc), for readers that must not wait on
    /// the tracker.
    current_pose: Mutex<Option<SE3>>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_atlas(atlas: Atlas) -> Arc<Self> {
        Arc::new(Self {
            atlas: RwLock::new(atlas),
            ..Self::default()
        })
    }

    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    pub fn request_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn is_mapper_idle(&self) -> bool {
        self.mapper_idle.load(Ordering::SeqCst)
    }

    pub fn set_mapper_idle(&self, idle: bool) {
        self.mapper_idle.store(idle, Ordering::SeqCst);
    }

    pub fn current_pose(&self) -> Option<SE3> {
        *self.current_pose.lock()
    }

    pub fn publish_pose(&self, pose: Option<SE3>) {
        *self.current_pose.lock() = pose;
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            atlas: RwLock::new(Atlas::new()),
            abort_ba: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            mapper_idle: AtomicBool::new(true),
            current_pose: Mutex::new(None),
        }
    }
}

//! Backup media download state: pause flag, banner, byte counters and the
//! low-disk-space latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Snapshot of backup media download progress, for the UI banner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupMediaProgress {
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub paused: bool,
    pub banner_dismissed: bool,
}

impl BackupMediaProgress {
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.completed_bytes)
    }
}

#[derive(Debug, Default)]
pub(crate) struct BackupMediaState {
    progress: Mutex<BackupMediaProgress>,
    low_disk: AtomicBool,
}

impl BackupMediaState {
    fn lock(&self) -> MutexGuard<'_, BackupMediaProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> BackupMediaProgress {
        *self.lock()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub(crate) fn pause(&self) {
        self.lock().paused = true;
    }

    /// Unpause; a later low-disk check may pause again.
    pub(crate) fn resume(&self) {
        self.lock().paused = false;
        self.low_disk.store(false, Ordering::Release);
    }

    pub(crate) fn dismiss_banner(&self) {
        self.lock().banner_dismissed = true;
    }

    pub(crate) fn add_total(&self, bytes: u64) {
        let mut progress = self.lock();
        progress.total_bytes = progress.total_bytes.saturating_add(bytes);
    }

    pub(crate) fn add_completed(&self, bytes: u64) {
        let mut progress = self.lock();
        progress.completed_bytes = progress
            .completed_bytes
            .saturating_add(bytes)
            .min(progress.total_bytes);
    }

    /// Clear counters and flags, keeping the banner dismissal.
    pub(crate) fn reset(&self) {
        let mut progress = self.lock();
        let banner_dismissed = progress.banner_dismissed;
        *progress = BackupMediaProgress {
            banner_dismissed,
            ..Default::default()
        };
        self.low_disk.store(false, Ordering::Release);
    }

    /// Record a low-disk observation. Pauses downloads, re-shows the banner,
    /// and returns true only on the transition into the low state.
    pub(crate) fn enter_low_disk(&self) -> bool {
        {
            let mut progress = self.lock();
            progress.paused = true;
            progress.banner_dismissed = false;
        }
        !self.low_disk.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn leave_low_disk(&self) {
        self.low_disk.store(false, Ordering::Release);
    }
}

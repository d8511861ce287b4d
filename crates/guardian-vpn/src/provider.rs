//! Collaborators the coordinator reads from
//!
//! Account, device and server storage live outside this crate; the
//! coordinator only sees these narrow traits.

use crate::builder::{DeviceRecord, ServerRecord};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::info;

/// Source of the local device's credentials
pub trait DeviceRepository: Send + Sync {
    fn device(&self) -> Option<DeviceRecord>;
}

/// Source of the user's current server choice
pub trait ServerRepository: Send + Sync {
    fn selected_server(&self) -> Option<ServerRecord>;
}

/// OS permission to establish a VPN
pub trait PermissionGate: Send + Sync {
    fn is_granted(&self) -> bool;

    /// Ask the platform to show its permission prompt.
    ///
    /// The answer comes back later as a permission command.
    fn request(&self);
}

/// Permission flag held in memory
#[derive(Debug, Default)]
pub struct SharedPermission {
    granted: AtomicBool,
    requests: AtomicUsize,
}

impl SharedPermission {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    /// Prompts shown so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PermissionGate for SharedPermission {
    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request(&self) {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        info!("VPN permission requested (prompt #{})", n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_permission() {
        let permission = SharedPermission::new(false);
        assert!(!permission.is_granted());

        permission.request();
        permission.request();
        assert_eq!(permission.requests(), 2);

        permission.set_granted(true);
        assert!(permission.is_granted());
    }
}

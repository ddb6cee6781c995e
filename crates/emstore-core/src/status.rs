//! Status values reported to the protocol layer.

use serde::{Deserialize, Serialize};

use crate::sdmmc::SdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    /// No initialization attempt finished yet
    Uninitialized,
    /// Card detect reports an empty slot
    NotPresent,
    /// Bring-up failed at the given step
    Failed(SdError),
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemStatus {
    Unmounted,
    /// The volume could not be mounted, not even after formatting
    MountFailed,
    /// Formatting the card failed
    FormatFailed,
    /// Mounted, but the boot counter could not be updated
    BootCountFailed,
    Ok,
}

/// Combined card and filesystem state.
///
/// Queues and read sessions are only serviced while both halves are `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStatus {
    pub card: CardStatus,
    pub filesystem: FilesystemStatus,
}

impl StorageStatus {
    pub const fn new() -> Self {
        Self {
            card: CardStatus::Uninitialized,
            filesystem: FilesystemStatus::Unmounted,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.card == CardStatus::Ok && self.filesystem == FilesystemStatus::Ok
    }

    /// What a push or request reports while storage is unavailable.
    pub fn data_status(&self) -> DataStatus {
        if self.card != CardStatus::Ok {
            DataStatus::SdError
        } else if self.filesystem != FilesystemStatus::Ok {
            DataStatus::FilesystemError
        } else {
            DataStatus::Ok
        }
    }
}

impl Default for StorageStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronous result of push and request calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataStatus {
    Ok,
    SdError,
    FilesystemError,
    QueueFull,
    DateOutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatStatus {
    Ok,
    PasswordError,
}

//! File-backed A/B firmware slots.
//!
//! Layout under the slot directory:
//! - `slot_a`, `slot_b`: committed images
//! - `slot_X.staging`: image being written into the inactive slot
//! - `active`: JSON pointer to the slot to boot
//!
//! An image only becomes visible after the staging file is complete, synced
//! and renamed over its slot; the pointer is then replaced atomically. A sink
//! dropped mid-write removes its staging file and leaves the pointer alone.

use chrono::{DateTime, Utc};
use ota_common::{FinalizeReport, FlashSink};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Name of the pointer file
pub const ACTIVE_FILE: &str = "active";

const STAGING_SUFFIX: &str = ".staging";
const POINTER_TMP: &str = "active.tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::A => "slot_a",
            Self::B => "slot_b",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// Contents of the `active` pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSlot {
    pub slot: Slot,
    pub size: u64,
    /// Hex SHA-256 of the image
    pub sha256: String,
    pub committed_at: DateTime<Utc>,
}

/// Slot sink failures; `code` follows the classic updater numbering
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    #[error("Image of {needed} bytes exceeds slot capacity of {capacity} bytes")]
    NoSpace { needed: u64, capacity: u64 },

    #[error("More data than the {reserved} reserved bytes")]
    Overflow { reserved: u64 },

    #[error("Image size mismatch: wrote {written} of {reserved} bytes")]
    Size { written: u64, reserved: u64 },

    #[error("No reserved image to write into")]
    NotReserved,

    #[error("Could not activate {slot}: {reason}")]
    Activate { slot: Slot, reason: String },
}

impl SinkError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Write(_) => 1,
            Self::NoSpace { .. } | Self::Overflow { .. } => 4,
            Self::Size { .. } => 5,
            Self::NotReserved => 6,
            Self::Activate { .. } => 9,
        }
    }
}

struct Staging {
    slot: Slot,
    path: PathBuf,
    file: File,
    hasher: Sha256,
    reserved: u64,
    written: u64,
}

/// `FlashSink` writing into the inactive slot of a directory
pub struct FileSlotSink {
    dir: PathBuf,
    capacity: u64,
    staging: Option<Staging>,
    last_error: Option<SinkError>,
}

impl FileSlotSink {
    pub fn new(dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            dir: dir.into(),
            capacity,
            staging: None,
            last_error: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_error(&self) -> Option<&SinkError> {
        self.last_error.as_ref()
    }

    /// Slot that a new image would be written to
    pub fn target_slot(&self) -> Slot {
        match read_active(&self.dir) {
            Ok(Some(active)) => active.slot.other(),
            Ok(None) => Slot::A,
            Err(e) => {
                warn!("Ignoring unreadable slot pointer: {}", e);
                Slot::A
            }
        }
    }

    fn fail(&mut self, err: SinkError) {
        error!("Slot sink error #{}: {}", err.code(), err);
        self.last_error = Some(err);
    }

    fn discard_staging(&mut self) {
        if let Some(staging) = self.staging.take() {
            remove_quietly(&staging.path);
        }
    }

    fn open_staging(&self, size: u64) -> io::Result<Staging> {
        fs::create_dir_all(&self.dir)?;
        let slot = self.target_slot();
        let path = self
            .dir
            .join(format!("{}{}", slot.file_name(), STAGING_SUFFIX));
        let file = File::create(&path)?;
        Ok(Staging {
            slot,
            path,
            file,
            hasher: Sha256::new(),
            reserved: size,
            written: 0,
        })
    }

    fn commit(&self, staging: Staging) -> Result<ActiveSlot, SinkError> {
        let Staging {
            slot,
            path,
            file,
            hasher,
            written,
            ..
        } = staging;

        let synced = file.sync_all();
        drop(file);
        if let Err(e) = synced {
            remove_quietly(&path);
            return Err(SinkError::Write(e));
        }

        let slot_path = self.dir.join(slot.file_name());
        if let Err(e) = fs::rename(&path, &slot_path) {
            remove_quietly(&path);
            return Err(SinkError::Write(e));
        }

        let active = ActiveSlot {
            slot,
            size: written,
            sha256: hex::encode(hasher.finalize()),
            committed_at: Utc::now(),
        };
        write_active(&self.dir, &active).map_err(|e| SinkError::Activate {
            slot,
            reason: e.to_string(),
        })?;
        Ok(active)
    }
}

impl FlashSink for FileSlotSink {
    fn reserve(&mut self, size: u64) -> bool {
        self.discard_staging();
        self.last_error = None;

        if size > self.capacity {
            self.fail(SinkError::NoSpace {
                needed: size,
                capacity: self.capacity,
            });
            return false;
        }

        match self.open_staging(size) {
            Ok(staging) => {
                debug!("Staging {} bytes at {}", size, staging.path.display());
                self.staging = Some(staging);
                true
            }
            Err(e) => {
                self.fail(SinkError::Write(e));
                false
            }
        }
    }

    fn append(&mut self, bytes: &[u8]) -> usize {
        let Some(staging) = self.staging.as_mut() else {
            self.fail(SinkError::NotReserved);
            return 0;
        };

        let room = staging.reserved - staging.written;
        let take = (bytes.len() as u64).min(room) as usize;
        if let Err(e) = staging.file.write_all(&bytes[..take]) {
            self.fail(SinkError::Write(e));
            return 0;
        }
        staging.hasher.update(&bytes[..take]);
        staging.written += take as u64;

        if take < bytes.len() {
            let reserved = staging.reserved;
            self.fail(SinkError::Overflow { reserved });
        }
        take
    }

    fn finalize(&mut self) -> FinalizeReport {
        let Some(staging) = self.staging.take() else {
            self.fail(SinkError::NotReserved);
            return FinalizeReport {
                committed: false,
                valid: false,
            };
        };

        if self.last_error.is_some() || staging.written != staging.reserved {
            if self.last_error.is_none() {
                let (written, reserved) = (staging.written, staging.reserved);
                self.fail(SinkError::Size { written, reserved });
            }
            remove_quietly(&staging.path);
            return FinalizeReport {
                committed: false,
                valid: false,
            };
        }

        match self.commit(staging) {
            Ok(active) => {
                info!(
                    "Committed {} ({} bytes, sha256 {})",
                    active.slot, active.size, active.sha256
                );
                FinalizeReport {
                    committed: true,
                    valid: true,
                }
            }
            Err(e) => {
                // Image is in its slot but the pointer still names the old one
                let committed = matches!(e, SinkError::Activate { .. });
                self.fail(e);
                FinalizeReport {
                    committed,
                    valid: false,
                }
            }
        }
    }

    fn error_code(&self) -> i32 {
        self.last_error.as_ref().map_or(0, SinkError::code)
    }
}

impl Drop for FileSlotSink {
    fn drop(&mut self) {
        if self.staging.is_some() {
            debug!("Discarding unfinished staging image");
            self.discard_staging();
        }
    }
}

/// Read the `active` pointer of `dir`; `None` when no image was ever committed
pub fn read_active(dir: &Path) -> Result<Option<ActiveSlot>, SinkError> {
    let path = dir.join(ACTIVE_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SinkError::Write(e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| SinkError::Write(io::Error::new(io::ErrorKind::InvalidData, e)))
}

fn write_active(dir: &Path, active: &ActiveSlot) -> io::Result<()> {
    let tmp = dir.join(POINTER_TMP);
    let json = serde_json::to_string_pretty(active)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(ACTIVE_FILE))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

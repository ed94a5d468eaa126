use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::fileid;

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(5);

/// Grace period for a reader whose file was rotated away or removed.
///
/// The first call to [`LifeTimer::should_die`] arms the timer. Later calls
/// report true once the path no longer names the reader's inode and the
/// lifetime has elapsed since arming.
#[derive(Debug, Clone)]
pub struct LifeTimer {
    pub lifetime: Duration,
    path: PathBuf,
    inode: u64,
    armed_at: Option<Instant>,
}

impl LifeTimer {
    pub fn new(path: impl Into<PathBuf>, inode: u64) -> Self {
        Self {
            lifetime: DEFAULT_LIFETIME,
            path: path.into(),
            inode,
            armed_at: None,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn should_die(&mut self) -> bool {
        let armed_at = match self.armed_at {
            Some(t) => t,
            None => {
                self.armed_at = Some(Instant::now());
                return false;
            }
        };
        fileid::moved(&self.path, self.inode) && armed_at.elapsed() > self.lifetime
    }
}

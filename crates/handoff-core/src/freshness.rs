use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

/// Outcome of inspecting a result file after the assistant reported `done`.
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness {
    Fresh { size: u64, modified: SystemTime },
    Missing,
    /// Modified before the task was dispatched: left over from earlier work.
    Stale {
        modified: SystemTime,
        reference: SystemTime,
    },
    TooSmall { size: u64, min_bytes: u64 },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh { .. })
    }

    pub fn describe(&self, path: &Path) -> String {
        match self {
            Freshness::Fresh { size, .. } => format!("{} ({size} bytes)", path.display()),
            Freshness::Missing => format!("{} does not exist", path.display()),
            Freshness::Stale { modified, reference } => format!(
                "{} was last modified at {} which is before the task was dispatched at {}",
                path.display(),
                DateTime::<Utc>::from(*modified).to_rfc3339(),
                DateTime::<Utc>::from(*reference).to_rfc3339(),
            ),
            Freshness::TooSmall { size, min_bytes } => format!(
                "{} is {size} bytes, expected at least {min_bytes}",
                path.display()
            ),
        }
    }
}

/// A result counts only if it exists, was modified at or after `reference`
/// (the dispatch mark), and holds at least `min_bytes`.
pub fn check(path: &Path, reference: SystemTime, min_bytes: u64) -> Freshness {
    let meta = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => return Freshness::Missing,
    };
    let Ok(modified) = meta.modified() else {
        return Freshness::Missing;
    };
    if modified < reference {
        return Freshness::Stale {
            modified,
            reference,
        };
    }
    if meta.len() < min_bytes {
        return Freshness::TooSmall {
            size: meta.len(),
            min_bytes,
        };
    }
    Freshness::Fresh {
        size: meta.len(),
        modified,
    }
}

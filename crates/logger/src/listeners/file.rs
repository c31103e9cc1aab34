//! Append readings to a text file
//!
//! One line per reading:
//!
//! ```text
//! <id>,<raw>,<cooked> <unit>,<timestamp>,<signal or ->,<name>,<kind>
//! ```

use super::{ListenerContext, ListenerParams, string_param};
use anyhow::Context;
use common::{DataListener, DataPoint, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

pub const DEFAULT_FILENAME: &str = "/tmp/arexx-logger.out";

#[derive(Debug)]
pub struct FileOutListener {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileOutListener {
    pub const TAG: &'static str = "FileOutListener";

    /// Open `path` for appending; a failed open is retried on the next point
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match open_append(&path) {
            Ok(file) => {
                info!("Writing readings to {}", path.display());
                Some(file)
            }
            Err(e) => {
                error!("FileOutListener: unable to open {}: {}", path.display(), e);
                None
            }
        };

        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn from_params(
        params: &ListenerParams,
        _context: &ListenerContext,
    ) -> Result<Arc<dyn DataListener>> {
        let filename = string_param(params, "filename", DEFAULT_FILENAME)?;
        let path = shellexpand::tilde(&filename).into_owned();
        Ok(Arc::new(Self::new(path)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Render one output line, without the trailing newline
pub fn format_line(point: &DataPoint) -> String {
    format!(
        "{},{},{:.6} {},{},{},{},{}",
        point.sensor_id,
        point.raw_value,
        point.cooked(),
        point.sensor.unit(),
        point.timestamp,
        point.signal_text(),
        point.sensor.name(),
        point.sensor.kind()
    )
}

impl DataListener for FileOutListener {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn on_new_data(&self, point: Arc<DataPoint>) -> anyhow::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);

        if guard.is_none() {
            let file = open_append(&self.path)
                .with_context(|| format!("Unable to open {}", self.path.display()))?;
            info!("Reopened {}", self.path.display());
            *guard = Some(file);
        }

        if let Some(file) = guard.as_mut() {
            let written = writeln!(file, "{}", format_line(&point)).and_then(|()| file.flush());
            if let Err(e) = written {
                // reopen on the next point
                *guard = None;
                return Err(e).with_context(|| format!("Unable to write {}", self.path.display()));
            }
        }

        Ok(())
    }
}

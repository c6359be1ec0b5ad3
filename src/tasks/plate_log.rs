use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::tracking::Direction;

const HEADER: &str = "timestamp,license_plate,location,direction";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct PlateRow<'a> {
    pub timestamp: DateTime<Local>,
    pub plate: &'a str,
    pub location: &'a str,
    pub direction: Direction,
}

/// Append-only CSV of recognized plates.
pub struct PlateLog {
    path: PathBuf,
}

impl PlateLog {
    /// Creates the file with its header row if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{HEADER}")?;
        }

        Ok(Self { path })
    }

    pub fn append(&self, row: &PlateRow<'_>) -> io::Result<()> {
        let line = format!(
            "{},{},{},{}\n",
            row.timestamp.format(TIMESTAMP_FORMAT),
            csv_field(row.plate),
            csv_field(row.location),
            row.direction.as_str(),
        );
        // single write per row
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

//! Append-only JSON-lines journal of tasks and events.
//!
//! `tasks.jsonl` receives a full snapshot of a task on every mutation; the
//! last line per task id wins on load. `events.jsonl` receives every event in
//! append order. A line torn by a crash is skipped on load, and reopening
//! terminates it so later records stay intact.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::event::Event;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

const TASKS_FILE: &str = "tasks.jsonl";
const EVENTS_FILE: &str = "events.jsonl";

/// Everything read back from a journal directory.
#[derive(Debug, Default)]
pub struct JournalContents {
    /// Latest snapshot of every task, ordered by id.
    pub tasks: Vec<Task>,
    /// Every event, in append order.
    pub events: Vec<Event>,
}

#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    tasks: Mutex<File>,
    events: Mutex<File>,
}

impl Journal {
    /// Open (creating if needed) the journal files in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let tasks = open_append(&dir.join(TASKS_FILE))?;
        let events = open_append(&dir.join(EVENTS_FILE))?;
        debug!(dir = %dir.display(), "journal opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            tasks: Mutex::new(tasks),
            events: Mutex::new(events),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append_task(&self, task: &Task) -> Result<()> {
        append_line(&self.tasks, task)
    }

    pub fn append_event(&self, event: &Event) -> Result<()> {
        append_line(&self.events, event)
    }

    /// Read the journal back.
    pub fn load(&self) -> Result<JournalContents> {
        let snapshots: Vec<Task> = read_lines(&self.dir.join(TASKS_FILE))?;
        let mut latest: BTreeMap<TaskId, Task> = BTreeMap::new();
        for task in snapshots {
            latest.insert(task.id, task);
        }

        let events = read_lines(&self.dir.join(EVENTS_FILE))?;
        Ok(JournalContents {
            tasks: latest.into_values().collect(),
            events,
        })
    }
}

/// Open for appending. A file whose last line lacks its newline gets one, so
/// the next record starts on a fresh line.
fn open_append(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    let len = file.metadata()?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            file.write_all(b"\n")?;
        }
    }
    Ok(file)
}

fn append_line<T: Serialize>(file: &Mutex<File>, record: &T) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
    file.write_all(&line)
        .map_err(|e| Error::Store(format!("journal write failed: {}", e)))?;
    Ok(())
}

/// Journal whose event file refuses every write.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn full_event_journal(dir: &Path) -> Journal {
    std::os::unix::fs::symlink("/dev/full", dir.join(EVENTS_FILE)).unwrap();
    Journal::open(dir).unwrap()
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, error = %e, "skipping torn journal line");
            }
        }
    }
    Ok(records)
}

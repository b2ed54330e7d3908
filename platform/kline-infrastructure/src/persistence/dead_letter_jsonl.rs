use kline_domain::repositories::dead_letter::DeadLetterSink;
use kline_domain::value_objects::fetch_window::DeadLetter;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One JSON object per line. Appends are serialized in-process; `remove` rewrites the
/// file through a temp sibling and a rename.
#[derive(Debug)]
pub struct JsonlDeadLetterSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlDeadLetterSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<DeadLetter>, String> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(format!(
                    "failed to read dead letters {}: {}",
                    self.path.display(),
                    err
                ))
            }
        };
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|err| {
                    format!(
                        "invalid dead letter at {}:{}: {}",
                        self.path.display(),
                        idx + 1,
                        err
                    )
                })
            })
            .collect()
    }
}

fn ensure_parent(path: &Path) -> Result<(), String> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create dir {}: {}", parent.display(), err)),
        _ => Ok(()),
    }
}

impl DeadLetterSink for JsonlDeadLetterSink {
    fn record(&self, letter: &DeadLetter) -> Result<(), String> {
        let _guard = self.lock.lock();
        ensure_parent(&self.path)?;
        let line = serde_json::to_string(letter)
            .map_err(|err| format!("failed to serialize dead letter: {err}"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format!("failed to open {}: {}", self.path.display(), err))?;
        writeln!(file, "{line}")
            .map_err(|err| format!("failed to append dead letter: {err}"))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<DeadLetter>, String> {
        let _guard = self.lock.lock();
        self.read_all()
    }

    fn remove(&self, letters: &[DeadLetter]) -> Result<usize, String> {
        if letters.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.lock();
        let existing = self.read_all()?;
        let before = existing.len();
        let kept: Vec<DeadLetter> = existing
            .into_iter()
            .filter(|stored| !letters.iter().any(|letter| letter.same_letter(stored)))
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut body = String::new();
        for letter in &kept {
            let line = serde_json::to_string(letter)
                .map_err(|err| format!("failed to serialize dead letter: {err}"))?;
            body.push_str(&line);
            body.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, body)
            .map_err(|err| format!("failed to write {}: {}", tmp.display(), err))?;
        fs::rename(&tmp, &self.path)
            .map_err(|err| format!("failed to replace {}: {}", self.path.display(), err))?;
        tracing::info!(removed, remaining = kept.len(), "dead letters settled");
        Ok(removed)
    }
}

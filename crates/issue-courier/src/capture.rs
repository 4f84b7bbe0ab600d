//! Debug snapshots of intermediate pages.
//!
//! With debug on, each page the pipeline looks at is written to
//! `<workdir>/debug/<timestamp>_<seq>_<name>.html` so a broken portal flow
//! can be diagnosed after the fact. The sequence number keeps pages captured
//! within the same second apart. Capture never fails a run.

use crate::browser::Page;
use chrono::Local;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct PageCapture {
    dir: Option<PathBuf>,
    seq: AtomicUsize,
}

impl PageCapture {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir: Some(dir),
            seq: AtomicUsize::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Write `page` under `name`. Returns the file written, if any.
    pub fn page(&self, name: &str, page: &Page) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create capture directory");
            return None;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}.html", stamp(seq, name)));
        let annotated = format!("<!-- {} (HTTP {}) -->\n{}", page.url, page.status, page.html);
        match std::fs::write(&path, annotated) {
            Ok(()) => {
                debug!(path = %path.display(), url = %page.url, "page captured");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "page capture failed");
                None
            }
        }
    }
}

fn stamp(seq: usize, name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if matches!(c, '/' | ':' | '\\' | ' ') { '_' } else { c })
        .collect();
    format!("{}_{seq:03}_{safe}", Local::now().format("%Y%m%d-%H%M%S"))
}

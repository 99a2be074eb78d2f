//! Walk scanner output directories and fold measurement files into one
//! newest-measurement-per-relay view.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use regex::Regex;
use tracing::{debug, info, warn};

use super::containers::Node;
use super::MAX_AGE;
use crate::parser::measurement::{parse_measurement, ScanHeader};
use crate::parser::RelayId;

/// Everything ingestion produced: the per-relay working records and, per
/// scanner subdirectory, the newest header timestamp seen.
#[derive(Debug, Default)]
pub struct ScanData {
    pub nodes: HashMap<RelayId, Node>,
    pub scanner_timestamps: BTreeMap<String, f64>,
}

/// Ingest every done-file under every `scanner.N` subdirectory of the given
/// data roots. Files older than [`MAX_AGE`] are deleted along with their
/// `sql-` sibling and skipped.
pub fn ingest(data_dirs: &[PathBuf], now: f64) -> ScanData {
    let scanner_re = Regex::new(r"^scanner\.\d+$").unwrap();
    let done_re = Regex::new(r"^bws-.+-done-").unwrap();

    let mut data = ScanData::default();
    for root in data_dirs {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read data directory {}: {}", root.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !scanner_re.is_match(&name) || !entry.path().is_dir() {
                continue;
            }

            let mut newest = 0.0f64;
            let pattern = format!("{}/scan-data/**/*", entry.path().display());
            let paths = match glob(&pattern) {
                Ok(paths) => paths,
                Err(_) => continue,
            };
            for path in paths.flatten() {
                let is_done_file = path
                    .file_name()
                    .and_then(OsStr::to_str)
                    .map(|f| done_re.is_match(f))
                    .unwrap_or(false);
                if is_done_file && path.is_file() {
                    ingest_file(&path, root, now, &mut newest, &mut data.nodes);
                }
            }
            data.scanner_timestamps.insert(name, newest);
        }
    }
    data
}

fn ingest_file(
    path: &Path,
    root: &Path,
    now: f64,
    newest: &mut f64,
    nodes: &mut HashMap<RelayId, Node>,
) {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("Cannot read scan file {}: {}", path.display(), e);
            return;
        }
    };
    let header = match ScanHeader::parse(&text) {
        Ok(header) => header,
        Err(e) => {
            warn!("Bad header in scan file {}: {}", path.display(), e);
            return;
        }
    };

    // old measurements are probably better than no measurements; this only
    // drops files that are REALLY old
    if now - header.timestamp > MAX_AGE {
        remove_aged(path);
        return;
    }
    if header.timestamp > *newest {
        *newest = header.timestamp;
    }

    let scanner = path
        .strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string();
    for line in text.lines().skip(2) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_measurement(line) {
            Ok(m) => {
                nodes
                    .entry(m.node_id.clone())
                    .or_insert_with(|| Node::new(m.node_id.clone()))
                    .absorb(&m, header.timestamp, &scanner);
            }
            Err(e) => {
                info!("Conversion error {} at {}", e, line);
            }
        }
    }
}

fn remove_aged(path: &Path) {
    let fname = path.file_name().and_then(OsStr::to_str).unwrap_or("");
    let sibling = path.with_file_name(fname.replacen("bws-", "sql-", 1));
    debug!(
        "Removing old file {} and {}",
        path.display(),
        sibling.display()
    );
    if let Err(e) = fs::remove_file(path) {
        warn!("Could not remove {}: {}", path.display(), e);
    }
    // the sql file may never have existed
    let _ = fs::remove_file(&sibling);
}

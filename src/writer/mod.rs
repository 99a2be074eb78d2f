//! Emission of the two output files: the vote file consumed by the
//! directory voter and the file-size table consumed by the scanners.
//!
//! Both are written next to their destination and renamed into place, so a
//! reader never observes a half-written file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use phf::phf_map;
use thiserror;
use tracing::debug;

use crate::highlevel::Node;

#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    #[error("General I/O error")]
    IoError(#[from] io::Error),
}

/// Download sizes the scanners choose from, largest first. Sizes are in
/// kilobytes; the trailing zero entry makes the smallest file the fallback
/// for arbitrarily slow relays.
static FILE_SIZES: [u32; 14] = [
    65536, 32768, 16384, 8192, 4096, 2048, 1024, 512, 256, 128, 64, 32, 16, 0,
];

static FILE_LABELS: phf::Map<u32, &'static str> = phf_map! {
    65536u32 => "64M",
    32768u32 => "32M",
    16384u32 => "16M",
    8192u32 => "8M",
    4096u32 => "4M",
    2048u32 => "2M",
    1024u32 => "1M",
    512u32 => "512k",
    256u32 => "256k",
    128u32 => "128k",
    64u32 => "64k",
    32u32 => "32k",
    16u32 => "16k",
    0u32 => "16k",
};

/// Keep the first 3 decimal digits of the bandwidth value only, to minimize
/// changes for consensus diffs, then scale down to kilobytes. Resulting
/// error is +/-0.5%.
pub fn base10_round(bw_val: f64) -> u64 {
    if bw_val <= 0.0 {
        debug!("Zero input bandwidth.. Upping to 1");
        return 1;
    }
    let magnitude = 10f64.powi(bw_val.log10() as i32 - 2);
    let kept = (bw_val / magnitude).round() * magnitude;
    let bucketed = ((kept / 1000.0).round() * 1000.0).max(1000.0);
    let ret = (bucketed / 1000.0) as u64;
    if ret == 0 {
        debug!("Zero output bandwidth.. Upping to 1");
        return 1;
    }
    ret
}

fn atomic_write(
    dest: &Path,
    write_content: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
) -> Result<(), OutputError> {
    let staged = staged_path(dest);
    {
        let mut out = BufWriter::new(File::create(&staged)?);
        write_content(&mut out)?;
        out.flush()?;
    }
    // atomic on POSIX
    fs::rename(&staged, dest)?;
    Ok(())
}

fn staged_path(dest: &Path) -> PathBuf {
    let mut raw = dest.as_os_str().to_os_string();
    raw.push(".new");
    PathBuf::from(raw)
}

/// Write the vote file: the scan age, then one line per votable relay in the
/// order given (descending error).
pub fn write_vote_file(
    path: &Path,
    scan_age: i64,
    nodes: &[Node],
) -> Result<(), OutputError> {
    atomic_write(path, |out| {
        writeln!(out, "{}", scan_age)?;
        for n in nodes.iter().filter(|n| !n.ignore) {
            writeln!(
                out,
                "node_id={} bw={} nick={} measured_at={} updated_at={} pid_error={} \
                 pid_error_sum={} pid_w={} pid_delta={} circ_fail={} scanner={}",
                n.id,
                base10_round(n.new_bw),
                n.nick,
                n.measured_at as i64,
                n.updated_at as i64,
                n.pid_error,
                n.pid_error_sum,
                n.pid_bw as i64,
                n.pid_delta,
                n.circ_fail_rate,
                n.scanner
            )?;
        }
        Ok(())
    })
}

/// Write the `bwfiles` table into a data directory. For each distinct
/// percentile of the relay population (by filtered bandwidth), the scanners
/// get told which file size to fetch: one size step above the largest size a
/// five-fold of the relay's bandwidth can still cover.
pub fn write_file_list(
    datadir: &Path,
    nodes: impl IntoIterator<Item = u64>,
) -> Result<(), OutputError> {
    let mut node_fbws: Vec<u64> = nodes.into_iter().map(|filt_bw| 5 * filt_bw).collect();
    node_fbws.sort_unstable();

    let mut file_pairs: Vec<(u64, &'static str)> = Vec::new();
    let mut prev_size: u32 = 0;
    let mut prev_pct: u64 = 0;
    for (i, bw) in node_fbws.iter().enumerate() {
        let pct = 100 - (100 * (i as u64 + 1)) / node_fbws.len() as u64;
        // two file sizes on the same percentile: go with the smaller one
        if pct == prev_pct {
            continue;
        }
        for (f, &size) in FILE_SIZES.iter().enumerate() {
            if *bw > size as u64 * 1024 && size > prev_size {
                let next_f = f.saturating_sub(1);
                file_pairs.push((pct, FILE_LABELS[&FILE_SIZES[next_f]]));
                prev_size = size;
                prev_pct = pct;
                break;
            }
        }
    }
    file_pairs.reverse();

    atomic_write(&datadir.join("bwfiles"), |out| {
        for (pct, label) in &file_pairs {
            writeln!(out, "{} {}", pct, label)?;
        }
        writeln!(out, ".")?;
        Ok(())
    })
}

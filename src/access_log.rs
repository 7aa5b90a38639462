//! Access log: periodic snapshot of resident keys, used to warm the
//! cache back up after a restart (spec.md §6.3). Framing follows the
//! teacher's length-prefixed WAL-frame convention (`pager/wal.rs`), swapped
//! from fixed-size page frames to variable-length key records.

use crate::bucket::Bucket;
use crate::hash_table::VisitControl;
use crate::scheduler::Task;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

fn shard_path(base: &Path, shard: u16, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{shard}{suffix}"));
    PathBuf::from(name)
}

/// A single shard's resident-key log file: `<path>.<shard>`, with a
/// `.next` staging file and a `.old` previous generation.
pub struct MutationLog {
    base_path: PathBuf,
    block_size: usize,
}

impl MutationLog {
    /// A log rooted at `base_path`, writing keys in `block_size`-byte
    /// flush chunks.
    pub fn new(base_path: impl Into<PathBuf>, block_size: usize) -> Self {
        Self { base_path: base_path.into(), block_size }
    }

    /// Writes `keys` for `shard` to `<path>.<shard>.next`, then atomically
    /// promotes it: the current generation (if any) becomes `.old`, and
    /// `.next` becomes the current generation. An empty `keys` deletes
    /// `.next` and leaves any prior generations untouched (an empty run
    /// is not a meaningful snapshot).
    pub fn write_shard(&self, shard: u16, keys: &[Vec<u8>]) -> io::Result<()> {
        let next_path = shard_path(&self.base_path, shard, ".next");
        if keys.is_empty() {
            let _ = fs::remove_file(&next_path);
            return Ok(());
        }

        {
            let mut file = io::BufWriter::with_capacity(self.block_size, File::create(&next_path)?);
            for key in keys {
                file.write_all(&(key.len() as u32).to_le_bytes())?;
                file.write_all(key)?;
            }
            file.flush()?;
        }

        let current_path = shard_path(&self.base_path, shard, "");
        let old_path = shard_path(&self.base_path, shard, ".old");
        if current_path.exists() {
            fs::rename(&current_path, &old_path)?;
        }
        fs::rename(&next_path, &current_path)?;
        Ok(())
    }

    /// Reads back a shard's current generation as a list of keys.
    pub fn read_shard(&self, shard: u16) -> io::Result<Vec<Vec<u8>>> {
        let path = shard_path(&self.base_path, shard, "");
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut keys = Vec::new();
        let mut pos = 0;
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                break;
            }
            keys.push(bytes[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(keys)
    }
}

/// Sweeps a bucket's partitions for resident keys and writes one
/// [`MutationLog`] shard per partition, when the bucket's overall
/// resident ratio has dropped to or below the configured threshold.
pub struct AccessScanner {
    bucket: Arc<Bucket>,
    log: MutationLog,
}

impl AccessScanner {
    /// Builds a scanner writing shard files under `base_path`.
    pub fn new(bucket: Arc<Bucket>, base_path: impl Into<PathBuf>) -> Self {
        let block_size = bucket.config().access_log_block_size;
        Self { bucket, log: MutationLog::new(base_path, block_size) }
    }

    fn resident_ratio(&self) -> f64 {
        let mut resident = 0usize;
        let mut total = 0usize;
        for partition in self.bucket.partitions() {
            partition.hash_table().visit(None, |sv| {
                total += 1;
                if sv.is_resident() {
                    resident += 1;
                }
                VisitControl::Continue
            });
        }
        if total == 0 {
            1.0
        } else {
            resident as f64 / total as f64
        }
    }

    /// Runs one scan pass if the resident ratio warrants it. Returns the
    /// number of shards written.
    pub fn scan_if_due(&self) -> usize {
        let threshold = self.bucket.config().access_scanner_resident_ratio;
        if self.resident_ratio() > threshold {
            return 0;
        }
        let mut written = 0;
        for partition in self.bucket.partitions() {
            let mut keys = Vec::new();
            partition.hash_table().visit(None, |sv| {
                if sv.is_resident() && !sv.is_temp() {
                    keys.push(sv.key.bytes.clone());
                }
                VisitControl::Continue
            });
            match self.log.write_shard(partition.id, &keys) {
                Ok(()) => written += 1,
                Err(e) => warn!(partition = partition.id, error = %e, "access log write failed"),
            }
        }
        debug!(shards = written, bucket = %self.bucket.name, "access scanner wrote shards");
        written
    }
}

impl Task for AccessScanner {
    fn run(&mut self) -> (bool, f64) {
        self.scan_if_due();
        (true, 60.0)
    }

    fn name(&self) -> &str {
        "access_scanner"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_shard_round_trips() {
        let dir = tempdir().unwrap();
        let log = MutationLog::new(dir.path().join("access"), 4096);
        log.write_shard(0, &[b"a".to_vec(), b"bb".to_vec()]).unwrap();
        let read_back = log.read_shard(0).unwrap();
        assert_eq!(read_back, vec![b"a".to_vec(), b"bb".to_vec()]);
    }

    #[test]
    fn empty_run_deletes_next_and_keeps_prior_generation() {
        let dir = tempdir().unwrap();
        let log = MutationLog::new(dir.path().join("access"), 4096);
        log.write_shard(0, &[b"a".to_vec()]).unwrap();
        log.write_shard(0, &[]).unwrap();
        let read_back = log.read_shard(0).unwrap();
        assert_eq!(read_back, vec![b"a".to_vec()]);
    }

    #[test]
    fn second_write_demotes_prior_generation_to_old() {
        let dir = tempdir().unwrap();
        let log = MutationLog::new(dir.path().join("access"), 4096);
        log.write_shard(0, &[b"a".to_vec()]).unwrap();
        log.write_shard(0, &[b"b".to_vec()]).unwrap();
        let old_path = shard_path(&dir.path().join("access"), 0, ".old");
        assert!(old_path.exists());
    }
}

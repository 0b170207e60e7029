//! Aggregates sampled stacks and streams them to a binary CPU profile.
//!
//! File layout, in native-endian machine words:
//!
//! ```text
//! header   0, 3, 0, sampling_period_usec, 0
//! record   count, depth, pc_1 .. pc_depth      (repeated)
//! trailer  0, 1, 0
//! ```
//!
//! followed by the text of `/proc/self/maps`.
//!
//! [`ProfileData::add`] runs in signal context: it does not allocate, lock,
//! or log, and writes evicted records with plain `write(2)`.

use crate::error::{Error, Result};
use crate::proc_maps::write_proc_self_maps;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::info;

/// Deepest stack kept per sample
pub const MAX_STACK_DEPTH: usize = 254;

const BUCKETS: usize = 1024;
const ASSOCIATIVITY: usize = 4;

/// Words buffered before evicted records are written out
const BUFFER_LENGTH: usize = 1 << 18;

const WORD: usize = std::mem::size_of::<usize>();

#[derive(Clone, Copy)]
struct Entry {
    count: usize,
    depth: usize,
    stack: [usize; MAX_STACK_DEPTH],
}

const EMPTY_ENTRY: Entry = Entry {
    count: 0,
    depth: 0,
    stack: [0; MAX_STACK_DEPTH],
};

#[derive(Clone, Copy)]
struct Bucket {
    entries: [Entry; ASSOCIATIVITY],
}

/// Collector settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    /// Samples per second; recorded in the header as a period
    pub frequency: u32,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        CollectorOptions {
            frequency: crate::config::DEFAULT_FREQUENCY,
        }
    }
}

/// Hashed, 4-way associative table of sampled stacks in front of an
/// eviction buffer.
pub struct ProfileData {
    hash: Option<Box<[Bucket]>>,
    evict: Option<Box<[usize]>>,
    num_evicted: usize,
    out: Option<File>,
    fd: RawFd,
    count: usize,
    evictions: usize,
    total_bytes: usize,
    fname: Option<PathBuf>,
}

impl Default for ProfileData {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileData {
    pub const fn new() -> Self {
        ProfileData {
            hash: None,
            evict: None,
            num_evicted: 0,
            out: None,
            fd: -1,
            count: 0,
            evictions: 0,
            total_bytes: 0,
            fname: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.out.is_some()
    }

    /// Open `fname` and begin collecting.
    pub fn start(&mut self, fname: &Path, options: CollectorOptions) -> Result<()> {
        if self.enabled() {
            return Err(Error::AlreadyStarted);
        }
        if options.frequency == 0 {
            return Err(Error::InvalidArgument("sampling frequency must be positive".into()));
        }

        let file = File::create(fname)?;
        self.reset();

        let empty = Bucket {
            entries: [EMPTY_ENTRY; ASSOCIATIVITY],
        };
        self.hash = Some(vec![empty; BUCKETS].into_boxed_slice());
        let mut evict = vec![0usize; BUFFER_LENGTH].into_boxed_slice();

        // Header
        let period_usec = 1_000_000 / options.frequency as usize;
        evict[..5].copy_from_slice(&[0, 3, 0, period_usec, 0]);
        self.num_evicted = 5;
        self.evict = Some(evict);

        self.fd = file.as_raw_fd();
        self.out = Some(file);
        self.fname = Some(fname.to_path_buf());
        Ok(())
    }

    /// Record one sampled stack. Signal safe.
    pub fn add(&mut self, stack: &[usize]) {
        if !self.enabled() || stack.is_empty() {
            return;
        }
        let stack = &stack[..stack.len().min(MAX_STACK_DEPTH)];

        let mut h: usize = 0;
        for &slot in stack {
            h = h.rotate_left(8);
            h = h
                .wrapping_add(slot.wrapping_mul(31))
                .wrapping_add(slot.wrapping_mul(7))
                .wrapping_add(slot.wrapping_mul(3));
        }

        self.count += 1;

        let Some(hash) = self.hash.as_mut() else {
            return;
        };
        let bucket = &mut hash[h % BUCKETS];

        for entry in bucket.entries.iter_mut() {
            if entry.depth == stack.len() && &entry.stack[..entry.depth] == stack {
                entry.count += 1;
                return;
            }
        }

        // Replace the entry with the smallest count
        let mut victim = 0;
        for a in 1..ASSOCIATIVITY {
            if bucket.entries[a].count < bucket.entries[victim].count {
                victim = a;
            }
        }
        let old = bucket.entries[victim];
        if old.count > 0 {
            self.evictions += 1;
            self.evict_entry(&old);
        }

        let Some(hash) = self.hash.as_mut() else {
            return;
        };
        let entry = &mut hash[h % BUCKETS].entries[victim];
        entry.count = 1;
        entry.depth = stack.len();
        entry.stack[..stack.len()].copy_from_slice(stack);
    }

    fn evict_entry(&mut self, entry: &Entry) {
        let words = 2 + entry.depth;
        if self.num_evicted + words > BUFFER_LENGTH {
            self.flush_evicted();
        }
        let Some(evict) = self.evict.as_mut() else {
            return;
        };
        let n = self.num_evicted;
        evict[n] = entry.count;
        evict[n + 1] = entry.depth;
        evict[n + 2..n + words].copy_from_slice(&entry.stack[..entry.depth]);
        self.num_evicted += words;
    }

    fn flush_evicted(&mut self) {
        if self.num_evicted == 0 {
            return;
        }
        if let Some(evict) = self.evict.as_ref() {
            let bytes = self.num_evicted * WORD;
            // SAFETY: reinterpreting initialized words as bytes
            let buf = unsafe { std::slice::from_raw_parts(evict.as_ptr() as *const u8, bytes) };
            write_fd(self.fd, buf);
            self.total_bytes += bytes;
        }
        self.num_evicted = 0;
    }

    /// Evict every aggregated stack to the output file.
    pub fn flush_table(&mut self) {
        if !self.enabled() {
            return;
        }
        if let Some(mut hash) = self.hash.take() {
            for bucket in hash.iter_mut() {
                for entry in bucket.entries.iter_mut() {
                    if entry.count > 0 {
                        self.evict_entry(entry);
                        entry.count = 0;
                    }
                }
            }
            self.hash = Some(hash);
        }
        self.flush_evicted();
    }

    /// Flush, write the trailer and mappings, and close the file.
    pub fn stop(&mut self) {
        if !self.enabled() {
            return;
        }
        self.flush_table();

        // Trailer
        if self.num_evicted + 3 > BUFFER_LENGTH {
            self.flush_evicted();
        }
        if let Some(evict) = self.evict.as_mut() {
            let n = self.num_evicted;
            evict[n..n + 3].copy_from_slice(&[0, 1, 0]);
            self.num_evicted += 3;
        }
        self.flush_evicted();

        if let Some(mut out) = self.out.take() {
            if let Err(e) = write_proc_self_maps(&mut out) {
                tracing::warn!(error = %e, "cannot append memory map to CPU profile");
            }
        }

        info!(
            interrupts = self.count,
            evictions = self.evictions,
            bytes = self.total_bytes,
            profile = %self.fname.as_deref().unwrap_or(Path::new("")).display(),
            "CPU profile finished"
        );
        self.reset();
    }

    fn reset(&mut self) {
        self.out = None;
        self.fd = -1;
        self.hash = None;
        self.evict = None;
        self.num_evicted = 0;
        self.count = 0;
        self.evictions = 0;
        self.total_bytes = 0;
        self.fname = None;
    }
}

/// `write(2)` until everything is written or a hard error occurs.
fn write_fd(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        buf = &buf[n as usize..];
    }
}

impl Drop for ProfileData {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Parsed profile: header, records keyed by stack, and the mapping text
    struct Parsed {
        header: Vec<usize>,
        records: HashMap<Vec<usize>, usize>,
        maps: String,
    }

    fn parse(path: &Path) -> Parsed {
        let bytes = std::fs::read(path).unwrap();
        let word = |i: usize| {
            let mut w = [0u8; WORD];
            w.copy_from_slice(&bytes[i * WORD..(i + 1) * WORD]);
            usize::from_ne_bytes(w)
        };

        let header: Vec<usize> = (0..5).map(word).collect();
        let mut records = HashMap::new();
        let mut pos = 5;
        loop {
            let count = word(pos);
            let depth = word(pos + 1);
            let stack: Vec<usize> = (pos + 2..pos + 2 + depth).map(word).collect();
            pos += 2 + depth;
            if count == 0 && stack == [0] {
                break;
            }
            *records.entry(stack).or_insert(0) += count;
        }
        let maps = String::from_utf8_lossy(&bytes[pos * WORD..]).into_owned();
        Parsed {
            header,
            records,
            maps,
        }
    }

    #[test]
    fn aggregates_identical_stacks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cpu.prof");
        let mut data = ProfileData::new();
        data.start(&path, CollectorOptions { frequency: 100 }).unwrap();

        data.add(&[0x10, 0x20, 0x30]);
        data.add(&[0x10, 0x20, 0x30]);
        data.add(&[0x40]);
        data.stop();
        assert!(!data.enabled());

        let parsed = parse(&path);
        assert_eq!(parsed.header, vec![0, 3, 0, 10_000, 0]);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[&vec![0x10, 0x20, 0x30]], 2);
        assert_eq!(parsed.records[&vec![0x40]], 1);
        if cfg!(target_os = "linux") {
            assert!(!parsed.maps.is_empty());
        }
    }

    #[test]
    fn flush_table_writes_and_clears_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cpu.prof");
        let mut data = ProfileData::new();
        data.start(&path, CollectorOptions::default()).unwrap();

        data.add(&[0x1]);
        data.flush_table();
        let flushed = std::fs::metadata(&path).unwrap().len();
        assert_eq!(flushed as usize, (5 + 3) * WORD);

        // Nothing new to write
        data.flush_table();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), flushed);

        data.add(&[0x1]);
        data.stop();
        assert_eq!(parse(&path).records[&vec![0x1]], 2);
    }

    #[test]
    fn evicts_when_a_bucket_overflows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cpu.prof");
        let mut data = ProfileData::new();
        data.start(&path, CollectorOptions::default()).unwrap();

        // Many distinct stacks force collisions in some bucket
        for pc in 1..=(BUCKETS * ASSOCIATIVITY * 2) {
            data.add(&[pc * 16]);
        }
        assert!(data.evictions > 0);
        data.stop();

        let parsed = parse(&path);
        assert_eq!(parsed.records.len(), BUCKETS * ASSOCIATIVITY * 2);
        assert!(parsed.records.values().all(|&c| c == 1));
    }

    #[test]
    fn rejects_double_start_and_truncates_deep_stacks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cpu.prof");
        let mut data = ProfileData::new();
        data.start(&path, CollectorOptions::default()).unwrap();
        assert!(matches!(
            data.start(&path, CollectorOptions::default()),
            Err(Error::AlreadyStarted)
        ));

        let deep: Vec<usize> = (1..=300).collect();
        data.add(&deep);
        data.stop();
        let parsed = parse(&path);
        let (stack, _) = parsed.records.iter().next().unwrap();
        assert_eq!(stack.len(), MAX_STACK_DEPTH);
    }

    #[test]
    fn start_fails_for_unwritable_path() {
        let mut data = ProfileData::new();
        let err = data
            .start(Path::new("/nonexistent/dir/cpu.prof"), CollectorOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!data.enabled());
    }
}

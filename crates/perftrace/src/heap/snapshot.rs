//! Point-in-time copies of the allocation table and leak reporting.

use super::address_map::AddressMap;
use super::bucket::{unparse, BucketId, Stats};
use super::table::{AllocInfo, AllocValue, HeapProfileTable, PROFILE_HEADER};
use crate::arena::{LibcAllocator, RawAllocator};
use crate::error::Result;
use crate::proc_maps::write_mapped_libraries;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{error, warn};

/// Leak groups logged individually; the rest are only summed
const MAX_LEAKS_TO_LOG: usize = 20;

/// Frames printed per logged leak group
const MAX_FRAMES_TO_LOG: usize = 8;

/// Independent copy of (part of) a [`HeapProfileTable`].
///
/// Bucket handles point into the table that produced the snapshot, so the
/// snapshot is only meaningful together with that table.
pub struct Snapshot<A: RawAllocator + Clone = LibcAllocator> {
    table_id: u64,
    total: Stats,
    map: AddressMap<AllocValue, A>,
}

/// Leaked objects sharing one allocation stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakGroup {
    pub bytes: u64,
    pub objects: u64,
    pub call_stack: Vec<usize>,
}

/// Result of [`Snapshot::report_leaks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    pub leaked_bytes: u64,
    pub leaked_objects: u64,
    /// Largest first
    pub groups: Vec<LeakGroup>,
}

impl LeakReport {
    pub fn is_empty(&self) -> bool {
        self.leaked_objects == 0
    }

    /// Log the totals and the largest groups. Nothing is logged for an
    /// empty report.
    pub fn log(&self, checker_name: &str) {
        if self.is_empty() {
            return;
        }
        error!(
            checker = checker_name,
            bytes = self.leaked_bytes,
            objects = self.leaked_objects,
            "leak check detected leaks"
        );
        for group in self.groups.iter().take(MAX_LEAKS_TO_LOG) {
            let frames: Vec<String> = group
                .call_stack
                .iter()
                .take(MAX_FRAMES_TO_LOG)
                .map(|pc| format!("{pc:#x}"))
                .collect();
            warn!(
                checker = checker_name,
                "Leak of {} bytes in {} objects allocated from: @ {}",
                group.bytes,
                group.objects,
                frames.join(" ")
            );
        }
    }
}

/// Write a rendered leak profile followed by the process mappings.
pub(crate) fn write_leak_profile(filename: &Path, body: &[u8]) -> Result<()> {
    let mut out = BufWriter::new(File::create(filename)?);
    out.write_all(body)?;
    write_mapped_libraries(&mut out)?;
    out.flush()?;
    Ok(())
}

impl<A: RawAllocator + Clone> Snapshot<A> {
    pub(crate) fn new(table_id: u64, map: AddressMap<AllocValue, A>) -> Self {
        let mut total = Stats::default();
        map.for_each(|_, value| total.record_alloc(value.bytes));
        Snapshot {
            table_id,
            total,
            map,
        }
    }

    pub(crate) fn table_id(&self) -> u64 {
        self.table_id
    }

    /// Allocation count and bytes of the objects in this snapshot
    pub fn total(&self) -> Stats {
        self.total
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, ptr: usize) -> bool {
        self.map.contains(ptr)
    }

    fn check_table(&self, table: &HeapProfileTable<A>) {
        debug_assert_eq!(self.table_id, table.id(), "snapshot used with another table");
    }

    /// Call `f` for every allocation in the snapshot.
    pub fn iterate_allocs<F>(&self, table: &HeapProfileTable<A>, mut f: F)
    where
        F: FnMut(usize, AllocInfo<'_>),
    {
        self.check_table(table);
        self.map.for_each(|ptr, value| {
            f(
                ptr,
                AllocInfo {
                    object_size: value.bytes,
                    call_stack: table.call_stack(value.bucket),
                    live: value.live,
                    ignored: value.ignored,
                },
            )
        });
    }

    /// Per-bucket counts of the snapshot's objects
    fn group_by_bucket(&self) -> BTreeMap<BucketId, Stats> {
        let mut groups: BTreeMap<BucketId, Stats> = BTreeMap::new();
        self.map.for_each(|_, value| {
            groups.entry(value.bucket).or_default().record_alloc(value.bytes);
        });
        groups
    }

    /// Write the snapshot as a heap profile with one line per stack.
    pub fn save_profile<W: Write + ?Sized>(
        &self,
        table: &HeapProfileTable<A>,
        out: &mut W,
    ) -> io::Result<()> {
        self.write_buckets(table, out)?;
        write_mapped_libraries(out)
    }

    /// The profile without its mapping section.
    pub(crate) fn write_buckets<W: Write + ?Sized>(
        &self,
        table: &HeapProfileTable<A>,
        out: &mut W,
    ) -> io::Result<()> {
        self.check_table(table);
        let mut groups: Vec<(BucketId, Stats)> = self.group_by_bucket().into_iter().collect();
        groups.sort_by(|a, b| b.1.alloc_size.cmp(&a.1.alloc_size));

        write!(out, "{PROFILE_HEADER}")?;
        unparse(out, &self.total, &[], " heapprofile")?;
        for (bucket, stats) in &groups {
            unparse(out, stats, table.call_stack(*bucket), "")?;
        }
        Ok(())
    }

    /// Group the snapshot's objects by allocation stack, largest first.
    pub fn leak_report(&self, table: &HeapProfileTable<A>) -> LeakReport {
        self.check_table(table);
        let mut groups: Vec<LeakGroup> = self
            .group_by_bucket()
            .into_iter()
            .map(|(bucket, stats)| LeakGroup {
                bytes: stats.alloc_size,
                objects: stats.allocs,
                call_stack: table.call_stack(bucket).to_vec(),
            })
            .collect();
        groups.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(b.objects.cmp(&a.objects)));

        LeakReport {
            leaked_bytes: self.total.alloc_size,
            leaked_objects: self.total.allocs,
            groups,
        }
    }

    /// Treat every object in the snapshot as leaked: log the largest
    /// groups, write a heap profile of them to `filename`, and return the
    /// grouped report.
    pub fn report_leaks(
        &self,
        table: &HeapProfileTable<A>,
        checker_name: &str,
        filename: &Path,
    ) -> Result<LeakReport> {
        let report = self.leak_report(table);
        let mut body = Vec::new();
        self.write_buckets(table, &mut body)?;

        report.log(checker_name);
        write_leak_profile(filename, &body)?;
        Ok(report)
    }

    /// Log the address and size of every object in the snapshot.
    pub fn report_individual_objects(&self, table: &HeapProfileTable<A>) {
        self.iterate_allocs(table, |ptr, info| {
            warn!("Leaked object at {ptr:#x} of {} bytes", info.object_size);
        });
    }
}

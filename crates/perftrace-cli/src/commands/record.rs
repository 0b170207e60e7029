//! `perftrace record`: run a synthetic workload under both profilers.

use anyhow::{bail, Context};
use perftrace::cpu::activation;
use perftrace::{heap_profiler, HeapProfilerConfig, ProfilerOptions};
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::hint::black_box;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Buffers each worker keeps alive at once
const RETAINED_PER_WORKER: usize = 64;
/// Objects each worker leaks on purpose
const LEAKS_PER_WORKER: usize = 16;
/// Iterations between deliberate leaks
const LEAK_EVERY: u64 = 500;

#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub prefix: PathBuf,
    pub duration: Option<Duration>,
    pub cpu_freq: u32,
    pub threads: usize,
    pub sample_interval: usize,
}

/// Files written by a recording, and what they hold
#[derive(Debug, Clone)]
pub struct RecordSummary {
    pub cpu_profile: PathBuf,
    pub heap_profile: Option<PathBuf>,
    pub leak_profile: PathBuf,
    pub sampled_profile: PathBuf,
    pub cpu_samples: usize,
    pub iterations: u64,
    pub leaked_bytes: u64,
    pub leaked_objects: u64,
    pub sampled_traces: usize,
}

/// `prefix` + `suffix`
fn profile_path(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Run the record command until the duration elapses or Ctrl-C
pub fn run(options: &RecordOptions) -> anyhow::Result<RecordSummary> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;

    if options.duration.is_none() {
        eprintln!("Recording (Ctrl-C to stop)...");
    }
    record(options, running)
}

/// Record until `running` is cleared or the duration elapses.
pub fn record(options: &RecordOptions, running: Arc<AtomicBool>) -> anyhow::Result<RecordSummary> {
    let cpu_profile = profile_path(&options.prefix, ".prof");
    let leak_profile = profile_path(&options.prefix, ".leaks.heap");
    let sampled_profile = profile_path(&options.prefix, ".sampled.heap");

    let heap = heap_profiler();
    let heap_config = HeapProfilerConfig::default()
        .with_sample_interval(options.sample_interval)
        .with_prefix(&options.prefix);
    if !heap.start(&heap_config) {
        bail!("heap profiler is already running");
    }
    let result = record_with_heap(options, running, &cpu_profile, &leak_profile, &sampled_profile);
    // Already stopped unless recording failed part way
    activation::global().stop();
    heap.stop();
    result
}

fn record_with_heap(
    options: &RecordOptions,
    running: Arc<AtomicBool>,
    cpu_profile: &Path,
    leak_profile: &Path,
    sampled_profile: &Path,
) -> anyhow::Result<RecordSummary> {
    let heap = heap_profiler();
    let baseline = heap
        .take_snapshot()
        .context("cannot snapshot the heap profile table")?;

    let cpu = activation::global();
    cpu.start(cpu_profile, &ProfilerOptions::new().with_frequency(options.cpu_freq))
        .with_context(|| format!("cannot start CPU profiler for {}", cpu_profile.display()))?;

    let deadline = options.duration.map(|d| Instant::now() + d);
    let workers: Vec<_> = (0..options.threads)
        .map(|id| {
            let running = running.clone();
            std::thread::Builder::new()
                .name(format!("perftrace-worker-{id}"))
                .spawn(move || workload(id, &running, deadline))
        })
        .collect::<Result<_, _>>()
        .context("cannot spawn workload threads")?;

    let mut retained = Vec::new();
    let mut iterations = 0;
    for worker in workers {
        let outcome = worker
            .join()
            .map_err(|_| anyhow::anyhow!("workload thread panicked"))?;
        iterations += outcome.iterations;
        retained.extend(outcome.retained);
    }

    let cpu_samples = cpu.current_state().samples_gathered;
    cpu.stop();
    info!(profile = %cpu_profile.display(), samples = cpu_samples, "CPU profile written");

    let heap_profile = heap.dump_next().context("cannot write heap profile")?;

    // Anything still referenced by the workload is not a leak
    for buffer in &retained {
        heap.mark_as_live(buffer.as_ptr() as *const u8);
    }
    let leaks = heap
        .non_live_snapshot(Some(&baseline))
        .context("cannot snapshot non-live allocations")?;
    let report = heap
        .report_leaks(&leaks, "record", leak_profile)
        .context("cannot write leak report")?;
    drop(leaks);
    drop(baseline);

    let sampled_traces = heap
        .dump_sampled(sampled_profile)
        .context("cannot write sampled heap traces")?;
    debug!(retained = retained.len(), "releasing workload buffers");
    drop(retained);

    Ok(RecordSummary {
        cpu_profile: cpu_profile.to_path_buf(),
        heap_profile,
        leak_profile: leak_profile.to_path_buf(),
        sampled_profile: sampled_profile.to_path_buf(),
        cpu_samples,
        iterations,
        leaked_bytes: report.leaked_bytes,
        leaked_objects: report.leaked_objects,
        sampled_traces,
    })
}

struct WorkerOutcome {
    iterations: u64,
    retained: Vec<Box<[u64]>>,
}

/// Allocation-heavy busy work: rolling buffers, short-lived maps and a
/// few deliberate leaks.
fn workload(id: usize, running: &AtomicBool, deadline: Option<Instant>) -> WorkerOutcome {
    let mut retained: VecDeque<Box<[u64]>> = VecDeque::with_capacity(RETAINED_PER_WORKER);
    let mut leaked = 0;
    let mut iterations = 0u64;
    let mut checksum = id as u64;

    while running.load(Ordering::Relaxed) && deadline.is_none_or(|d| Instant::now() < d) {
        let len = 16 + (iterations as usize * 37 + id * 11) % 1024;
        let buffer = fill_buffer(len, checksum);
        checksum = checksum.wrapping_add(buffer.iter().fold(0u64, |acc, &x| acc ^ x));

        if retained.len() == RETAINED_PER_WORKER {
            retained.pop_front();
        }
        retained.push_back(buffer);

        if iterations % 16 == 0 {
            checksum ^= index_words(id, iterations);
        }

        if iterations % LEAK_EVERY == 0 && leaked < LEAKS_PER_WORKER {
            Box::leak(black_box(vec![checksum; 16].into_boxed_slice()));
            leaked += 1;
        }

        iterations += 1;
    }

    black_box(checksum);
    WorkerOutcome {
        iterations,
        retained: retained.into(),
    }
}

#[inline(never)]
fn fill_buffer(len: usize, seed: u64) -> Box<[u64]> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        })
        .collect()
}

#[inline(never)]
fn index_words(id: usize, iteration: u64) -> u64 {
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for i in 0..32 {
        let word = format!("w{}-{}", id, (iteration + i) % 97);
        *index.entry(word).or_insert(0) += 1;
    }
    index.values().map(|&n| n as u64).sum::<u64>() + index.len() as u64
}

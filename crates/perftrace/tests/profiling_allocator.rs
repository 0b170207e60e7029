use perftrace::{heap_profiler, HeapProfilerConfig};
use std::hint::black_box;
use tempfile::TempDir;

perftrace::profiler!();

/// One test: the heap profiler is process-wide and would see the
/// allocations of concurrently running tests.
#[test]
fn allocations_are_tracked_through_the_global_allocator() {
    let dir = TempDir::new().unwrap();
    let config = HeapProfilerConfig::default()
        .with_sample_interval(1)
        .with_prefix(dir.path().join("app"));
    assert!(heap_profiler().start(&config));
    assert!(!heap_profiler().start(&config));

    let kept = black_box(vec![7u8; 4096]);
    let addr = kept.as_ptr();
    let found = heap_profiler().with_table(|table| table.find_alloc(addr as usize));
    assert_eq!(found, Some(Some(4096)));

    let leaked = Box::leak(black_box(Box::new([1u64; 64])));
    let baseline = heap_profiler().take_snapshot().unwrap();

    let temp = black_box(vec![0u32; 100]);
    let temp_addr = temp.as_ptr() as usize;
    drop(temp);
    assert_eq!(
        heap_profiler().with_table(|table| table.find_alloc(temp_addr)),
        Some(None)
    );

    // Interior pointers resolve to the owning block
    let inside = unsafe { addr.add(100) } as usize;
    assert_eq!(
        heap_profiler().with_table(|t| t.find_inside_alloc(inside, 1 << 20)),
        Some(Some((addr as usize, 4096)))
    );

    // Leak check: `kept` is still referenced, `leaked` is not
    let late = Box::leak(black_box(Box::new([2u64; 32])));
    assert!(heap_profiler().mark_as_live(addr));
    let leaks = heap_profiler().non_live_snapshot(Some(&baseline)).unwrap();
    assert!(leaks.contains(late.as_ptr() as usize));
    assert!(!leaks.contains(leaked.as_ptr() as usize));
    assert!(!leaks.contains(addr as usize));

    let report_path = dir.path().join("app.leaks.heap");
    let report = heap_profiler()
        .report_leaks(&leaks, "integration", &report_path)
        .unwrap();
    assert!(report.leaked_bytes >= 256);
    assert!(report_path.exists());

    let dumped = heap_profiler().dump_next().unwrap().unwrap();
    assert_eq!(dumped, dir.path().join("app.0001.heap"));
    let text = std::fs::read_to_string(&dumped).unwrap();
    assert!(text.starts_with("heap profile: "));

    let sampled = heap_profiler()
        .dump_sampled(&dir.path().join("app.sampled.heap"))
        .unwrap();
    assert!(sampled > 0);

    drop(leaks);
    drop(baseline);
    drop(kept);
    assert!(heap_profiler().stop());
    assert!(!heap_profiler().is_running());
}

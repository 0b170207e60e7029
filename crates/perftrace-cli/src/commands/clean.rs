use perftrace::HeapProfileTable;
use std::path::Path;

/// Run the clean command, returning the number of removed profiles
pub fn run(prefix: &Path) -> usize {
    let removed = HeapProfileTable::cleanup_old_profiles(prefix);
    println!("Removed {removed} heap profile(s) matching {}.*.heap", prefix.display());
    removed
}

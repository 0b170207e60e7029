use comfy_table::{presets::UTF8_FULL, Cell, CellAlignment, Table};
use perftrace::heap::FILE_EXT;
use perftrace::Result;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// CPU profile extension
pub const CPU_EXT: &str = ".prof";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Cpu,
    Heap,
}

impl ProfileKind {
    fn of(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(CPU_EXT) {
            Some(ProfileKind::Cpu)
        } else if name.ends_with(FILE_EXT) {
            Some(ProfileKind::Heap)
        } else {
            None
        }
    }

    fn label(self) -> &'static str {
        match self {
            ProfileKind::Cpu => "cpu",
            ProfileKind::Heap => "heap",
        }
    }
}

/// A profile file found on disk
#[derive(Debug, Clone)]
pub struct ProfileFile {
    pub path: PathBuf,
    pub kind: ProfileKind,
    pub size: u64,
    pub modified: SystemTime,
}

/// Find CPU and heap profiles in a directory, most recent first
pub fn find_profiles(dir: &Path) -> Result<Vec<ProfileFile>> {
    let mut profiles = Vec::new();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let Some(kind) = ProfileKind::of(&path) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        profiles.push(ProfileFile {
            path,
            kind,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    profiles.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(profiles)
}

fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= KIB * KIB {
        format!("{:.1} MiB", b / (KIB * KIB))
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}

/// Run the list command
pub fn run(dir: Option<&Path>) -> Result<()> {
    let search_dir = dir.unwrap_or_else(|| Path::new("."));
    let profiles = find_profiles(search_dir)?;

    if profiles.is_empty() {
        println!("No profiles found in {}", search_dir.display());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["FILE", "KIND", "SIZE", "MODIFIED"]);

    for profile in &profiles {
        let filename = profile
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let modified = chrono::DateTime::<chrono::Local>::from(profile.modified)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        table.add_row(vec![
            Cell::new(filename),
            Cell::new(profile.kind.label()),
            Cell::new(format_size(profile.size)).set_alignment(CellAlignment::Right),
            Cell::new(modified),
        ]);
    }

    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn finds_only_profiles() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.prof"), [0u8; 40]).unwrap();
        std::fs::write(dir.path().join("app.0001.heap"), "heap profile: ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("dir.heap")).unwrap();

        let mut found = find_profiles(dir.path()).unwrap();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, ProfileKind::Heap);
        assert_eq!(found[1].kind, ProfileKind::Cpu);
        assert_eq!(found[1].size, 40);
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(find_profiles(Path::new("/nonexistent/profiles")).is_err());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }
}

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};

const PROC_SELF_MAPS: &str = "/proc/self/maps";

/// Append the text of `/proc/self/maps` to `out`.
///
/// A missing procfs is not an error; profiles are still usable without the
/// mapping section.
pub(crate) fn write_proc_self_maps<W: Write + ?Sized>(out: &mut W) -> io::Result<()> {
    let mut file = match File::open(PROC_SELF_MAPS) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut buf = [0u8; 4096];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        out.write_all(&buf[..n])?;
    }
}

/// The `MAPPED_LIBRARIES:` section that ends every heap profile.
pub(crate) fn write_mapped_libraries<W: Write + ?Sized>(out: &mut W) -> io::Result<()> {
    write!(out, "\nMAPPED_LIBRARIES:\n")?;
    write_proc_self_maps(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn copies_mapping_text() {
        let mut out = Vec::new();
        write_proc_self_maps(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().count() > 0);
        assert!(text.lines().all(|line| line.contains('-')));
    }
}

//! Gzip-compressed tar writer for staged script trees.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Write `files` (relative to `stage`) into a `.tar.gz` at `out`.
///
/// Only regular files get entries; directories are implied by member paths.
/// Member headers carry the staged files' mtimes and modes.
pub fn write_tar_gz(stage: &Path, files: &[PathBuf], out: &Path) -> io::Result<u64> {
    let file = File::create(out)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for rel in files {
        builder.append_path_with_name(stage.join(rel), rel)?;
    }

    builder.into_inner()?.finish()?.sync_all()?;
    Ok(std::fs::metadata(out)?.len())
}

/// Member paths of a `.tar.gz`, in archive order.
pub fn list_entries(archive: &Path) -> io::Result<Vec<String>> {
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    let mut names = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_members_keep_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path().join("stage");
        fs::create_dir_all(stage.join("customtestlibs")).unwrap();
        fs::write(stage.join("pingtest.py"), "ping").unwrap();
        fs::write(stage.join("customtestlibs/device_test.py"), "dev").unwrap();

        let out = dir.path().join("pingtest.tgz");
        let files = vec![
            PathBuf::from("customtestlibs/device_test.py"),
            PathBuf::from("pingtest.py"),
        ];
        let size = write_tar_gz(&stage, &files, &out).unwrap();
        assert!(size > 0);

        assert_eq!(
            list_entries(&out).unwrap(),
            vec!["customtestlibs/device_test.py", "pingtest.py"]
        );
    }

    #[test]
    fn test_missing_member_fails() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("x.tgz");
        let res = write_tar_gz(dir.path(), &[PathBuf::from("absent.py")], &out);
        assert!(res.is_err());
    }
}

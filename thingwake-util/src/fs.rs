use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::crypto::{ALPHA_NUM, pseudorandom_string};

/// Replace the file at `path` with `buf` so that a power cut leaves either
/// the old or the new contents, never a mix.
///
/// The contents go to a sibling temp file which is synced, renamed over the
/// target and then the directory itself is synced so the rename sticks.
/// See [Ensuring data reaches disk](https://lwn.net/Articles/457667/).
pub fn safe_write_all<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension(format!("tmp-{}", pseudorandom_string(ALPHA_NUM, 6)));

    let written = write_synced(&tmp_path, buf.as_ref()).and_then(|()| fs::rename(&tmp_path, path));
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written?;

    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        // not every platform allows syncing a directory handle
        let _ = dir.sync_all();
    }
    Ok(())
}

fn write_synced(path: &Path, buf: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(buf)?;
    file.sync_all()
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reassembling console output from the zone console logs.

use crate::Error;
use camino::{Utf8Path, Utf8PathBuf};
use std::io::{Read, Seek, SeekFrom};
use std::time::SystemTime;

/// Most console output returned at once.
pub const MAX_CONSOLE_BYTES: u64 = 100 * 1024;

/// Returns the tail of the console output of zone `name`.
///
/// Log files are taken newest first and prepended until the cap is reached.
/// The oldest fragment then usually starts mid-line; that partial line is
/// dropped.
pub fn console_output(dir: &Utf8Path, name: &str) -> Result<String, Error> {
    console_output_capped(dir, name, MAX_CONSOLE_BYTES)
}

fn console_output_capped(
    dir: &Utf8Path,
    name: &str,
    cap: u64,
) -> Result<String, Error> {
    let mut logs: Vec<(SystemTime, u64, Utf8PathBuf)> = vec![];
    for path in log_files(dir, name) {
        let metadata =
            std::fs::metadata(&path).map_err(|err| Error::io(&path, err))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        logs.push((modified, metadata.len(), path));
    }
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut output: Vec<u8> = vec![];
    let mut avail = cap;
    for (_, size, path) in logs {
        if size == 0 {
            continue;
        }
        let mut file =
            std::fs::File::open(&path).map_err(|err| Error::io(&path, err))?;
        let mut fragment = vec![];
        if size > avail {
            file.seek(SeekFrom::End(-(avail as i64)))
                .and_then(|_| file.read_to_end(&mut fragment))
                .map_err(|err| Error::io(&path, err))?;
            let start = fragment
                .iter()
                .position(|b| *b == b'\n')
                .map_or(fragment.len(), |newline| newline + 1);
            fragment.drain(..start);
            fragment.extend(output);
            output = fragment;
            break;
        }
        file.read_to_end(&mut fragment).map_err(|err| Error::io(&path, err))?;
        avail -= size;
        fragment.extend(output);
        output = fragment;
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

fn log_files(dir: &Utf8Path, name: &str) -> Vec<Utf8PathBuf> {
    let pattern = format!(
        "{}/{}.console*",
        glob::Pattern::escape(dir.as_str()),
        glob::Pattern::escape(name)
    );
    let Ok(paths) = glob::glob(&pattern) else {
        return vec![];
    };
    paths
        .filter_map(Result::ok)
        .filter_map(|path| Utf8PathBuf::try_from(path).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use std::time::Duration;

    fn write_log(dir: &Utf8Path, file: &str, contents: &str, age_secs: u64) {
        let path = dir.join(file);
        std::fs::write(&path, contents).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn reassembles_rotated_logs() {
        let dir = Utf8TempDir::new().unwrap();
        write_log(dir.path(), "z1.console.1", "booting\n", 60);
        write_log(dir.path(), "z1.console", "login:\n", 0);
        write_log(dir.path(), "z1.console.2", "", 120);
        write_log(dir.path(), "z2.console", "other zone\n", 0);

        assert_eq!(
            console_output(dir.path(), "z1").unwrap(),
            "booting\nlogin:\n"
        );
        assert_eq!(console_output(dir.path(), "z3").unwrap(), "");
    }

    #[test]
    fn cap_drops_partial_line() {
        let dir = Utf8TempDir::new().unwrap();
        write_log(dir.path(), "z1.console.1", "first line\nsecond\n", 60);
        write_log(dir.path(), "z1.console", "newest\n", 0);

        // 7 bytes of "newest\n" leave 10 for the older file: "ne\nsecond\n"
        // whose partial first line is dropped.
        let output = console_output_capped(dir.path(), "z1", 17).unwrap();
        assert_eq!(output, "second\nnewest\n");
    }
}

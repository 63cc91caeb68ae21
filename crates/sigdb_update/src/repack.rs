//! Rebuilding an installable archive from a patched working copy.

use std::io::Read;
use std::path::Path;

use fs_err as fs;
use sigdb_cvd::{ArchiveBuilder, HEADER_SIZE};

use crate::config::UpdateConfig;
use crate::UpdateError;

/// Builds a live archive at `dest` from the working copy in `workdir`.
///
/// The new header is the first line of `<db>.info`, space-padded to the full
/// header size. The body is a tar stream of the working copy with `COPYING`
/// first (and required), then `<db>.info` and `daily.cfg` when present, then
/// every other entry in directory iteration order.
pub(crate) fn build_local_archive(
    config: &UpdateConfig,
    workdir: &Path,
    database: &str,
    dest: &Path,
) -> Result<(), UpdateError> {
    match build(config, workdir, database, dest) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(dest);
            Err(err)
        }
    }
}

fn build(
    config: &UpdateConfig,
    workdir: &Path,
    database: &str,
    dest: &Path,
) -> Result<(), UpdateError> {
    let info_name = format!("{database}.info");
    let header = header_from_info(&workdir.join(&info_name))?;

    let mut builder = ArchiveBuilder::create(dest, &header, config.compress_local_db)
        .map_err(|err| UpdateError::FailedUpdate(err.to_string()))?;

    if !workdir.join("COPYING").is_file() {
        tracing::error!("COPYING file not found in working copy");
        return Err(UpdateError::FailedUpdate("COPYING file not found".to_owned()));
    }
    let mut packed = vec!["COPYING".to_owned()];
    if workdir.join(&info_name).is_file() {
        packed.push(info_name.clone());
    }
    if workdir.join("daily.cfg").is_file() {
        packed.push("daily.cfg".to_owned());
    }
    for name in &packed {
        append(&mut builder, workdir, name, database)?;
    }

    for entry in fs::read_dir(workdir).map_err(|_| UpdateError::Directory(workdir.to_path_buf()))? {
        let entry = entry.map_err(|_| UpdateError::Directory(workdir.to_path_buf()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if packed.iter().any(|already| already.as_str() == name) {
            continue;
        }
        append(&mut builder, workdir, name, database)?;
    }

    builder
        .finish()
        .map_err(|err| UpdateError::FailedUpdate(err.to_string()))
}

fn append(
    builder: &mut ArchiveBuilder,
    workdir: &Path,
    name: &str,
    database: &str,
) -> Result<(), UpdateError> {
    builder.append_file(workdir, name).map_err(|err| {
        tracing::error!(
            file = name,
            error = %err,
            "can't add file to new {database}.cld, check available disk space"
        );
        UpdateError::FailedUpdate(format!("can't add {name} to archive"))
    })
}

/// Reads the header block out of the working copy's `.info` file: the first
/// line becomes the header, everything from the newline onward is blanked
/// with spaces.
fn header_from_info(info: &Path) -> Result<[u8; HEADER_SIZE], UpdateError> {
    let mut file = fs::File::open(info).map_err(|source| UpdateError::File {
        path: info.to_path_buf(),
        source,
    })?;

    let mut block = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let read = file
            .read(&mut block[filled..])
            .map_err(|source| UpdateError::File {
                path: info.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    let Some(newline) = block[..filled].iter().position(|byte| *byte == b'\n') else {
        tracing::error!(info = %info.display(), "bad format of info file");
        return Err(UpdateError::FailedUpdate("bad info file format".to_owned()));
    };
    for byte in &mut block[newline..] {
        *byte = b' ';
    }
    Ok(block)
}

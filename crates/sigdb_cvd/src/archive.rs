//! Extracting and building archive bodies.
//!
//! The body of a database archive is a tar stream starting at byte offset
//! [`HEADER_SIZE`]. Live archives built from a working copy may have the tar
//! stream gzip compressed while the 512 byte header stays uncompressed, so
//! extraction sniffs the gzip magic at the body offset.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs_err as fs;

use crate::{CvdError, HEADER_SIZE};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpacks the body of the archive at `archive` into `dest`.
///
/// `dest` is created if it does not exist. Path traversal is guarded by the
/// tar extractor; entries escaping `dest` are rejected.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), CvdError> {
    fs::create_dir_all(dest)?;

    let mut file = fs::File::open(archive)?;
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

    let body: Box<dyn Read> = if read == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    tar::Archive::new(body).unpack(dest)?;
    Ok(())
}

enum BodyWriter {
    Plain(fs::File),
    Gzip(GzEncoder<fs::File>),
}

impl Write for BodyWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            BodyWriter::Plain(file) => file.write(buf),
            BodyWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            BodyWriter::Plain(file) => file.flush(),
            BodyWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Writes a new database archive: a raw 512 byte header followed by a tar
/// stream of files appended one by one.
///
/// The destination is opened with exclusive-create semantics; an existing
/// file at `dest` is an error rather than something to overwrite.
pub struct ArchiveBuilder {
    tar: tar::Builder<BodyWriter>,
}

impl ArchiveBuilder {
    /// Creates `dest`, writes the header block and prepares the body stream.
    pub fn create(
        dest: &Path,
        header: &[u8; HEADER_SIZE],
        compress: bool,
    ) -> Result<ArchiveBuilder, CvdError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)?;
        file.write_all(header)?;

        let body = if compress {
            BodyWriter::Gzip(GzEncoder::new(file, Compression::best()))
        } else {
            BodyWriter::Plain(file)
        };
        Ok(ArchiveBuilder {
            tar: tar::Builder::new(body),
        })
    }

    /// Appends `dir/name` to the body under the entry name `name`.
    pub fn append_file(&mut self, dir: &Path, name: &str) -> Result<(), CvdError> {
        self.tar.append_path_with_name(dir.join(name), name)?;
        Ok(())
    }

    /// Finalizes the tar stream and the compressor, then closes the file.
    pub fn finish(self) -> Result<(), CvdError> {
        match self.tar.into_inner()? {
            BodyWriter::Plain(mut file) => file.flush()?,
            BodyWriter::Gzip(encoder) => {
                encoder.finish()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::test_support::header_block;

    fn populate_workdir(dir: &Path) {
        fs::write(dir.join("COPYING"), b"license text").unwrap();
        fs::write(dir.join("daily.info"), b"header line\n").unwrap();
        fs::write(dir.join("daily.ndb"), b"signature body").unwrap();
    }

    fn build(compress: bool) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let workdir = dir.path().join("work");
        fs::create_dir_all(&workdir).unwrap();
        populate_workdir(&workdir);

        let dest = dir.path().join("daily.cld");
        let header = header_block(100, 10, 60, None, None);
        let mut builder = ArchiveBuilder::create(&dest, &header, compress).unwrap();
        for name in ["COPYING", "daily.info", "daily.ndb"] {
            builder.append_file(&workdir, name).unwrap();
        }
        builder.finish().unwrap();
        (dir, dest)
    }

    #[test]
    fn roundtrip_plain() {
        let (dir, dest) = build(false);

        let out = dir.path().join("out");
        unpack_archive(&dest, &out).unwrap();

        assert_eq!(fs::read(out.join("COPYING")).unwrap(), b"license text");
        assert_eq!(fs::read(out.join("daily.ndb")).unwrap(), b"signature body");
    }

    #[test]
    fn roundtrip_gzip() {
        let (dir, dest) = build(true);

        // Header stays uncompressed, body is gzip.
        let raw = fs::read(&dest).unwrap();
        assert_eq!(&raw[HEADER_SIZE..HEADER_SIZE + 2], &GZIP_MAGIC);

        let out = dir.path().join("out");
        unpack_archive(&dest, &out).unwrap();
        assert_eq!(fs::read(out.join("daily.ndb")).unwrap(), b"signature body");
    }

    #[test]
    fn create_refuses_existing_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("daily.cld");
        fs::write(&dest, b"already here").unwrap();

        let header = header_block(100, 10, 60, None, None);
        assert!(ArchiveBuilder::create(&dest, &header, false).is_err());
    }
}

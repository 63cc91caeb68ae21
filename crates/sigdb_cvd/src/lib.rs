//! Support for the sigdb signature database archive formats.
//!
//! A signature database is distributed as a `.cvd` file (a signed, immutable
//! archive published by the distribution service) or materialized locally as a
//! `.cld` file (a "live" archive rebuilt from an unpacked working copy after
//! incremental updates). Both share the same layout: a fixed 512 byte
//! printable-ASCII header followed by a tar stream, optionally gzip
//! compressed.
//!
//! This crate provides the pieces the update engine needs to work with those
//! files:
//!
//! * [`CvdHeader`]: parsing and rendering of the 512 byte header.
//! * [`verify_archive`]: structural and digest verification of a downloaded
//!   archive.
//! * [`unpack_archive`]: extraction of the archive body into a directory.
//! * [`ArchiveBuilder`]: construction of a new archive from a directory of
//!   files.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use digest::Digest;
use fs_err as fs;
use md5::Md5;

mod archive;
mod header;

pub use archive::{unpack_archive, ArchiveBuilder};
pub use header::{CvdHeader, HEADER_SIZE};

/// The magic string identifying the database archive format. First field of
/// every header.
pub const FORMAT_MAGIC: &str = "sigdb-VDB";

#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum CvdError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("archive is too short to contain a {HEADER_SIZE} byte header")]
    TruncatedHeader,

    #[error("header contains a non-printable byte at offset {0}")]
    NonPrintableHeader(usize),

    #[error("malformed header field: {0}")]
    MalformedHeader(&'static str),

    #[error("rendered header exceeds {HEADER_SIZE} bytes")]
    HeaderOverflow,

    #[error("archive body digest mismatch (header: {expected}, body: {actual})")]
    DigestMismatch { expected: String, actual: String },

    #[error("archive header carries no body digest")]
    MissingDigest,

    #[error("archive header carries no builder signature")]
    MissingSignature,
}

/// Verifies the archive at `path` and returns its parsed header.
///
/// Verification always includes header parsing (which enforces the
/// printable-ASCII invariant). For `.cvd` files the body is additionally
/// streamed through MD5 and compared against the digest field, and a builder
/// signature must be present. Locally rebuilt `.cld` files carry a header
/// inherited from the working copy's `.info` file whose digest describes the
/// upstream body rather than the repacked one, so only the structural checks
/// apply to them.
pub fn verify_archive(path: &Path) -> Result<CvdHeader, CvdError> {
    let mut file = fs::File::open(path)?;

    let mut block = [0u8; HEADER_SIZE];
    file.read_exact(&mut block).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CvdError::TruncatedHeader
        } else {
            CvdError::Io(err)
        }
    })?;
    let header = CvdHeader::parse(&block)?;

    let signed = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("cvd"));
    if signed {
        let expected = header
            .body_digest
            .as_deref()
            .ok_or(CvdError::MissingDigest)?;
        if header.builder_signature.is_none() {
            return Err(CvdError::MissingSignature);
        }

        file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut hasher = Md5::new();
        std::io::copy(&mut file, &mut hasher)?;
        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(CvdError::DigestMismatch {
                expected: expected.to_owned(),
                actual,
            });
        }
    }

    Ok(header)
}

//! Parsing and rendering of the fixed-size archive header.

use crate::{CvdError, FORMAT_MAGIC};

/// Size of the archive header in bytes. The header occupies exactly this many
/// bytes at the start of every `.cvd`/`.cld` file, padded with spaces.
pub const HEADER_SIZE: usize = 512;

/// Parsed form of the 512 byte archive header.
///
/// The header is a single colon-delimited line of printable ASCII:
///
/// ```text
/// sigdb-VDB:<build time>:<version>:<sigs>:<f-level>:<md5|X>:<dsig|X>:<builder>:<stime>
/// ```
///
/// `version` increases monotonically with every published update; `stime` is
/// the publication time in epoch seconds and is what conditional requests are
/// keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvdHeader {
    /// Human readable build time, e.g. `17 Mar 2021 10-34 -0400`.
    pub build_time: String,

    /// Database version number.
    pub version: u32,

    /// Number of signatures carried by the archive body.
    pub signature_count: u32,

    /// Minimum engine functionality level required to consume the body.
    pub functionality_level: u32,

    /// Hex MD5 of the archive body (bytes 512..EOF). `None` when the header
    /// carries the placeholder `X`.
    pub body_digest: Option<String>,

    /// Opaque builder signature over the body digest. `None` when the header
    /// carries the placeholder `X`.
    pub builder_signature: Option<String>,

    /// Identifier of the entity that built the archive.
    pub builder: String,

    /// Build time in epoch seconds.
    pub build_epoch: u64,
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte)
}

fn optional_field(raw: &str) -> Option<String> {
    if raw == "X" {
        None
    } else {
        Some(raw.to_owned())
    }
}

impl CvdHeader {
    /// Parses a header from the first [`HEADER_SIZE`] bytes of `block`.
    ///
    /// Every byte of the header must be printable ASCII; embedded NUL bytes
    /// and control characters are rejected before any field is looked at.
    pub fn parse(block: &[u8]) -> Result<CvdHeader, CvdError> {
        if block.len() < HEADER_SIZE {
            return Err(CvdError::TruncatedHeader);
        }
        let block = &block[..HEADER_SIZE];
        if let Some(offset) = block.iter().position(|byte| !is_printable(*byte)) {
            return Err(CvdError::NonPrintableHeader(offset));
        }

        // Printable ASCII is valid UTF-8 by construction.
        let line = std::str::from_utf8(block)
            .expect("printable ASCII header")
            .trim_end_matches(' ');

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 9 {
            return Err(CvdError::MalformedHeader("field count"));
        }
        if fields[0] != FORMAT_MAGIC {
            return Err(CvdError::MalformedHeader("magic"));
        }

        let version = fields[2]
            .parse()
            .map_err(|_| CvdError::MalformedHeader("version"))?;
        let signature_count = fields[3]
            .parse()
            .map_err(|_| CvdError::MalformedHeader("signature count"))?;
        let functionality_level = fields[4]
            .parse()
            .map_err(|_| CvdError::MalformedHeader("functionality level"))?;
        let build_epoch = fields[8]
            .parse()
            .map_err(|_| CvdError::MalformedHeader("stime"))?;

        Ok(CvdHeader {
            build_time: fields[1].to_owned(),
            version,
            signature_count,
            functionality_level,
            body_digest: optional_field(fields[5]),
            builder_signature: optional_field(fields[6]),
            builder: fields[7].to_owned(),
            build_epoch,
        })
    }

    /// Reads and parses the header of the archive at `path`.
    pub fn read_from_file(path: &std::path::Path) -> Result<CvdHeader, CvdError> {
        use std::io::Read;

        let mut file = fs_err::File::open(path)?;
        let mut block = [0u8; HEADER_SIZE];
        file.read_exact(&mut block).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                CvdError::TruncatedHeader
            } else {
                CvdError::Io(err)
            }
        })?;
        CvdHeader::parse(&block)
    }

    /// Renders the header back into a space-padded [`HEADER_SIZE`] byte block.
    pub fn to_block(&self) -> Result<[u8; HEADER_SIZE], CvdError> {
        let line = format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            FORMAT_MAGIC,
            self.build_time,
            self.version,
            self.signature_count,
            self.functionality_level,
            self.body_digest.as_deref().unwrap_or("X"),
            self.builder_signature.as_deref().unwrap_or("X"),
            self.builder,
            self.build_epoch,
        );
        if line.len() > HEADER_SIZE {
            return Err(CvdError::HeaderOverflow);
        }

        let mut block = [b' '; HEADER_SIZE];
        block[..line.len()].copy_from_slice(line.as_bytes());
        Ok(block)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{CvdHeader, HEADER_SIZE};

    /// Renders a header block for tests.
    pub(crate) fn header_block(
        version: u32,
        signature_count: u32,
        functionality_level: u32,
        body_digest: Option<&str>,
        builder_signature: Option<&str>,
    ) -> [u8; HEADER_SIZE] {
        CvdHeader {
            build_time: "17 Mar 2021 10-34 -0400".to_owned(),
            version,
            signature_count,
            functionality_level,
            body_digest: body_digest.map(str::to_owned),
            builder_signature: builder_signature.map(str::to_owned),
            builder: "test-builder".to_owned(),
            build_epoch: 1_615_991_640,
        }
        .to_block()
        .unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::test_support::header_block;
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let block = header_block(26_000, 4_000_000, 90, Some("abcdef"), Some("ZHNpZw"));
        let header = CvdHeader::parse(&block).unwrap();

        assert_eq!(header.version, 26_000);
        assert_eq!(header.signature_count, 4_000_000);
        assert_eq!(header.functionality_level, 90);
        assert_eq!(header.body_digest.as_deref(), Some("abcdef"));
        assert_eq!(header.builder_signature.as_deref(), Some("ZHNpZw"));
        assert_eq!(header.builder, "test-builder");
        assert_eq!(header.build_epoch, 1_615_991_640);

        assert_eq!(header.to_block().unwrap(), block);
    }

    #[test]
    fn placeholder_fields_parse_as_none() {
        let block = header_block(1, 1, 1, None, None);
        let header = CvdHeader::parse(&block).unwrap();
        assert_eq!(header.body_digest, None);
        assert_eq!(header.builder_signature, None);
    }

    #[test]
    fn rejects_short_input() {
        assert!(matches!(
            CvdHeader::parse(b"sigdb-VDB:too short"),
            Err(CvdError::TruncatedHeader)
        ));
    }

    #[test]
    fn rejects_embedded_nul() {
        let mut block = header_block(1, 1, 1, None, None);
        block[100] = 0;
        assert!(matches!(
            CvdHeader::parse(&block),
            Err(CvdError::NonPrintableHeader(100))
        ));
    }

    #[test]
    fn rejects_newline() {
        let mut block = header_block(1, 1, 1, None, None);
        block[511] = b'\n';
        assert!(matches!(
            CvdHeader::parse(&block),
            Err(CvdError::NonPrintableHeader(511))
        ));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut block = header_block(1, 1, 1, None, None);
        block[0] = b'X';
        assert!(matches!(
            CvdHeader::parse(&block),
            Err(CvdError::MalformedHeader("magic"))
        ));
    }

    #[test]
    fn rejects_non_numeric_version() {
        let line = format!("{FORMAT_MAGIC}:17 Mar 2021 10-34 -0400:abc:1:1:X:X:builder:0");
        let mut block = [b' '; HEADER_SIZE];
        block[..line.len()].copy_from_slice(line.as_bytes());
        assert!(matches!(
            CvdHeader::parse(&block),
            Err(CvdError::MalformedHeader("version"))
        ));
    }
}

//! Payload integrity verification.
//!
//! Two independent gates: the package must be structurally sound (a complete
//! gzip archive with non-empty content) and its bytes must hash to the
//! descriptor's checksum. Structural validation runs first so a
//! coincidentally matching checksum cannot bless a malformed package.

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::error::VerificationError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Validate a downloaded payload against its descriptor.
pub fn verify(
    path: &Path,
    expected_checksum: &str,
    expected_size: u64,
) -> Result<(), VerificationError> {
    let actual_size = std::fs::metadata(path)?.len();
    if actual_size != expected_size {
        return Err(VerificationError::SizeMismatch {
            expected: expected_size,
            actual: actual_size,
        });
    }

    validate_package(path)?;

    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected_checksum) {
        return Err(VerificationError::ChecksumMismatch {
            expected: expected_checksum.to_string(),
            actual,
        });
    }

    debug!(path = %path.display(), "Payload verified");
    Ok(())
}

/// Structural check of the gzip package: header magic, complete decode
/// (CRC32 and length trailer included), non-empty content.
fn validate_package(path: &Path) -> Result<(), VerificationError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_err() || magic != GZIP_MAGIC {
        return Err(VerificationError::MalformedPackage(
            "missing gzip header".to_string(),
        ));
    }

    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let decoded = io::copy(&mut decoder, &mut io::sink()).map_err(|e| {
        VerificationError::MalformedPackage(format!("truncated or corrupt archive: {e}"))
    })?;
    if decoded == 0 {
        return Err(VerificationError::MalformedPackage(
            "archive decodes to an empty bundle".to_string(),
        ));
    }
    Ok(())
}

/// Hex SHA-256 of a file's contents.
pub(crate) fn sha256_file(path: &Path) -> Result<String, io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

//! Parameter number persistence.
//!
//! The counter is stored in a tiny versioned binary file: the bytes "CLNK"
//! and a format version (both big endian), followed by the 16-bit counter in
//! little endian. The magic and version are checked when reading.

use std::convert::TryInto;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const FILE_MAGIC: u32 = 0x434C_4E4B; // "CLNK"

/// Increase every time the saved contents have another format.
const FILE_VERSION: u32 = 0x0000_0001;

const HEADER_SIZE: usize = 8;
const FILE_SIZE: usize = HEADER_SIZE + 2;

/// Filename used for the parameter number.
pub const PARAMETER_NO_FILENAME: &str = "clm_data_param_no.bin";

fn parameter_no_path(directory: Option<&Path>) -> PathBuf {
    match directory {
        Some(directory) => directory.join(PARAMETER_NO_FILENAME),
        None => PathBuf::from(PARAMETER_NO_FILENAME),
    }
}

/// Load the parameter number, verifying file magic and version.
///
/// Returns `None` when the file is missing, truncated or has the wrong
/// magic or version.
pub fn load_parameter_no(directory: Option<&Path>) -> Option<u16> {
    let path = parameter_no_path(directory);
    let contents = match fs::read(&path) {
        Ok(contents) => contents,
        Err(err) => {
            log::debug!("Could not read file {}: {}", path.display(), err);
            return None;
        }
    };

    if contents.len() < FILE_SIZE {
        log::error!("File {} is truncated", path.display());
        return None;
    }

    let magic = u32::from_be_bytes(contents[0..4].try_into().unwrap());
    if magic != FILE_MAGIC {
        log::error!("Wrong file magic bytes in file {}", path.display());
        return None;
    }

    let version = u32::from_be_bytes(contents[4..8].try_into().unwrap());
    if version != FILE_VERSION {
        log::warn!(
            "Wrong file version identifier in file {}. Expected {} but got {}.",
            path.display(),
            FILE_VERSION,
            version
        );
        return None;
    }

    Some(u16::from_le_bytes(contents[8..10].try_into().unwrap()))
}

/// Save the parameter number.
pub fn save_parameter_no(directory: Option<&Path>, parameter_no: u16) -> io::Result<()> {
    let path = parameter_no_path(directory);
    let mut contents = [0_u8; FILE_SIZE];
    contents[0..4].copy_from_slice(&FILE_MAGIC.to_be_bytes());
    contents[4..8].copy_from_slice(&FILE_VERSION.to_be_bytes());
    contents[8..10].copy_from_slice(&parameter_no.to_le_bytes());
    fs::write(&path, contents)
}

/// Save the parameter number only when the stored value differs.
///
/// No writing is done when the file already holds the same value. This
/// reduces flash memory wear. Returns true when the file was written.
pub fn save_parameter_no_if_modified(
    directory: Option<&Path>,
    parameter_no: u16,
) -> io::Result<bool> {
    if load_parameter_no(directory) == Some(parameter_no) {
        return Ok(false);
    }
    save_parameter_no(directory, parameter_no)?;
    Ok(true)
}

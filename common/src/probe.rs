use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;

use anyhow::{Context, anyhow};

// BLKGETSIZE64 = _IOR(0x12, 114, size_t)
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Returns how many bytes can be copied out of `file`.
///
/// Regular files report their length, block devices their capacity. Every other file type is
/// rejected since its size cannot be known up front.
pub fn transfer_size(file: &std::fs::File) -> anyhow::Result<u64> {
    let metadata = file.metadata().context("failed reading metadata")?;
    let file_type = metadata.file_type();
    if file_type.is_file() {
        return Ok(metadata.len());
    }
    if file_type.is_block_device() {
        let mut bytes: u64 = 0;
        // SAFETY: the descriptor is open for the lifetime of `file` and `bytes` is a valid u64
        unsafe { blkgetsize64(file.as_raw_fd(), &mut bytes) }
            .context("getting block device size failed")?;
        return Ok(bytes);
    }
    Err(anyhow!(
        "unsupported file type {:?}, expected a regular file or a block device",
        file_type
    ))
}

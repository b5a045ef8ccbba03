//! Field checks shared by the KIP and NPDM process headers.

use nxmeta_contracts::PAGE_SIZE;

use crate::error::{BuildError, BuildResult};

pub(crate) const MAX_THREAD_PRIORITY: u8 = 0x3F;

pub(crate) fn check_stack_size(size: u32) -> BuildResult<()> {
    if size as u64 % PAGE_SIZE != 0 {
        return Err(BuildError::Misaligned {
            path: "main_thread_stack_size".to_string(),
            value: size as u64,
            alignment: PAGE_SIZE,
        });
    }
    Ok(())
}

pub(crate) fn check_name(name: &str, max: usize) -> BuildResult<()> {
    if name.len() > max {
        return Err(BuildError::TooLong {
            path: "name".to_string(),
            len: name.len(),
            max,
        });
    }
    Ok(())
}

pub(crate) fn check_priority(priority: u8) -> BuildResult<()> {
    if priority > MAX_THREAD_PRIORITY {
        return Err(BuildError::OutOfRange {
            path: "main_thread_priority".to_string(),
            value: priority as i128,
            min: 0,
            max: MAX_THREAD_PRIORITY as u64,
        });
    }
    Ok(())
}

//! Reads kernel and initrd from the volume the stub was loaded from.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use lanzaboote_shared::{EmbeddedConfig, StubError};
use uefi::prelude::*;
use uefi::proto::media::file::{Directory, File, FileAttribute, FileInfo, FileMode, RegularFile};
use uefi::CString16;

pub fn read_artifacts(
    bs: &BootServices,
    handle: Handle,
    config: &EmbeddedConfig,
) -> Result<(Vec<u8>, Vec<u8>), StubError> {
    let mut fs = bs.get_image_file_system(handle).map_err(|e| StubError::FileAccess {
        path: String::from("boot volume"),
        status: e.status().0,
    })?;
    let mut root = fs.open_volume().map_err(|e| StubError::FileAccess {
        path: String::from("boot volume"),
        status: e.status().0,
    })?;
    let kernel = read_file(&mut root, &config.kernel_path)?;
    let initrd = read_file(&mut root, &config.initrd_path)?;
    Ok((kernel, initrd))
}

fn read_file(root: &mut Directory, path: &str) -> Result<Vec<u8>, StubError> {
    let access = |status: Status| StubError::FileAccess { path: String::from(path), status: status.0 };

    let name = CString16::try_from(path).map_err(|_| access(Status::INVALID_PARAMETER))?;
    let mut file = root
        .open(&name, FileMode::Read, FileAttribute::empty())
        .map_err(|e| access(e.status()))?
        .into_regular_file()
        .ok_or_else(|| access(Status::INVALID_PARAMETER))?;
    let data = read_all(&mut file).map_err(|e| access(e.status()))?;
    log::debug!("read {} bytes from {path}", data.len());
    Ok(data)
}

pub fn read_all(file: &mut RegularFile) -> uefi::Result<Vec<u8>> {
    let info = file.get_boxed_info::<FileInfo>()?;
    let size = usize::try_from(info.file_size()).map_err(|_| Status::BAD_BUFFER_SIZE)?;
    let mut data = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut data[filled..]).map_err(|e| e.status())?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

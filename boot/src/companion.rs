//! Finds credentials and system extensions on the ESP and packs them into
//! companion initrds.

use alloc::string::String;
use alloc::vec::Vec;

use lanzaboote_shared::companion::CompanionKind;
use log::{debug, warn};
use uefi::prelude::*;
use uefi::proto::device_path::DevicePathNodeEnum;
use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::media::file::{Directory, File, FileAttribute, FileMode};
use uefi::{CStr16, CString16};

use crate::loader::read_all;

pub struct Companion {
    pub kind: CompanionKind,
    pub archive: Vec<u8>,
}

/// Every kind that has at least one file. Missing directories are normal;
/// read errors are logged and the file skipped.
pub fn collect(bs: &BootServices, image: Handle) -> Vec<Companion> {
    let image_path = own_file_path(bs, image);
    if image_path.is_none() {
        debug!("no file path for this image, only global credentials are picked up");
    }
    let Ok(mut fs) = bs.get_image_file_system(image) else {
        return Vec::new();
    };
    let Ok(mut root) = fs.open_volume() else {
        return Vec::new();
    };

    let mut companions = Vec::new();
    for kind in CompanionKind::ALL {
        let dir = match (&image_path, kind) {
            (_, CompanionKind::GlobalCredentials) => kind.source_dir(""),
            (Some(path), _) => kind.source_dir(path),
            (None, _) => continue,
        };
        match kind.pack(read_dir(&mut root, &dir, kind)) {
            Ok(Some(archive)) => {
                debug!("{} from {dir}: {} bytes", kind.description(), archive.len());
                companions.push(Companion { kind, archive });
            }
            Ok(None) => {}
            Err(e) => warn!("cannot pack {}: {:?}", kind.description(), e),
        }
    }
    companions
}

/// Path the stub was loaded from, e.g. `\EFI\Linux\nixos-generation-42.efi`.
fn own_file_path(bs: &BootServices, image: Handle) -> Option<String> {
    let loaded = bs.open_protocol_exclusive::<LoadedImage>(image).ok()?;
    let mut path = String::new();
    for node in loaded.file_path()?.node_iter() {
        let Ok(DevicePathNodeEnum::MediaFilePath(file)) = node.as_enum() else {
            continue;
        };
        let name = String::from(&*file.path_name().to_cstring16().ok()?);
        if !path.is_empty() && !path.ends_with('\\') && !name.starts_with('\\') {
            path.push('\\');
        }
        path.push_str(&name);
    }
    (!path.is_empty()).then_some(path)
}

fn read_dir(root: &mut Directory, dir: &str, kind: CompanionKind) -> Vec<(String, Vec<u8>)> {
    let Ok(name) = CString16::try_from(dir) else {
        return Vec::new();
    };
    let Some(mut dir_handle) = root
        .open(&name, FileMode::Read, FileAttribute::empty())
        .ok()
        .and_then(|handle| handle.into_directory())
    else {
        return Vec::new();
    };

    let mut files = Vec::new();
    loop {
        let info = match dir_handle.read_entry_boxed() {
            Ok(Some(info)) => info,
            Ok(None) => break,
            Err(e) => {
                warn!("cannot list {dir}: {:?}", e.status());
                break;
            }
        };
        let file_name = String::from(info.file_name());
        if info.is_directory() || !kind.accepts(&file_name) {
            continue;
        }
        match read_file(&mut dir_handle, info.file_name()) {
            Ok(data) => files.push((file_name, data)),
            Err(e) => warn!("cannot read {dir}\\{file_name}: {:?}", e.status()),
        }
    }
    files
}

fn read_file(dir: &mut Directory, name: &CStr16) -> uefi::Result<Vec<u8>> {
    let mut file = dir
        .open(name, FileMode::Read, FileAttribute::empty())?
        .into_regular_file()
        .ok_or(Status::INVALID_PARAMETER)?;
    read_all(&mut file)
}

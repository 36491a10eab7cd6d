// cli/src/lanzatool/loader.rs: systemd-boot binary and loader.conf

use std::fs;
use std::path::Path;

use lanzaboote_shared::layout::{Architecture, LOADER_CONF};
use lanzaboote_shared::pe::PeImage;
use tracing::info;

use super::config::LoaderConfig;
use super::error::{InstallError, Result};
use super::esp::Esp;
use super::signer::Signer;

/// Sign systemd-boot and place it at its own path and at the removable
/// media fallback path. Returns whether either file changed.
pub fn install_systemd_boot(esp: &Esp, signer: &dyn Signer, source: &Path, arch: Architecture) -> Result<bool> {
    let image = fs::read(source).map_err(InstallError::io(format!("read {}", source.display())))?;
    let pe = PeImage::parse(&image).map_err(|e| InstallError::MalformedStub {
        path: source.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !pe.is_efi_application() {
        return Err(InstallError::MalformedStub {
            path: source.to_path_buf(),
            reason: "not an EFI application".into(),
        });
    }

    let signed = signer.sign_bytes(&image, source)?;
    let mut changed = false;
    for target in [arch.systemd_boot_path(), arch.fallback_path()] {
        if esp.write_if_changed(&target, &signed)? {
            info!(path = %target, "installed systemd-boot");
            changed = true;
        }
    }
    Ok(changed)
}

/// loader.conf(5) text.
pub fn render_loader_conf(config: &LoaderConfig) -> String {
    let mut out = String::new();
    if let Some(timeout) = config.timeout {
        out.push_str(&format!("timeout {timeout}\n"));
    }
    out.push_str(if config.editor { "editor yes\n" } else { "editor no\n" });
    if let Some(default) = &config.default {
        out.push_str(&format!("default {default}\n"));
    }
    if let Some(mode) = &config.console_mode {
        out.push_str(&format!("console-mode {mode}\n"));
    }
    out
}

pub fn write_loader_conf(esp: &Esp, config: &LoaderConfig) -> Result<bool> {
    esp.write_if_changed(LOADER_CONF, render_loader_conf(config).as_bytes())
}

//! Lanzaboote stub
//!
//! Signed as part of every UKI on the ESP. At boot it reads the
//! configuration embedded in its own image, loads the kernel and initrd it
//! names, refuses anything whose digest does not match, and hands off to
//! the kernel with the initrd served over LoadFile2. When a TPM is present
//! the image sections and any companion initrds are measured first.

#![no_std]
#![no_main]

extern crate alloc;

mod companion;
mod efivars;
mod handoff;
mod image;
mod initrd;
mod loader;
mod tpm;
mod ui;

use alloc::vec::Vec;

use lanzaboote_shared::boot::verify_artifacts;
use lanzaboote_shared::companion::append_initrds;
use lanzaboote_shared::{Abort, BootFlow, Stage, StubError};
use log::{info, warn};
use uefi::prelude::*;

use crate::handoff::KernelImage;
use crate::initrd::InitrdLoader;
use crate::tpm::Tpm;

/// How long a failure stays on screen before control returns to firmware.
const ABORT_DELAY_US: usize = 5_000_000;

#[entry]
fn main(handle: Handle, mut system_table: SystemTable<Boot>) -> Status {
    if uefi_services::init(&mut system_table).is_err() {
        return Status::LOAD_ERROR;
    }
    ui::draw_banner(&mut system_table);

    let abort = match boot(handle, &system_table) {
        Ok(never) => match never {},
        Err(abort) => abort,
    };
    ui::display_failure(&mut system_table, &abort);
    system_table.boot_services().stall(ABORT_DELAY_US);
    exit_status(&abort.reason)
}

enum Never {}

/// Walks the boot flow. Only returns on failure; a kernel that comes back
/// from StartImage counts as one.
fn boot(handle: Handle, st: &SystemTable<Boot>) -> Result<Never, Abort<StubError>> {
    let bs = st.boot_services();
    let mut flow = BootFlow::new();

    efivars::export(st, handle);

    enter(&mut flow, Stage::Locate)?;
    let config = image::embedded_config(bs).map_err(|e| flow.abort(e))?;
    info!("kernel {}", config.kernel_path);
    info!("initrd {}", config.initrd_path);
    let (kernel, initrd) = loader::read_artifacts(bs, handle, &config).map_err(|e| flow.abort(e))?;

    enter(&mut flow, Stage::Verify)?;
    verify_artifacts(&config, &kernel, &initrd).map_err(|e| flow.abort(StubError::from(e)))?;
    info!("kernel and initrd match their digests");

    enter(&mut flow, Stage::Load)?;
    let initrd = measure_and_extend(st, handle, initrd);
    let kernel_image = KernelImage::load(bs, handle, &kernel, &config.cmdline).map_err(|e| flow.abort(e))?;
    drop(kernel);
    let initrd_loader = InitrdLoader::install(bs, initrd).map_err(|e| flow.abort(e))?;

    enter(&mut flow, Stage::Handoff)?;
    let status = kernel_image.start();
    warn!("kernel returned with {:?}", status);
    drop(initrd_loader);
    drop(kernel_image);
    Err(flow.abort(StubError::LoadFailure { operation: "StartImage", status: status.0 }))
}

/// Measures this image, then appends companion initrds (measured too) to
/// the verified initrd. The TPM is released before the kernel runs.
fn measure_and_extend(st: &SystemTable<Boot>, handle: Handle, initrd: Vec<u8>) -> Vec<u8> {
    let bs = st.boot_services();
    let mut tpm = Tpm::open(bs);
    if tpm.is_none() {
        info!("no TPM, skipping measurements");
    }
    let measured_image = tpm.as_mut().is_some_and(|tpm| image::measure(bs, tpm));

    let companions = companion::collect(bs, handle);
    let mut measured_parameters = false;
    if let Some(tpm) = tpm.as_mut() {
        for c in &companions {
            measured_parameters |= tpm.measure(c.kind.pcr(), &c.archive, c.kind.description());
        }
    }
    drop(tpm);
    efivars::export_pcrs(st, measured_image, measured_parameters);

    let archives: Vec<Vec<u8>> = companions.into_iter().map(|c| c.archive).collect();
    append_initrds(initrd, &archives)
}

fn enter(flow: &mut BootFlow, stage: Stage) -> Result<(), Abort<StubError>> {
    flow.advance(stage).map_err(|_| {
        flow.abort(StubError::LoadFailure { operation: "stage transition", status: Status::ABORTED.0 })
    })
}

fn exit_status(error: &StubError) -> Status {
    match error {
        e if e.is_verification() => Status::SECURITY_VIOLATION,
        StubError::Config(_) => Status::LOAD_ERROR,
        StubError::FileAccess { status, .. } | StubError::LoadFailure { status, .. } if *status != 0 => {
            Status(*status)
        }
        _ => Status::LOAD_ERROR,
    }
}

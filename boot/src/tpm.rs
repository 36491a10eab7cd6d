//! TPM 2.0 measurements over the TCG2 protocol. Best effort: without a TPM,
//! or when firmware refuses an event, boot carries on.

use log::{debug, warn};
use uefi::prelude::*;
use uefi::proto::tcg::v2::{HashLogExtendEventFlags, PcrEventInputs, Tcg};
use uefi::proto::tcg::{EventType, PcrIndex};
use uefi::table::boot::ScopedProtocol;

pub struct Tpm<'a> {
    tcg: ScopedProtocol<'a, Tcg>,
}

impl<'a> Tpm<'a> {
    /// `None` when there is no TCG2 protocol or no TPM behind it.
    pub fn open(bs: &'a BootServices) -> Option<Self> {
        let handle = bs.get_handle_for_protocol::<Tcg>().ok()?;
        let mut tcg = bs.open_protocol_exclusive::<Tcg>(handle).ok()?;
        let capability = tcg.get_capability().ok()?;
        if !capability.tpm_present() {
            debug!("TCG2 protocol without a TPM");
            return None;
        }
        Some(Self { tcg })
    }

    /// Extend `pcr` with the digest of `data` and log it as an IPL event.
    /// Returns whether the PCR was extended.
    pub fn measure(&mut self, pcr: u32, data: &[u8], description: &str) -> bool {
        let event = match PcrEventInputs::new_in_box(PcrIndex(pcr), EventType::IPL, description.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                warn!("cannot build TPM event for {description}: {:?}", e.status());
                return false;
            }
        };
        match self.tcg.hash_log_extend_event(HashLogExtendEventFlags::empty(), data, &event) {
            Ok(()) => {
                debug!("measured {description} into PCR {pcr}");
                true
            }
            Err(e) => {
                warn!("cannot measure {description} into PCR {pcr}: {:?}", e.status());
                false
            }
        }
    }
}

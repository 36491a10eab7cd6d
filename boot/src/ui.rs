//! Console output around the boot flow.

use core::fmt::Write;

use lanzaboote_shared::{Abort, StubError};
use uefi::prelude::*;
use uefi::proto::console::text::Color;

pub fn draw_banner(st: &mut SystemTable<Boot>) {
    let out = st.stdout();
    let _ = out.set_color(Color::LightCyan, Color::Black);
    let _ = write!(out, "lanzaboote {}\r\n", env!("CARGO_PKG_VERSION"));
    let _ = out.set_color(Color::LightGray, Color::Black);
}

/// Red failure block naming the stage and the reason.
pub fn display_failure(st: &mut SystemTable<Boot>, abort: &Abort<StubError>) {
    let out = st.stdout();
    let _ = out.set_color(Color::LightRed, Color::Black);
    let _ = write!(out, "\r\n──────────────────── BOOT REFUSED ────────────────────\r\n");
    let _ = write!(out, "[!] {} stage: {}\r\n", abort.stage, abort.reason);
    if abort.reason.is_verification() {
        let _ = out.set_color(Color::Yellow, Color::Black);
        let _ = write!(out, "[!] files on the ESP do not match this boot entry.\r\n");
        let _ = write!(out, "[!] pick an older generation or reinstall with lzbt.\r\n");
    }
    let _ = out.set_color(Color::LightRed, Color::Black);
    let _ = write!(out, "──────────────────────────────────────────────────────\r\n");
    let _ = out.set_color(Color::LightGray, Color::Black);
}

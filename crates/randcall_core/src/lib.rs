/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::ffi::{c_char, CString};

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
mod ffi;
pub mod http_retry;
pub mod media;
pub mod negotiation;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod ui_events;

#[no_mangle]
pub extern "C" fn randcall_core_version() -> *mut c_char {
    CString::new(env!("CARGO_PKG_VERSION"))
        .expect("version is valid CString")
        .into_raw()
}

#[no_mangle]
pub extern "C" fn randcall_core_string_free(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr));
    }
}

// src/util.rs
//! Small string helpers used at the OS boundary.

use crate::constants::MAX_PROCESS_NAME_LEN;

/// Characters Windows refuses in file names.
const INVALID_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// A watchable process name: non-empty, at most `MAX_PATH`, no path
/// separators or wildcard characters.
pub fn is_valid_process_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_PROCESS_NAME_LEN
        && !name.contains(INVALID_NAME_CHARS)
        && !name.contains(char::is_control)
}

/// Escape a value for use inside a single-quoted WQL string literal.
pub fn wql_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `"cheat.exe"` → `"cheat"`.  Everything before the last dot, or the whole
/// name when there is none.
pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// NUL-terminated UTF-16 copy of `s` for Win32 calls.
#[cfg(windows)]
pub fn to_wide(s: &str) -> Vec<u16> {
    use std::{ffi::OsStr, os::windows::prelude::OsStrExt};

    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

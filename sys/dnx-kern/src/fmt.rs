// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-kernel formatting and option-string parsing.
//!
//! `core::fmt` already gives Rust code everything the original kernel used
//! `vsnprintf` for; [`write_to_slice`] is the one adapter actually needed,
//! turning a `core::fmt::Arguments` into a caller-supplied byte buffer the
//! way `vsnprintf(buf, size, fmt, args)` would. [`stropt`] is the mount
//! option grammar (`key=value` pairs and bare flags, comma-separated) every
//! `mount()` call's options string is parsed with, grounded on the original
//! `_stropt_get_*` family.

use core::fmt::Write;

/// Renders `args` into `buf`, truncating if it doesn't fit, and returns the
/// number of bytes written. Never panics on overflow, unlike `write!`
/// directly against a fixed buffer.
pub fn write_to_slice(buf: &mut [u8], args: core::fmt::Arguments<'_>) -> usize {
    struct Sink<'a> {
        buf: &'a mut [u8],
        written: usize,
    }

    impl Write for Sink<'_> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let remaining = self.buf.len() - self.written;
            let take = s.len().min(remaining);
            self.buf[self.written..self.written + take].copy_from_slice(&s.as_bytes()[..take]);
            self.written += take;
            Ok(())
        }
    }

    let mut sink = Sink { buf, written: 0 };
    let _ = sink.write_fmt(args);
    sink.written
}

/// Mount-option string parsing: a comma-separated list of either bare
/// flags (`noatime`) or `key=value` pairs (`uid=1000`). Values are never
/// quoted; a `,` always ends one option and begins the next.
pub mod stropt {
    fn find_value<'a>(opts: &'a str, var: &str) -> Option<&'a str> {
        for token in opts.split(',') {
            let token = token.trim();
            if let Some((key, value)) = token.split_once('=') {
                if key.trim() == var {
                    return Some(value.trim());
                }
            }
        }
        None
    }

    /// Looks up an integer-valued option, falling back to `defval` if it is
    /// absent or not a valid integer.
    pub fn get_int(opts: &str, var: &str, defval: i64) -> i64 {
        find_value(opts, var)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defval)
    }

    /// Returns a borrowed slice of `opts` holding the raw value text for
    /// `var`, or `None` if absent.
    pub fn get_string_ref<'a>(opts: &'a str, var: &str) -> Option<&'a str> {
        find_value(opts, var)
    }

    /// Copies the value text for `var` into `buf`, truncating to fit, and
    /// returns the number of bytes copied.
    pub fn get_string_copy(opts: &str, var: &str, buf: &mut [u8]) -> usize {
        match find_value(opts, var) {
            Some(value) => {
                let take = value.len().min(buf.len());
                buf[..take].copy_from_slice(&value.as_bytes()[..take]);
                take
            }
            None => 0,
        }
    }

    /// Boolean options accept `0`/`1`, `false`/`true`, `no`/`yes` (any
    /// case); anything else falls back to `defval`.
    pub fn get_bool(opts: &str, var: &str, defval: bool) -> bool {
        match find_value(opts, var) {
            None => defval,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => defval,
            },
        }
    }

    /// True if `flag` appears as a bare, valueless token.
    pub fn is_flag(opts: &str, flag: &str) -> bool {
        opts.split(',').any(|token| token.trim() == flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_to_slice_truncates_instead_of_panicking() {
        let mut buf = [0u8; 4];
        let n = write_to_slice(&mut buf, format_args!("hello world"));
        assert_eq!(n, 4);
        assert_eq!(&buf, b"hell");
    }

    #[test]
    fn stropt_reads_ints_strings_bools_and_flags() {
        let opts = "ro,uid=1000,label=boot,noatime=true";
        assert_eq!(stropt::get_int(opts, "uid", -1), 1000);
        assert_eq!(stropt::get_int(opts, "missing", -1), -1);
        assert_eq!(stropt::get_string_ref(opts, "label"), Some("boot"));
        assert!(stropt::get_bool(opts, "noatime", false));
        assert!(stropt::is_flag(opts, "ro"));
        assert!(!stropt::is_flag(opts, "rw"));
    }

    #[test]
    fn stropt_get_string_copy_truncates() {
        let mut buf = [0u8; 3];
        let n = stropt::get_string_copy("label=verylongvalue", "label", &mut buf);
        assert_eq!(n, 3);
        assert_eq!(&buf, b"ver");
    }
}

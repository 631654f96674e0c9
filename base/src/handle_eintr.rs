// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Retrying of syscalls interrupted by a signal.

/// Evaluates `$x`, a libc call returning `-1` on failure, again for as long as it fails with
/// `EINTR`. Yields the final return value; `errno` is left untouched for the caller.
#[macro_export]
macro_rules! handle_eintr_errno {
    ($x:expr) => {{
        loop {
            let ret = $x;
            if ret != -1 || $crate::Error::last().errno() != libc::EINTR {
                break ret;
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use crate::Error;

    #[test]
    fn retries_until_not_interrupted() {
        let mut attempts = 0;
        let ret = handle_eintr_errno!({
            attempts += 1;
            if attempts < 3 {
                // SAFETY: errno is thread local.
                unsafe { *libc::__errno_location() = libc::EINTR };
                -1
            } else {
                7
            }
        });
        assert_eq!(ret, 7);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn other_errors_are_returned() {
        let mut attempts = 0;
        let ret = handle_eintr_errno!({
            attempts += 1;
            // SAFETY: errno is thread local.
            unsafe { *libc::__errno_location() = libc::EBADF };
            -1
        });
        assert_eq!(ret, -1);
        assert_eq!(attempts, 1);
        assert_eq!(Error::last().errno(), libc::EBADF);
    }
}

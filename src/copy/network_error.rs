//! Classifies I/O failures as transient network errors vs. real failures.
//!
//! Pinned, not illustrative: the errno and substring tables below are taken
//! verbatim from the reference implementation (`SPEC_FULL.md` §6a) so this port
//! is byte-for-byte equivalent rather than "close enough".

const NETWORK_ERRNO_CODES: &[i32] = &[
    libc::EIO,
    libc::ECONNREFUSED,
    libc::ETIMEDOUT,
    libc::ENETUNREACH,
    libc::EHOSTUNREACH,
    libc::EPIPE,
    libc::EACCES,
    libc::ENOTCONN,
    libc::ECONNRESET,
    libc::EINVAL,
    libc::ENOENT,
    53,
    67,
    1231,
];

const NETWORK_ERROR_SUBSTRINGS: &[&str] = &[
    "input/output error",
    "errno 5",
    "connection refused",
    "network is unreachable",
    "no route to host",
    "connection timed out",
    "broken pipe",
    "errno 32",
    "errno 110",
    "errno 111",
    "smb error",
    "cifs error",
    "mount_smbfs",
    "network mount",
    "permission denied",
    "invalid argument",
    "errno 22",
    "network path was not found",
    "winerror 53",
    "the network name cannot be found",
    "winerror 67",
    "the network location cannot be reached",
    "winerror 1231",
    "access is denied",
    "errno 13",
];

/// Returns `true` if `error` looks like a transient network/mount failure rather
/// than a genuine, permanent I/O error.
pub fn is_network_error(error: &std::io::Error) -> bool {
    if let Some(code) = error.raw_os_error() {
        if NETWORK_ERRNO_CODES.contains(&code) {
            return true;
        }
    }
    let text = error.to_string().to_lowercase();
    NETWORK_ERROR_SUBSTRINGS.iter().any(|needle| text.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn detects_by_errno() {
        let err = Error::from_raw_os_error(libc::ECONNREFUSED);
        assert!(is_network_error(&err));
    }

    #[test]
    fn detects_by_substring() {
        let err = Error::new(ErrorKind::Other, "Network is unreachable right now");
        assert!(is_network_error(&err));
    }

    #[test]
    fn does_not_misclassify_plain_errors() {
        let err = Error::new(ErrorKind::Other, "some unrelated failure");
        assert!(!is_network_error(&err));
    }
}

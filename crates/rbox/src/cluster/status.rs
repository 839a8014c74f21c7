//! Store status codes
//!
//! The object store reports results the way its C client library does: `0` for
//! success and a negated errno for failure. Errors surfaced by this crate
//! carry that number verbatim.

use std::io;

/// Operation not permitted
pub const EPERM: i32 = -libc::EPERM;
/// No such object, pool or key
pub const ENOENT: i32 = -libc::ENOENT;
pub const EIO: i32 = -libc::EIO;
pub const EACCES: i32 = -libc::EACCES;
/// Object or pool already exists
pub const EEXIST: i32 = -libc::EEXIST;
/// Bad op input or malformed name
pub const EINVAL: i32 = -libc::EINVAL;
/// Payload larger than the store accepts in one write
pub const EFBIG: i32 = -libc::EFBIG;
pub const ENOSPC: i32 = -libc::ENOSPC;
/// Counter overflow
pub const ERANGE: i32 = -libc::ERANGE;
/// Unknown object class or method
pub const EOPNOTSUPP: i32 = -libc::EOPNOTSUPP;
pub const ENOTCONN: i32 = -libc::ENOTCONN;
pub const ESHUTDOWN: i32 = -libc::ESHUTDOWN;
pub const ETIMEDOUT: i32 = -libc::ETIMEDOUT;
/// Request dropped before it completed
pub const ECANCELED: i32 = -libc::ECANCELED;

/// Human-readable text for a store status, as strerror(3) gives it
pub fn strerror(status: i32) -> String {
    if status == 0 {
        return "Success".to_string();
    }
    let text = io::Error::from_raw_os_error(status.saturating_neg()).to_string();
    match text.rsplit_once(" (os error") {
        Some((message, _)) => message.to_string(),
        None => text,
    }
}

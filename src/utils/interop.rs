use std::io;

use super::select::*;

/// Converts a C return value carrying an error number (the libibverbs
/// convention) to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    ret.select(|| Err(io::Error::from_raw_os_error(ret.abs())), || Ok(()))
}

/// Converts a libc return value (`-1` with `errno` set on failure) to a Rust
/// `Result` carrying the non-negative value.
#[inline(always)]
pub(crate) fn from_libc_ret(ret: i32) -> io::Result<i32> {
    (ret >= 0).select(|| Ok(ret), || Err(io::Error::last_os_error()))
}

/// Converts a non-zero error number to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_err<T>(code: i32) -> io::Result<T> {
    Err(io::Error::from_raw_os_error(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_c_ret() {
        assert!(from_c_ret(0).is_ok());
        assert_eq!(
            from_c_ret(libc::EINVAL).unwrap_err().raw_os_error(),
            Some(libc::EINVAL)
        );
        assert_eq!(
            from_c_ret(-libc::ENOMEM).unwrap_err().raw_os_error(),
            Some(libc::ENOMEM)
        );
        assert_eq!(
            from_c_err::<()>(libc::EBUSY).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
    }
}

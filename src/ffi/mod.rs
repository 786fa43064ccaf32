//! The C boundary.
//!
//! Every fallible operation reports through a caller-allocated
//! [`VerbsResult`]: `status == 0` is success, `1` is a precondition failure
//! detected here, anything else is the errno the provider reported. Handles
//! cross as plain `u64`s. No call unwinds into the caller.
//!
//! The process-wide [`Verbs`] instance is created on first use from the
//! environment (see [`crate::config`]), or explicitly by
//! [`rdmabridge_init`].

mod raw;

pub use raw::*;

use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::OnceLock;

use crate::config::Config;
use crate::driver::soft::SoftDriver;
use crate::error::{ConfigError, VerbsError, STATUS_FAILURE};
use crate::registry::Handle;
use crate::result::VerbsResult;
use crate::types::*;
use crate::verbs::Verbs;

static VERBS: OnceLock<Verbs> = OnceLock::new();

fn build(config: Result<Config, ConfigError>) -> Result<Verbs, ConfigError> {
    let config = config?;
    Verbs::from_config(&config)
}

fn verbs() -> &'static Verbs {
    VERBS.get_or_init(|| {
        build(Config::from_env()).unwrap_or_else(|e| {
            log::error!("rdmabridge: {}, falling back to the software provider", e);
            let config = Config::default();
            Verbs::with_policy(
                Box::new(SoftDriver::new(&config.soft)),
                config.dependency_policy,
            )
        })
    })
}

/// Write a handle-yielding outcome. A null `result` discards it.
unsafe fn record(result: *mut VerbsResult, outcome: Result<Handle, VerbsError>) {
    match result.as_mut() {
        Some(r) => r.record(outcome),
        None => {
            if let Err(e) = outcome {
                log::debug!("rdmabridge: {} (no result record)", e);
            }
        }
    }
}

unsafe fn record_unit(result: *mut VerbsResult, outcome: Result<(), VerbsError>) {
    match result.as_mut() {
        Some(r) => r.record_unit(outcome),
        None => {
            if let Err(e) = outcome {
                log::debug!("rdmabridge: {} (no result record)", e);
            }
        }
    }
}

/// Read a caller struct, or fail with a precondition error.
unsafe fn read_in<'a, T>(p: *const T, what: &'static str) -> Result<&'a T, VerbsError> {
    p.as_ref().ok_or(VerbsError::InvalidArgument(what))
}

unsafe fn write_out<'a, T>(p: *mut T, what: &'static str) -> Result<&'a mut T, VerbsError> {
    p.as_mut().ok_or(VerbsError::InvalidArgument(what))
}

fn handle(raw: u64) -> Handle {
    Handle::from_raw(raw)
}

/// Initialise the library from a TOML file, or from the environment when
/// `path` is null.
///
/// Returns `0` on success, `EALREADY` if the library is already initialised
/// (explicitly or by an earlier call), and `1` if the configuration cannot
/// be loaded or names an unavailable provider.
///
/// # Safety
///
/// `path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_init(path: *const c_char) -> i32 {
    if VERBS.get().is_some() {
        return libc::EALREADY;
    }
    let config = if path.is_null() {
        Config::from_env()
    } else {
        match CStr::from_ptr(path).to_str() {
            Ok(path) => Config::load_toml(path),
            Err(_) => return STATUS_FAILURE,
        }
    };
    let verbs = match build(config) {
        Ok(verbs) => verbs,
        Err(e) => {
            log::error!("rdmabridge: {}", e);
            return STATUS_FAILURE;
        }
    };
    match VERBS.set(verbs) {
        Ok(()) => 0,
        Err(_) => libc::EALREADY,
    }
}

// Devices.

/// Number of devices currently present, `0` if none can be listed.
#[no_mangle]
pub extern "C" fn rdmabridge_get_num_devices() -> i32 {
    i32::try_from(verbs().device_count()).unwrap_or(i32::MAX)
}

/// Copy the device name of a context into `buf`, `snprintf`-style.
///
/// At most `len - 1` bytes are copied, followed by a NUL. Returns the full
/// length of the name, `0` for an unnamed device or a dead handle.
///
/// # Safety
///
/// `buf` must be null or point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_get_device_name(ctx: u64, buf: *mut c_char, len: usize) -> i64 {
    let name = verbs().device_name(handle(ctx));
    if !buf.is_null() && len > 0 {
        let n = name.len().min(len - 1);
        ptr::copy_nonoverlapping(name.as_ptr(), buf.cast::<u8>(), n);
        *buf.add(n) = 0;
    }
    name.len() as i64
}

/// Open the device at `index` of a fresh enumeration.
///
/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_open_device(index: i32, result: *mut VerbsResult) {
    let outcome = usize::try_from(index)
        .map_err(|_| VerbsError::InvalidArgument("negative device index"))
        .and_then(|index| verbs().open_device(index));
    record(result, outcome);
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_close_device(ctx: u64, result: *mut VerbsResult) {
    record_unit(result, verbs().close_device(handle(ctx)));
}

/// # Safety
///
/// `attr` must point to a writable [`DeviceAttr`]; `result` must be null or
/// point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_query_device(
    ctx: u64,
    attr: *mut DeviceAttr,
    result: *mut VerbsResult,
) {
    let outcome = write_out(attr, "null device attributes")
        .and_then(|attr| verbs().query_device(handle(ctx), attr));
    record_unit(result, outcome);
}

/// # Safety
///
/// `attr` must point to a writable [`PortAttr`]; `result` must be null or
/// point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_query_port(
    ctx: u64,
    attr: *mut PortAttr,
    port_num: u8,
    result: *mut VerbsResult,
) {
    let outcome = write_out(attr, "null port attributes")
        .and_then(|attr| verbs().query_port(handle(ctx), port_num, attr));
    record_unit(result, outcome);
}

// Protection domains and memory regions.

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_alloc_pd(ctx: u64, result: *mut VerbsResult) {
    record(result, verbs().alloc_pd(handle(ctx)));
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_dealloc_pd(pd: u64, result: *mut VerbsResult) {
    record_unit(result, verbs().dealloc_pd(handle(pd)));
}

/// Register `len` bytes at `addr`. `access` holds [`Permission`] bits.
///
/// # Safety
///
/// The memory must stay allocated until the region is deregistered;
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_reg_mr(
    pd: u64,
    addr: *mut c_void,
    len: u64,
    access: u32,
    result: *mut VerbsResult,
) {
    let outcome = usize::try_from(len)
        .map_err(|_| VerbsError::InvalidArgument("memory region too long"))
        .and_then(|len| {
            verbs().reg_mr(handle(pd), addr.cast(), len, Permission::from_bits(access))
        });
    record(result, outcome);
}

/// # Safety
///
/// `info` must point to a writable [`MrInfo`]; `result` must be null or
/// point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_query_mr(mr: u64, info: *mut MrInfo, result: *mut VerbsResult) {
    let outcome = write_out(info, "null memory region info").and_then(|info| {
        *info = verbs().query_mr(handle(mr))?;
        Ok(())
    });
    record_unit(result, outcome);
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_dereg_mr(mr: u64, result: *mut VerbsResult) {
    record_unit(result, verbs().dereg_mr(handle(mr)));
}

// Completion channels and completion queues.

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_create_comp_channel(ctx: u64, result: *mut VerbsResult) {
    record(result, verbs().create_comp_channel(handle(ctx)));
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_destroy_comp_channel(channel: u64, result: *mut VerbsResult) {
    record_unit(result, verbs().destroy_comp_channel(handle(channel)));
}

/// Descriptor of a completion channel, `-1` on failure. The descriptor
/// belongs to the channel: do not close it.
///
/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_get_comp_channel_fd(
    channel: u64,
    result: *mut VerbsResult,
) -> i32 {
    match verbs().comp_channel_fd(handle(channel)) {
        Ok(fd) => {
            record_unit(result, Ok(()));
            fd
        }
        Err(e) => {
            record_unit(result, Err(e));
            -1
        }
    }
}

/// Create a CQ of at least `depth` entries. `channel` may be `0`.
///
/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_create_cq(
    ctx: u64,
    depth: u32,
    channel: u64,
    cookie: u64,
    vector: i32,
    result: *mut VerbsResult,
) {
    record(
        result,
        verbs().create_cq(handle(ctx), depth, handle(channel), cookie, vector),
    );
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_destroy_cq(cq: u64, result: *mut VerbsResult) {
    record_unit(result, verbs().destroy_cq(handle(cq)));
}

/// Poll up to `n` completions into `wc`.
///
/// Returns the number of completions written, or the negated status of the
/// failure.
///
/// # Safety
///
/// `wc` must point to at least `n` writable [`Wc`]s.
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_poll_cq(cq: u64, wc: *mut Wc, n: i32) -> i32 {
    let entries = match n {
        0 => &mut [][..],
        n if n < 0 || wc.is_null() => return -STATUS_FAILURE,
        n => std::slice::from_raw_parts_mut(wc, n as usize),
    };
    match verbs().poll_cq(handle(cq), entries) {
        Ok(polled) => polled as i32,
        Err(e) => {
            log::debug!("rdmabridge: {}", e);
            -e.status()
        }
    }
}

/// Arm a CQ for one event. Non-zero `solicited_only` restricts it to
/// solicited and failed completions.
///
/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_req_notify_cq(
    cq: u64,
    solicited_only: i32,
    result: *mut VerbsResult,
) {
    record_unit(result, verbs().req_notify_cq(handle(cq), solicited_only != 0));
}

/// Wait for an event on a channel. On success the result holds the CQ
/// handle and `cookie` (if non-null) receives the CQ's cookie.
///
/// # Safety
///
/// `cookie` must be null or point to a writable `u64`; `result` must be
/// null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_get_cq_event(
    channel: u64,
    cookie: *mut u64,
    result: *mut VerbsResult,
) {
    let outcome = verbs().get_cq_event(handle(channel)).map(|(cq, c)| {
        if let Some(out) = cookie.as_mut() {
            *out = c;
        }
        cq
    });
    record(result, outcome);
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_ack_cq_events(cq: u64, n: u32, result: *mut VerbsResult) {
    record_unit(result, verbs().ack_cq_events(handle(cq), n));
}

// Shared receive queues.

/// # Safety
///
/// `attr` must point to a readable [`SrqInitAttr`]; `result` must be null
/// or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_create_srq(
    pd: u64,
    attr: *const SrqInitAttr,
    result: *mut VerbsResult,
) {
    let outcome = read_in(attr, "null SRQ attributes")
        .and_then(|attr| verbs().create_srq(handle(pd), attr));
    record(result, outcome);
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_destroy_srq(srq: u64, result: *mut VerbsResult) {
    record_unit(result, verbs().destroy_srq(handle(srq)));
}

/// # Safety
///
/// `wr` must be null or a well-formed list (see [`recv_list`]); `result`
/// must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_post_srq_recv(
    srq: u64,
    wr: *const RawRecvWr,
    result: *mut VerbsResult,
) {
    let outcome = recv_list(wr).and_then(|wrs| verbs().post_srq_recv(handle(srq), &wrs));
    record_unit(result, outcome);
}

// Queue pairs.

/// # Safety
///
/// `attr` must point to a readable [`QpInitAttr`]; `result` must be null or
/// point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_create_qp(
    pd: u64,
    attr: *const QpInitAttr,
    result: *mut VerbsResult,
) {
    let outcome =
        read_in(attr, "null QP attributes").and_then(|attr| verbs().create_qp(handle(pd), attr));
    record(result, outcome);
}

/// Apply the fields of `attr` selected by `mask` ([`QpAttrMask`] bits).
///
/// # Safety
///
/// `attr` must point to a readable [`QpAttr`]; `result` must be null or
/// point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_modify_qp(
    qp: u64,
    attr: *const QpAttr,
    mask: u32,
    result: *mut VerbsResult,
) {
    let outcome = read_in(attr, "null QP attributes")
        .and_then(|attr| verbs().modify_qp(handle(qp), attr, QpAttrMask(mask)));
    record_unit(result, outcome);
}

/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_destroy_qp(qp: u64, result: *mut VerbsResult) {
    record_unit(result, verbs().destroy_qp(handle(qp)));
}

/// QP number, `0` on failure.
///
/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_get_qp_num(qp: u64, result: *mut VerbsResult) -> u32 {
    let outcome = verbs().qp_num(handle(qp));
    let num = *outcome.as_ref().unwrap_or(&0);
    record_unit(result, outcome.map(|_| ()));
    num
}

/// Current [`QpState`] value, `-1` on failure.
///
/// # Safety
///
/// `result` must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_get_qp_state(qp: u64, result: *mut VerbsResult) -> i32 {
    let outcome = verbs().qp_state(handle(qp));
    let state = outcome.as_ref().map_or(-1, |s| *s as i32);
    record_unit(result, outcome.map(|_| ()));
    state
}

/// Fill `endpoint` with what a peer needs to connect to `qp`.
///
/// # Safety
///
/// `endpoint` must point to a writable [`QpEndpoint`]; `result` must be
/// null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_get_endpoint(
    qp: u64,
    port_num: u8,
    endpoint: *mut QpEndpoint,
    result: *mut VerbsResult,
) {
    let outcome = write_out(endpoint, "null endpoint").and_then(|out| {
        *out = verbs().endpoint(handle(qp), port_num)?;
        Ok(())
    });
    record_unit(result, outcome);
}

/// Bring a RESET QP to RTS, connected to `remote`.
///
/// # Safety
///
/// `local` and `remote` must point to readable [`QpEndpoint`]s; `result`
/// must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_connect_qp(
    qp: u64,
    local: *const QpEndpoint,
    remote: *const QpEndpoint,
    access: u32,
    result: *mut VerbsResult,
) {
    let outcome = read_in(local, "null local endpoint").and_then(|local| {
        let remote = read_in(remote, "null remote endpoint")?;
        verbs().connect_qp(handle(qp), local, remote, Permission::from_bits(access))
    });
    record_unit(result, outcome);
}

/// Post a linked list of send requests. A malformed list posts nothing.
///
/// # Safety
///
/// `wr` must be null or a well-formed list (see [`send_list`]); `result`
/// must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_post_send(
    qp: u64,
    wr: *const RawSendWr,
    result: *mut VerbsResult,
) {
    let outcome = send_list(wr).and_then(|wrs| verbs().post_send(handle(qp), &wrs));
    record_unit(result, outcome);
}

/// Post a linked list of receive requests. A malformed list posts nothing.
///
/// # Safety
///
/// `wr` must be null or a well-formed list (see [`recv_list`]); `result`
/// must be null or point to a writable [`VerbsResult`].
#[no_mangle]
pub unsafe extern "C" fn rdmabridge_post_recv(
    qp: u64,
    wr: *const RawRecvWr,
    result: *mut VerbsResult,
) {
    let outcome = recv_list(wr).and_then(|wrs| verbs().post_recv(handle(qp), &wrs));
    record_unit(result, outcome);
}

// Descriptors. These follow libc conventions: `-1` and `errno` on failure.

fn libc_ret<T>(res: std::io::Result<T>, ok: impl FnOnce(T) -> i32) -> i32 {
    match res {
        Ok(v) => ok(v),
        Err(e) => {
            if let Some(errno) = e.raw_os_error() {
                // SAFETY: `__errno_location` returns this thread's errno slot.
                unsafe { *libc::__errno_location() = errno };
            }
            -1
        }
    }
}

/// Close a descriptor. `0` on success, `-1` with `errno` set on failure.
#[no_mangle]
pub extern "C" fn rdmabridge_fd_close(fd: i32) -> i32 {
    libc_ret(crate::fd::close(fd), |_| 0)
}

/// Add `mode` to a descriptor's status flags. `0` on success, `-1` with
/// `errno` set on failure.
#[no_mangle]
pub extern "C" fn rdmabridge_fd_set_flags(fd: i32, mode: i32) -> i32 {
    libc_ret(crate::fd::set_flags(fd, mode), |_| 0)
}

/// A descriptor's status flags, `-1` with `errno` set on failure.
#[no_mangle]
pub extern "C" fn rdmabridge_fd_get_flags(fd: i32) -> i32 {
    libc_ret(crate::fd::get_flags(fd), |flags| flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceKind;

    #[test]
    fn test_device_name_truncates() {
        let mut ctx = VerbsResult::new();
        unsafe { rdmabridge_open_device(0, &mut ctx) };
        assert!(ctx.is_success());

        let mut buf = [0x7f as c_char; 4];
        let full = unsafe { rdmabridge_get_device_name(ctx.handle, buf.as_mut_ptr(), buf.len()) };
        assert!(full > 3);
        let got = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(got.to_bytes().len(), 3);

        let mut closed = VerbsResult::new();
        unsafe { rdmabridge_close_device(ctx.handle, &mut closed) };
        assert_eq!(closed, VerbsResult::new());
        assert_eq!(
            unsafe { rdmabridge_get_device_name(ctx.handle, buf.as_mut_ptr(), buf.len()) },
            0
        );
    }

    #[test]
    fn test_preconditions() {
        let mut r = VerbsResult::new();
        unsafe { rdmabridge_open_device(-1, &mut r) };
        assert_eq!(r.status, STATUS_FAILURE);

        unsafe { rdmabridge_alloc_pd(0, &mut r) };
        assert_eq!(r.status, STATUS_FAILURE);
        assert_eq!(r.handle, 0);

        unsafe { rdmabridge_query_device(0, ptr::null_mut(), &mut r) };
        assert_eq!(r.status, STATUS_FAILURE);

        assert_eq!(unsafe { rdmabridge_poll_cq(0, ptr::null_mut(), 4) }, -STATUS_FAILURE);

        // Outcomes without a record are dropped.
        unsafe { rdmabridge_alloc_pd(0, ptr::null_mut()) };
    }

    #[test]
    fn test_handles_are_tagged() {
        let mut ctx = VerbsResult::new();
        unsafe { rdmabridge_open_device(0, &mut ctx) };
        let mut pd = VerbsResult::new();
        unsafe { rdmabridge_alloc_pd(ctx.handle, &mut pd) };
        assert_eq!(
            Handle::from_raw(pd.handle).kind(),
            Some(ResourceKind::ProtectionDomain)
        );

        // A PD handle is not a context handle.
        let mut wrong = VerbsResult::new();
        unsafe { rdmabridge_alloc_pd(pd.handle, &mut wrong) };
        assert_eq!(wrong.status, STATUS_FAILURE);

        let mut r = VerbsResult::new();
        unsafe { rdmabridge_dealloc_pd(pd.handle, &mut r) };
        assert!(r.is_success());
        unsafe { rdmabridge_close_device(ctx.handle, &mut r) };
        assert!(r.is_success());
    }

    #[test]
    fn test_fd_errno() {
        assert_eq!(rdmabridge_fd_get_flags(-1), -1);
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EBADF)
        );
        assert_eq!(rdmabridge_fd_close(-1), -1);
    }
}

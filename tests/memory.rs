mod common;

use std::ptr;

use anyhow::Result;
use common::status;
use rdmabridge::prelude::*;

fn open() -> Result<(Verbs, Handle)> {
    let verbs = Verbs::new(SoftDriver::default());
    let ctx = verbs.open_device(0)?;
    Ok((verbs, ctx))
}

#[test]
fn test_pd_round_trip() -> Result<()> {
    let (verbs, ctx) = open()?;
    let mut result = VerbsResult::new();
    result.record(verbs.alloc_pd(ctx));
    assert!(result.is_success());
    let pd = Handle::from_raw(result.handle);
    assert_eq!(pd.kind(), Some(ResourceKind::ProtectionDomain));

    result.record_unit(verbs.dealloc_pd(pd));
    assert_eq!(result, VerbsResult::new());

    // The first dealloc revoked the handle.
    result.record_unit(verbs.dealloc_pd(pd));
    assert_eq!(result.status, STATUS_FAILURE);
    Ok(())
}

#[test]
fn test_handles_are_not_reused() -> Result<()> {
    let (verbs, ctx) = open()?;
    let first = verbs.alloc_pd(ctx)?;
    verbs.dealloc_pd(first)?;
    let second = verbs.alloc_pd(ctx)?;
    assert_ne!(first, second);
    assert!(verbs.dealloc_pd(first).is_err());
    verbs.dealloc_pd(second)?;
    Ok(())
}

#[test]
fn test_reg_mr_rejects_empty() -> Result<()> {
    let (verbs, ctx) = open()?;
    let pd = verbs.alloc_pd(ctx)?;
    let mut buf = [0u8; 64];

    let mut result = VerbsResult::new();
    result.record(unsafe { verbs.reg_mr(pd, buf.as_mut_ptr(), 0, Permission::default()) });
    assert_eq!(result.status, STATUS_FAILURE);
    assert_eq!(result.handle, 0);

    result.record(unsafe { verbs.reg_mr(pd, ptr::null_mut(), 64, Permission::default()) });
    assert_eq!(result.status, STATUS_FAILURE);
    assert_eq!(result.handle, 0);

    // Nothing was registered, so the PD has no dependents.
    verbs.dealloc_pd(pd)?;
    Ok(())
}

#[test]
fn test_query_mr() -> Result<()> {
    let (verbs, ctx) = open()?;
    let pd = verbs.alloc_pd(ctx)?;
    let mut buf = vec![0u8; 4096];
    let mr = unsafe { verbs.reg_slice(pd, &mut buf, Permission::default())? };

    let info = verbs.query_mr(mr)?;
    assert_eq!(info.addr, buf.as_ptr() as u64);
    assert_eq!(info.length, 4096);
    assert_ne!(info.lkey, 0);
    assert_eq!(info.sge(4000, 96).map(|s| s.addr), Some(info.addr + 4000));
    assert_eq!(info.sge(4000, 97), None);

    verbs.dereg_mr(mr)?;
    assert_eq!(status(verbs.query_mr(mr)), STATUS_FAILURE);
    verbs.dealloc_pd(pd)?;
    Ok(())
}

#[test]
fn test_inconsistent_permission() -> Result<()> {
    let (verbs, ctx) = open()?;
    let pd = verbs.alloc_pd(ctx)?;
    let mut buf = [0u8; 64];

    // Remote write needs local write.
    let r = unsafe { verbs.reg_slice(pd, &mut buf, Permission::REMOTE_WRITE) };
    assert_eq!(status(r), libc::EINVAL);

    let r = unsafe { verbs.reg_slice(pd, &mut buf, Permission::from_bits(1 << 20)) };
    assert_eq!(status(r), libc::EINVAL);
    Ok(())
}

#[test]
fn test_pd_with_mr_is_busy() -> Result<()> {
    for policy in [DependencyPolicy::Registry, DependencyPolicy::Driver] {
        let verbs = Verbs::with_policy(Box::new(SoftDriver::default()), policy);
        let ctx = verbs.open_device(0)?;
        let pd = verbs.alloc_pd(ctx)?;
        let mut buf = [0u8; 64];
        let mr = unsafe { verbs.reg_slice(pd, &mut buf, Permission::LOCAL_WRITE)? };

        match verbs.dealloc_pd(pd) {
            Err(VerbsError::Busy { kind, dependents }) => {
                assert_eq!(policy, DependencyPolicy::Registry);
                assert_eq!(kind, ResourceKind::ProtectionDomain);
                assert_eq!(dependents, 1);
            }
            Err(e) => {
                assert_eq!(policy, DependencyPolicy::Driver);
                assert_eq!(e.status(), libc::EBUSY);
            }
            Ok(()) => panic!("PD with a registered MR was deallocated"),
        }

        verbs.dereg_mr(mr)?;
        verbs.dealloc_pd(pd)?;
        verbs.close_device(ctx)?;
    }
    Ok(())
}

#[test]
fn test_mr_limit() -> Result<()> {
    let config = SoftConfig {
        devices: vec![SoftDeviceConfig {
            max_mr: 1,
            ..SoftDeviceConfig::named("tiny")
        }],
    };
    let verbs = Verbs::new(SoftDriver::new(&config));
    let ctx = verbs.open_device(0)?;
    let pd = verbs.alloc_pd(ctx)?;
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    unsafe { verbs.reg_slice(pd, &mut a, Permission::LOCAL_WRITE)? };
    let r = unsafe { verbs.reg_slice(pd, &mut b, Permission::LOCAL_WRITE) };
    assert_eq!(status(r), libc::ENOMEM);
    Ok(())
}

//! End-to-end scenarios for the resource lock: shared preparation,
//! mode switches, cancellation, abandonment, and fault recovery.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use preplock::test_utils::{block_on, init_test_logging, poll_once, ScriptedAccess};
use preplock::{
    test_complete, test_phase, CancelToken, ErrorKind, LockFlags, PreparedMode, ResourceLock,
};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn concurrent_readers_share_one_preparation() {
    init_test("concurrent_readers_share_one_preparation");
    let access = Arc::new(ScriptedAccess::new());
    let hold = access.hold_concurrent();
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let g1 = block_on(lock.read(&ct)).expect("read");
    let g2 = block_on(lock.read(&ct)).expect("read");

    let mut f1 = Box::pin(g1.get_resource(&moniker, &ct));
    let mut f2 = Box::pin(g2.get_resource(&moniker, &ct));
    assert!(poll_once(&mut f1).is_pending());
    assert!(poll_once(&mut f2).is_pending());

    hold.fire();
    let r1 = block_on(&mut f1).expect("first reader");
    let r2 = block_on(&mut f2).expect("second reader");

    assert!(Arc::ptr_eq(&r1, &r2));
    assert_eq!(r1.concurrent_preps.load(Ordering::SeqCst), 1);
    assert_eq!(access.fetch_count(), 2);
    assert_eq!(lock.prepared_mode(&r1), PreparedMode::Concurrent);
    test_complete!("concurrent_readers_share_one_preparation");
}

#[test]
fn mode_switch_chains_exclusive_after_concurrent() {
    init_test("mode_switch_chains_exclusive_after_concurrent");
    let access = Arc::new(ScriptedAccess::new());
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let reader = block_on(lock.read(&ct)).expect("read");
    let resource = block_on(reader.get_resource(&moniker, &ct)).expect("get");
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 1);
    assert_eq!(lock.prepared_mode(&resource), PreparedMode::Concurrent);
    reader.release();

    let writer = block_on(lock.write(LockFlags::NONE, &ct)).expect("write");
    let same = block_on(writer.get_resource(&moniker, &ct)).expect("get");
    assert!(Arc::ptr_eq(&resource, &same));
    assert_eq!(same.exclusive_preps.load(Ordering::SeqCst), 1);
    assert_eq!(same.concurrent_preps.load(Ordering::SeqCst), 1);
    assert_eq!(lock.prepared_mode(&same), PreparedMode::Exclusive);
    drop(writer);
    test_complete!("mode_switch_chains_exclusive_after_concurrent");
}

#[test]
fn write_release_restores_upgradeable_resources_to_concurrent() {
    init_test("write_release_restores_upgradeable_resources_to_concurrent");
    let access = Arc::new(ScriptedAccess::new());
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let upgradeable =
        block_on(lock.upgradeable_read(LockFlags::NONE, &ct)).expect("upgradeable read");
    let resource = block_on(upgradeable.get_resource(&moniker, &ct)).expect("get");
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 1);

    let mut writer = block_on(upgradeable.write(LockFlags::NONE, &ct)).expect("upgrade");
    let same = block_on(writer.get_resource(&moniker, &ct)).expect("get under write");
    assert!(Arc::ptr_eq(&resource, &same));
    assert_eq!(same.exclusive_preps.load(Ordering::SeqCst), 1);

    // Releasing the nested write must re-prepare the touched resource for
    // concurrent access before the release completes.
    block_on(writer.release()).expect("release");
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 2);
    assert_eq!(lock.prepared_mode(&resource), PreparedMode::Concurrent);

    // The upgradeable read continues and sees a concurrent-mode resource.
    let again = block_on(upgradeable.get_resource(&moniker, &ct)).expect("get after release");
    assert!(Arc::ptr_eq(&again, &resource));
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 2);
    drop(upgradeable);
    test_complete!("write_release_restores_upgradeable_resources_to_concurrent");
}

#[test]
fn cancelling_one_waiter_leaves_the_rest_undisturbed() {
    init_test("cancelling_one_waiter_leaves_the_rest_undisturbed");
    let access = Arc::new(ScriptedAccess::new());
    let hold = access.hold_concurrent();
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let g1 = block_on(lock.read(&ct)).expect("read");
    let g2 = block_on(lock.read(&ct)).expect("read");
    let g3 = block_on(lock.read(&ct)).expect("read");

    let ct1 = CancelToken::new();
    let ct2 = CancelToken::new();
    let ct3 = CancelToken::new();
    let mut f1 = Box::pin(g1.get_resource(&moniker, &ct1));
    let mut f2 = Box::pin(g2.get_resource(&moniker, &ct2));
    let mut f3 = Box::pin(g3.get_resource(&moniker, &ct3));
    assert!(poll_once(&mut f1).is_pending());
    assert!(poll_once(&mut f2).is_pending());
    assert!(poll_once(&mut f3).is_pending());

    ct2.cancel();
    match block_on(&mut f2) {
        Err(e) => assert!(e.is_cancelled()),
        Ok(_) => panic!("expected cancellation"),
    }

    hold.fire();
    let r1 = block_on(&mut f1).expect("first waiter");
    let r3 = block_on(&mut f3).expect("third waiter");
    assert!(Arc::ptr_eq(&r1, &r3));
    assert_eq!(r1.concurrent_preps.load(Ordering::SeqCst), 1);
    test_complete!("cancelling_one_waiter_leaves_the_rest_undisturbed");
}

#[test]
fn abandoned_preparation_is_revived_for_the_next_caller() {
    init_test("abandoned_preparation_is_revived_for_the_next_caller");
    let access = Arc::new(ScriptedAccess::new());
    let hold = access.hold_concurrent();
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let g1 = block_on(lock.read(&ct)).expect("read");
    let g2 = block_on(lock.read(&ct)).expect("read");

    let ct1 = CancelToken::new();
    let ct2 = CancelToken::new();
    let mut f1 = Box::pin(g1.get_resource(&moniker, &ct1));
    let mut f2 = Box::pin(g2.get_resource(&moniker, &ct2));
    assert!(poll_once(&mut f1).is_pending());
    assert!(poll_once(&mut f2).is_pending());

    // Every waiter cancels: the shared computation itself is cancelled.
    ct1.cancel();
    ct2.cancel();
    assert!(block_on(&mut f1).is_err());
    assert!(block_on(&mut f2).is_err());

    let resource = access.resource("m").expect("fetched");
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 1);

    // A later reader chains a fresh preparation after the cancelled one.
    let g3 = block_on(lock.read(&ct)).expect("read");
    let ct3 = CancelToken::new();
    let mut f3 = Box::pin(g3.get_resource(&moniker, &ct3));
    assert!(poll_once(&mut f3).is_pending());
    hold.fire();
    let r3 = block_on(&mut f3).expect("revived");
    assert_eq!(r3.concurrent_preps.load(Ordering::SeqCst), 2);
    test_complete!("abandoned_preparation_is_revived_for_the_next_caller");
}

#[test]
fn faulted_preparation_is_retried_on_next_access() {
    init_test("faulted_preparation_is_retried_on_next_access");
    let access = Arc::new(ScriptedAccess::new());
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    access.fail_next_concurrent();
    let reader = block_on(lock.read(&ct)).expect("read");
    match block_on(reader.get_resource(&moniker, &ct)) {
        Err(e) => assert_eq!(e.kind(), ErrorKind::Preparation),
        Ok(_) => panic!("expected preparation failure"),
    }

    // The faulted record is retained; the next access chains a fresh
    // preparation that may succeed.
    let resource = block_on(reader.get_resource(&moniker, &ct)).expect("second attempt");
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 2);
    test_complete!("faulted_preparation_is_retried_on_next_access");
}

#[test]
fn sticky_write_keeps_resources_exclusive_until_upgradeable_release() {
    init_test("sticky_write_keeps_resources_exclusive_until_upgradeable_release");
    let access = Arc::new(ScriptedAccess::new());
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let mut upgradeable =
        block_on(lock.upgradeable_read(LockFlags::STICKY_WRITE, &ct)).expect("upgradeable");
    let writer = block_on(upgradeable.write(LockFlags::NONE, &ct)).expect("upgrade");
    let resource = block_on(writer.get_resource(&moniker, &ct)).expect("get");
    assert_eq!(resource.exclusive_preps.load(Ordering::SeqCst), 1);
    drop(writer);

    // Sticky write: exclusivity is retained, nothing is re-prepared.
    assert!(upgradeable.holds_write_status());
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 0);
    let same = block_on(upgradeable.get_resource(&moniker, &ct)).expect("still exclusive");
    assert!(Arc::ptr_eq(&resource, &same));
    assert_eq!(resource.exclusive_preps.load(Ordering::SeqCst), 1);
    assert_eq!(lock.prepared_mode(&resource), PreparedMode::Exclusive);

    // The exclusive release fires when the upgradeable read lets go; with
    // nobody left inside it, states are only invalidated.
    block_on(upgradeable.release()).expect("release");
    assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 0);
    assert_eq!(lock.prepared_mode(&resource), PreparedMode::Unknown);
    test_complete!("sticky_write_keeps_resources_exclusive_until_upgradeable_release");
}

#[test]
fn exclusive_preparation_observes_aggregate_flags() {
    init_test("exclusive_preparation_observes_aggregate_flags");
    let access = Arc::new(ScriptedAccess::new());
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let writer = block_on(lock.write(LockFlags::SKIP_INITIAL_PREPARATION, &ct)).expect("write");
    let resource = block_on(writer.get_resource(&moniker, &ct)).expect("get");
    assert!(resource
        .last_exclusive_flags
        .lock()
        .contains(LockFlags::SKIP_INITIAL_PREPARATION));
    drop(writer);
    test_complete!("exclusive_preparation_observes_aggregate_flags");
}

#[test]
fn get_resource_after_release_reports_no_lock() {
    init_test("get_resource_after_release_reports_no_lock");
    let access = Arc::new(ScriptedAccess::new());
    let lock = ResourceLock::new(Arc::clone(&access));
    let ct = CancelToken::new();
    let moniker = "m".to_string();

    let mut writer = block_on(lock.write(LockFlags::NONE, &ct)).expect("write");
    block_on(writer.release()).expect("release");
    match block_on(writer.get_resource(&moniker, &ct)) {
        Err(e) => assert_eq!(e.kind(), ErrorKind::NoLockHeld),
        Ok(_) => panic!("expected NoLockHeld"),
    }
    test_complete!("get_resource_after_release_reports_no_lock");
}

#[test]
fn threaded_readers_share_one_preparation() {
    init_test("threaded_readers_share_one_preparation");
    let access = Arc::new(ScriptedAccess::new());
    let hold = access.hold_concurrent();
    let lock = Arc::new(ResourceLock::new(Arc::clone(&access)));
    let moniker = "m".to_string();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let lock = Arc::clone(&lock);
        let moniker = moniker.clone();
        handles.push(std::thread::spawn(move || {
            let ct = CancelToken::new();
            block_on(async {
                let guard = lock.read(&ct).await?;
                guard.get_resource(&moniker, &ct).await
            })
        }));
    }

    // Give the readers time to pile onto the shared preparation.
    std::thread::sleep(std::time::Duration::from_millis(100));
    hold.fire();

    for handle in handles {
        let resource = handle.join().expect("thread").expect("get_resource");
        assert_eq!(resource.concurrent_preps.load(Ordering::SeqCst), 1);
    }
    assert_eq!(access.fetch_count(), 3);
    test_complete!("threaded_readers_share_one_preparation");
}

use crate::event::{self, Event, EventError, EventInitialState, EventReset};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

#[test]
fn threadpool_test_event() {
    // Create an anonymous manually resetable event
    let ev = event::anonymous(EventReset::Manual, EventInitialState::Unset);
    assert!(!ev.is_set());

    // Make sure we time out while unset
    let start = Instant::now();
    let err = ev.wait(Some(Duration::from_millis(20)));
    assert_eq!(Err(EventError::Timeout), err);
    assert!(start.elapsed() >= Duration::from_millis(20));

    // Make sure we set event and a manual event stays set
    ev.set();
    assert_eq!(Ok(()), ev.wait(Some(Duration::from_millis(20))));
    assert_eq!(Ok(()), ev.wait(None));
    assert!(ev.is_set());

    // Reset the event and wait again
    ev.reset();
    assert!(!ev.is_set());
    assert_eq!(Err(EventError::Timeout), ev.wait(Some(Duration::ZERO)));
}

#[test]
fn threadpool_test_event_manual_releases_all() {
    let ev = event::anonymous(EventReset::Manual, EventInitialState::Unset);
    let released = Arc::new(AtomicUsize::new(0));
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let ev = ev.clone();
            let released = Arc::clone(&released);
            thread::spawn(move || {
                ev.wait(None).unwrap();
                released.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(0, released.load(Ordering::SeqCst));
    ev.set();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(4, released.load(Ordering::SeqCst));
}

#[test]
fn threadpool_test_event_auto_reset() {
    let ev = event::anonymous(EventReset::Automatic, EventInitialState::Set);
    assert!(ev.is_set());

    // The first wait consumes the signal
    assert_eq!(Ok(()), ev.wait(Some(Duration::from_millis(10))));
    assert!(!ev.is_set());
    assert_eq!(
        Err(EventError::Timeout),
        ev.wait(Some(Duration::from_millis(10)))
    );

    // A borrowed handle refers to the same event
    let borrowed = ev.as_handle();
    borrowed.set();
    assert!(ev.is_set());
    assert_eq!(Ok(()), ev.wait(None));
    assert!(!borrowed.is_set());

    let clone = ev.clone();
    assert!(clone.ptr_eq(&ev));
    let other = event::anonymous(EventReset::Automatic, EventInitialState::Unset);
    assert!(!other.ptr_eq(&ev));
}

#[test]
fn threadpool_test_event_unbounded_timeout() {
    let ev = event::anonymous(EventReset::Automatic, EventInitialState::Set);
    assert_eq!(Ok(()), ev.wait(Some(Duration::MAX)));
    assert!(!ev.is_set());

    // A timeout beyond the range of Instant behaves like an untimed wait
    let setter = {
        let ev = ev.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            ev.set();
        })
    };
    assert_eq!(Ok(()), ev.wait(Some(Duration::MAX)));
    setter.join().unwrap();
}

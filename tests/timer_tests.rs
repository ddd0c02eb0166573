//! Timer service behavior: ordering, catch-up, reset semantics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spindle::timer::Clock;
use spindle::{MonotonicClock, Scheduler, TimePoint, Timer, WallClock, WallTimer};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[test]
fn timers_fire_in_deadline_order() {
    let sched = Scheduler::new();
    let started = Instant::now();
    let order = Arc::new(Mutex::new(Vec::new()));
    let now = MonotonicClock::now();

    let mk = |tag: &'static str, after: u64| -> Timer {
        let order = order.clone();
        Timer::new(
            &sched,
            move || order.lock().unwrap().push(tag),
            now + ms(after),
            Duration::ZERO,
        )
        .expect("timer")
    };
    // Created out of order on purpose.
    let t2 = mk("second", 80);
    let t1 = mk("first", 40);
    let t3 = mk("third", 120);

    sched.run().expect("run");
    assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    assert!(started.elapsed() >= ms(120));
    assert!(t1.is_stopped() && t2.is_stopped() && t3.is_stopped());
}

#[test]
fn one_shot_with_past_deadline_fires_once() {
    let sched = Scheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let timer: Timer = {
        let count = count.clone();
        Timer::new(
            &sched,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            MonotonicClock::now() - ms(50),
            Duration::ZERO,
        )
        .expect("timer")
    };
    sched.run().expect("run");
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(timer.missed(), 0);
    assert!(timer.is_stopped());
    assert_eq!(timer.deadline(), TimePoint::ZERO);
}

#[test]
fn periodic_with_past_deadline_fires_once_and_counts_missed_periods() {
    let sched = Arc::new(Scheduler::new());
    let count = Arc::new(AtomicUsize::new(0));
    let timer: Timer = {
        let count = count.clone();
        Timer::new(
            &sched,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            MonotonicClock::now() - ms(700),
            ms(200),
        )
        .expect("timer")
    };
    // Next legitimate fire is ~100ms out; stop well before it arrives.
    let stopper: Timer = {
        let sched2 = sched.clone();
        Timer::new(
            &sched,
            move || sched2.stop(),
            MonotonicClock::now() + ms(40),
            Duration::ZERO,
        )
        .expect("timer")
    };
    sched.run().expect("run");
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(timer.missed(), 3, "periods -500, -300, -100 were missed");
    drop(stopper);
    drop(timer);
}

#[test]
fn periodic_catch_up_is_one_invocation_per_backlog() {
    // 100ms period; the first invocation stalls the scheduler for
    // 350ms. Catch-up must produce a single invocation carrying the
    // missed periods, never a burst.
    let sched = Arc::new(Scheduler::new());
    let count = Arc::new(AtomicUsize::new(0));
    let first = Arc::new(AtomicBool::new(true));

    let periodic: Timer = {
        let count = count.clone();
        let first = first.clone();
        Timer::with_interval(
            &sched,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                if first.swap(false, Ordering::SeqCst) {
                    std::thread::sleep(ms(350));
                }
            },
            ms(100),
        )
        .expect("timer")
    };
    let stopper: Timer = {
        let sched2 = sched.clone();
        Timer::new(
            &sched,
            move || sched2.stop(),
            MonotonicClock::now() + ms(1000),
            Duration::ZERO,
        )
        .expect("timer")
    };

    sched.run().expect("run");
    let fired = count.load(Ordering::SeqCst);
    let missed = periodic.missed();
    assert!(fired <= 10, "fired {} times", fired);
    assert!(missed >= 2, "missed {}", missed);
    assert!(
        (9..=11).contains(&(fired as u64 + missed)),
        "fired {} + missed {} should account for ~10 periods",
        fired,
        missed
    );
    drop(stopper);
    drop(periodic);
}

#[test]
fn reset_returns_the_previous_schedule() {
    let sched = Scheduler::new();
    let now = MonotonicClock::now();
    let d1 = now + ms(500);
    let d2 = now + ms(900);

    let timer: Timer = Timer::new(&sched, || {}, d1, ms(50)).expect("timer");
    assert!(!timer.is_stopped());

    let (prev_deadline, prev_interval, prev_missed) =
        timer.reset(&sched, d2, ms(70)).expect("reset");
    assert_eq!(prev_deadline, d1);
    assert_eq!(prev_interval, ms(50));
    assert_eq!(prev_missed, 0);
    assert_eq!(timer.deadline(), d2);
    assert_eq!(timer.interval(), ms(70));

    let (deadline, interval, missed) = timer.stop();
    assert_eq!(deadline, d2);
    assert_eq!(interval, ms(70));
    assert_eq!(missed, 0);
    assert!(timer.is_stopped());
    assert_eq!(timer.deadline(), TimePoint::ZERO);
    assert_eq!(timer.interval(), Duration::ZERO);

    // Stopping a stopped timer is a no-op snapshot of the sentinel.
    let (deadline, interval, _) = timer.stop();
    assert_eq!(deadline, TimePoint::ZERO);
    assert_eq!(interval, Duration::ZERO);
}

#[test]
fn reset_restarts_a_stopped_timer() {
    let sched = Scheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let timer: Timer = {
        let count = count.clone();
        // Zero interval: constructed stopped.
        Timer::with_interval(
            &sched,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::ZERO,
        )
        .expect("timer")
    };
    assert!(timer.is_stopped());
    sched.run().expect("run immediately returns, nothing armed");
    assert_eq!(count.load(Ordering::SeqCst), 0);

    timer
        .reset(&sched, MonotonicClock::now() + ms(20), Duration::ZERO)
        .expect("reset");
    assert!(!timer.is_stopped());
    sched.run().expect("run");
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn reset_interval_keeps_the_deadline() {
    let sched = Scheduler::new();
    let deadline = MonotonicClock::now() + ms(400);
    let timer: Timer = Timer::new(&sched, || {}, deadline, ms(100)).expect("timer");
    let (prev_deadline, prev_interval, _) =
        timer.reset_interval(&sched, ms(250)).expect("reset");
    assert_eq!(prev_deadline, deadline);
    assert_eq!(prev_interval, ms(100));
    assert_eq!(timer.deadline(), deadline);
    assert_eq!(timer.interval(), ms(250));
    timer.stop();
}

#[test]
fn reset_with_past_deadline_precounts_missed_periods() {
    let sched = Scheduler::new();
    let timer: Timer = Timer::new(
        &sched,
        || {},
        MonotonicClock::now() + ms(500),
        Duration::ZERO,
    )
    .expect("timer");

    let now = MonotonicClock::now();
    timer.reset(&sched, now - ms(250), ms(100)).expect("reset");
    // Periods at -150 and -50 are already gone; the deadline moved
    // strictly past now.
    assert_eq!(timer.missed(), 2);
    assert!(timer.deadline() > now);
    timer.stop();
}

#[test]
fn dropping_a_timer_cancels_its_pending_dispatch() {
    let sched = Arc::new(Scheduler::new());
    let count = Arc::new(AtomicUsize::new(0));
    let timer: Timer = {
        let count = count.clone();
        Timer::new(
            &sched,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            MonotonicClock::now() + ms(600),
            Duration::ZERO,
        )
        .expect("timer")
    };
    drop(timer); // before it ever fires
    sched.run().expect("run");
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn wall_clock_timers_fire_too() {
    let sched = Scheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let timer: WallTimer = {
        let count = count.clone();
        Timer::new(
            &sched,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            WallClock::now() + ms(30),
            Duration::ZERO,
        )
        .expect("timer")
    };
    sched.run().expect("run");
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(timer.is_stopped());
}

#[test]
fn monotonic_and_wall_services_coexist() {
    let sched = Scheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mono: Timer = {
        let order = order.clone();
        Timer::new(
            &sched,
            move || order.lock().unwrap().push("mono"),
            MonotonicClock::now() + ms(20),
            Duration::ZERO,
        )
        .expect("timer")
    };
    let wall: WallTimer = {
        let order = order.clone();
        Timer::new(
            &sched,
            move || order.lock().unwrap().push("wall"),
            WallClock::now() + ms(50),
            Duration::ZERO,
        )
        .expect("timer")
    };
    sched.run().expect("run");
    assert_eq!(*order.lock().unwrap(), ["mono", "wall"]);
    drop((mono, wall));
}

//! Load and cross-thread tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use spindle::timer::Clock;
use spindle::{MonotonicClock, Scheduler, Task, Timer};

static CANCEL_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[test]
fn cancel_half_of_a_million_tasks() {
    let sched = Scheduler::new();
    let tasks: Vec<Task> = (0..1_000_000)
        .map(|_| {
            Task::from_fn(|| {
                CANCEL_COUNTER.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    for task in &tasks {
        sched.dispatch(task);
    }
    for task in tasks.iter().skip(1).step_by(2) {
        assert!(task.cancel());
    }
    sched.run().expect("run");
    assert_eq!(CANCEL_COUNTER.load(Ordering::Relaxed), 500_000);
}

#[test]
fn many_threads_posting() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 10_000;
    let sched = Arc::new(Scheduler::new());
    let count = Arc::new(AtomicUsize::new(0));

    let tasks: Arc<Vec<Task>> = Arc::new(
        (0..THREADS * PER_THREAD)
            .map(|_| {
                let count = count.clone();
                Task::from_fn(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect(),
    );

    let mut posters = Vec::new();
    for t in 0..THREADS {
        let sched = sched.clone();
        let tasks = tasks.clone();
        posters.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                sched.post(&tasks[t * PER_THREAD + i]);
            }
        }));
    }
    for poster in posters {
        poster.join().expect("poster");
    }

    sched.run().expect("run");
    assert_eq!(count.load(Ordering::Relaxed), THREADS * PER_THREAD);
}

#[test]
fn cross_thread_post_wakes_a_blocked_scheduler() {
    let sched = Arc::new(Scheduler::new());

    // A far-future timer keeps the event monitor alive so the
    // scheduler actually blocks in the readiness wait.
    let keepalive: Timer = Timer::new(
        &sched,
        || {},
        MonotonicClock::now() + Duration::from_secs(30),
        Duration::ZERO,
    )
    .expect("timer");

    let posted_at = Arc::new(Mutex::new(None::<Instant>));
    let stopper = {
        let sched = sched.clone();
        Arc::new(Task::from_fn(move || sched.stop()))
    };

    let poster = {
        let sched = sched.clone();
        let stopper = stopper.clone();
        let posted_at = posted_at.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            *posted_at.lock().unwrap() = Some(Instant::now());
            sched.post(&stopper);
        })
    };

    sched.run().expect("run");
    let woke_after = posted_at
        .lock()
        .unwrap()
        .expect("poster ran before run returned")
        .elapsed();
    poster.join().expect("poster");
    assert!(
        woke_after < Duration::from_millis(100),
        "wake took {:?}",
        woke_after
    );
    drop(keepalive);
}

#[test]
fn interleaved_rounds_under_load() {
    // Each round dispatches the next; 1,000 rounds of 100 tasks.
    const ROUNDS: usize = 1_000;
    const WIDTH: usize = 100;
    let sched = Arc::new(Scheduler::new());
    let count = Arc::new(AtomicUsize::new(0));

    struct Wave {
        sched: Arc<Scheduler>,
        count: Arc<AtomicUsize>,
        tasks: Mutex<Vec<Task>>,
    }

    let wave = Arc::new(Wave {
        sched: sched.clone(),
        count: count.clone(),
        tasks: Mutex::new(Vec::new()),
    });

    fn launch(wave: &Arc<Wave>, round: usize) {
        let mut fresh = Vec::new();
        for i in 0..WIDTH {
            let wave2 = wave.clone();
            let task = Task::from_fn(move || {
                wave2.count.fetch_add(1, Ordering::Relaxed);
                if i == 0 && round + 1 < ROUNDS {
                    launch(&wave2, round + 1);
                }
            });
            wave.sched.dispatch(&task);
            fresh.push(task);
        }
        wave.tasks.lock().unwrap().extend(fresh);
    }

    launch(&wave, 0);
    sched.run().expect("run");
    assert_eq!(count.load(Ordering::Relaxed), ROUNDS * WIDTH);
}

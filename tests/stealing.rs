use fiber_tasks::{Builder, Runtime, WorkerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

fn new_runtime(workers: usize) -> Arc<Runtime> {
    INIT.call_once(pretty_env_logger::init);
    Builder::new().workers(Some(workers)).build().unwrap()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// A parked task whose owning worker is stuck in user code gets picked up
/// by the sibling: ownership moves, and the task resumes over there.
#[test]
fn parked_task_is_stolen_from_a_busy_carrier() {
    let runtime = new_runtime(2);

    let ids = Arc::new(Mutex::new(Vec::<WorkerId>::new()));
    let stop = Arc::new(AtomicBool::new(false));

    let parker = {
        let ids = Arc::clone(&ids);
        let stop = Arc::clone(&stop);
        runtime
            .spawn("parker", move || {
                ids.lock().unwrap().push(fiber_tasks::current_worker_id().unwrap());
                fiber_tasks::park();
                ids.lock().unwrap().push(fiber_tasks::current_worker_id().unwrap());
                stop.store(true, Ordering::Release);
            })
            .unwrap()
    };

    assert!(wait_until(Duration::from_secs(2), || {
        !ids.lock().unwrap().is_empty() && parker.is_parked()
    }));
    let home = ids.lock().unwrap()[0];

    // Occupy the parker's worker with a spinning task so its own thread
    // cannot dispatch the wakeup. Placement is round-robin, so retry until
    // a blocker lands on the right worker; the misplaced ones just exit.
    let claimed = Arc::new(AtomicBool::new(false));
    for _ in 0..16 {
        let claimed_worker = Arc::clone(&claimed);
        let stop = Arc::clone(&stop);
        runtime
            .spawn("blocker", move || {
                if fiber_tasks::current_worker_id() == Some(home) {
                    claimed_worker.store(true, Ordering::Release);
                    while !stop.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                }
            })
            .unwrap();
        if wait_until(Duration::from_millis(100), || claimed.load(Ordering::Acquire)) {
            break;
        }
    }
    assert!(claimed.load(Ordering::Acquire));

    // The wakeup lands on the busy worker's queue; the idle sibling steals
    // it and resumes the task on its own carrier.
    parker.unpark();
    assert!(wait_until(Duration::from_secs(2), || stop.load(Ordering::Acquire)));
    parker.join().unwrap();

    let ids = ids.lock().unwrap().clone();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let counters = runtime.carrier_counters();
    let steals: u64 = counters.iter().map(|c| c.steals).sum();
    let failures: u64 = counters.iter().map(|c| c.steal_failures).sum();
    assert_eq!(steals, 1);
    assert_eq!(failures, 0);

    assert!(wait_until(Duration::from_secs(2), || runtime.running_tasks() == 0));
    runtime.shutdown();
}

/// Whichever carrier ends up resuming a parked task, the task's own
/// identity is untouched by the move.
#[test]
fn task_identity_survives_park_and_resume() {
    let runtime = new_runtime(2);

    let witness = Arc::new(Mutex::new(Vec::<String>::new()));
    let stop = Arc::new(AtomicBool::new(false));

    let parker = {
        let witness = Arc::clone(&witness);
        let stop = Arc::clone(&stop);
        runtime
            .spawn("witness", move || {
                witness
                    .lock()
                    .unwrap()
                    .push(fiber_tasks::current_task_name().unwrap());
                fiber_tasks::park();
                witness
                    .lock()
                    .unwrap()
                    .push(fiber_tasks::current_task_name().unwrap());
                stop.store(true, Ordering::Release);
            })
            .unwrap()
    };

    assert!(wait_until(Duration::from_secs(2), || parker.is_parked()));
    parker.unpark();
    assert!(wait_until(Duration::from_secs(2), || stop.load(Ordering::Acquire)));
    parker.join().unwrap();

    // The name travels with the task no matter which carrier resumed it.
    let witness = witness.lock().unwrap().clone();
    assert_eq!(witness, ["witness", "witness"]);

    runtime.shutdown();
}

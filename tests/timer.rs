use fiber_tasks::{Builder, Runtime};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

fn new_runtime(workers: usize) -> Arc<Runtime> {
    INIT.call_once(pretty_env_logger::init);
    Builder::new().workers(Some(workers)).build().unwrap()
}

#[test]
fn sleep_waits_for_the_deadline() {
    let runtime = new_runtime(1);
    let elapsed = Arc::new(Mutex::new(None));

    let handle = {
        let elapsed = Arc::clone(&elapsed);
        runtime
            .spawn("sleeper", move || {
                let start = Instant::now();
                fiber_tasks::sleep(Duration::from_millis(30));
                *elapsed.lock().unwrap() = Some(start.elapsed());
            })
            .unwrap()
    };
    handle.join().unwrap();

    let elapsed = elapsed.lock().unwrap().expect("task did not record");
    assert!(elapsed >= Duration::from_millis(30), "woke after {elapsed:?}");

    runtime.shutdown();
}

/// An unpark before the deadline ends the sleep early and cancels the
/// timer; the canceled binding must not fire into the next park.
#[test]
fn canceled_timer_does_not_fire() {
    let runtime = new_runtime(1);
    let timings = Arc::new(Mutex::new(None));

    let handle = {
        let timings = Arc::clone(&timings);
        runtime
            .spawn("canceled", move || {
                let start = Instant::now();
                fiber_tasks::sleep(Duration::from_millis(200));
                let first = start.elapsed();

                let start = Instant::now();
                fiber_tasks::sleep(Duration::from_millis(150));
                let second = start.elapsed();

                *timings.lock().unwrap() = Some((first, second));
            })
            .unwrap()
    };

    std::thread::sleep(Duration::from_millis(10));
    handle.unpark();
    handle.join().unwrap();

    let (first, second) = timings.lock().unwrap().expect("task did not record");
    // Woken by the unpark, well before the 200 ms deadline.
    assert!(first < Duration::from_millis(200), "first wake after {first:?}");
    // Had the canceled 200 ms timer fired anyway, it would have cut the
    // second sleep short.
    assert!(
        second >= Duration::from_millis(150),
        "second wake after {second:?}"
    );

    runtime.shutdown();
}

/// With high-precision timers, an in-task registration is deferred to the
/// run-loop epilog and still fires on time.
#[test]
fn high_precision_timer_fires_from_the_epilog() {
    INIT.call_once(pretty_env_logger::init);
    let runtime = Builder::new()
        .workers(Some(1))
        .high_precision_timer(true)
        .build()
        .unwrap();

    let elapsed = Arc::new(Mutex::new(None));
    let handle = {
        let elapsed = Arc::clone(&elapsed);
        runtime
            .spawn("hp-sleeper", move || {
                let start = Instant::now();
                fiber_tasks::sleep(Duration::from_millis(20));
                *elapsed.lock().unwrap() = Some(start.elapsed());
            })
            .unwrap()
    };
    handle.join().unwrap();

    let elapsed = elapsed.lock().unwrap().expect("task did not record");
    assert!(elapsed >= Duration::from_millis(20), "woke after {elapsed:?}");

    runtime.shutdown();
}

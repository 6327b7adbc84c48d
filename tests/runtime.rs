use fiber_tasks::{Builder, Carrier, ChannelId, Error, EventPump, Interest, Runtime, WakeupHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
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

#[test]
fn spawn_tasks() {
    const NUM_TASKS: usize = 100;

    let runtime = new_runtime(2);
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..NUM_TASKS)
        .map(|i| {
            let counter = Arc::clone(&counter);
            runtime
                .spawn(&format!("task-{i}"), move || {
                    counter.fetch_add(1, Ordering::AcqRel);
                })
                .unwrap()
        })
        .collect();

    for handle in &handles {
        handle.join().unwrap();
        assert!(handle.is_finished());
    }
    assert_eq!(counter.load(Ordering::Acquire), NUM_TASKS);
    assert!(wait_until(Duration::from_secs(2), || runtime.running_tasks() == 0));

    runtime.shutdown();
}

#[test]
fn exited_tasks_fill_local_cache_then_spill() {
    const NUM_TASKS: usize = 100;
    const CACHE_SIZE: usize = 16;

    INIT.call_once(pretty_env_logger::init);
    let runtime = Builder::new()
        .workers(Some(1))
        .task_cache_size(CACHE_SIZE)
        .build()
        .unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..NUM_TASKS)
        .map(|i| {
            let started = Arc::clone(&started);
            runtime
                .spawn(&format!("parked-{i}"), move || {
                    started.fetch_add(1, Ordering::AcqRel);
                    fiber_tasks::park();
                })
                .unwrap()
        })
        .collect();

    // All tasks must be live at once so none is recycled before the cache
    // fills.
    assert!(wait_until(Duration::from_secs(2), || {
        started.load(Ordering::Acquire) == NUM_TASKS
    }));
    assert_eq!(runtime.running_tasks(), NUM_TASKS);

    for handle in &handles {
        handle.unpark();
    }
    for handle in &handles {
        handle.join().unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || runtime.running_tasks() == 0));

    let counters = runtime.carrier_counters();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].cached_tasks, CACHE_SIZE);
    assert_eq!(runtime.group_cache_len(), NUM_TASKS - CACHE_SIZE);

    runtime.shutdown();
}

#[test]
fn first_park_returns_to_spawner() {
    let runtime = new_runtime(1);
    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    let outer = {
        let spawner = Arc::clone(&runtime);
        let order = Arc::clone(&order);
        runtime
            .spawn("outer", move || {
                let child = {
                    let order = Arc::clone(&order);
                    spawner
                        .spawn("child", move || {
                            order.lock().unwrap().push("child:start");
                            fiber_tasks::park();
                            order.lock().unwrap().push("child:resumed");
                        })
                        .unwrap()
                };
                // The child ran inline up to its park; we continue before
                // any other task does.
                order.lock().unwrap().push("outer:after-spawn");
                child.unpark();
            })
            .unwrap()
    };

    outer.join().unwrap();
    assert!(wait_until(Duration::from_secs(2), || runtime.running_tasks() == 0));

    let order = order.lock().unwrap().clone();
    assert_eq!(order, ["child:start", "outer:after-spawn", "child:resumed"]);

    runtime.shutdown();
}

#[test]
fn yield_runs_queued_task_first() {
    let runtime = new_runtime(1);
    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    let outer = {
        let spawner = Arc::clone(&runtime);
        let order = Arc::clone(&order);
        runtime
            .spawn("a", move || {
                order.lock().unwrap().push("a:1");
                let b = {
                    let order = Arc::clone(&order);
                    spawner
                        .spawn("b", move || {
                            order.lock().unwrap().push("b:1");
                            fiber_tasks::park();
                            order.lock().unwrap().push("b:2");
                        })
                        .unwrap()
                };
                order.lock().unwrap().push("a:2");
                b.unpark();
                fiber_tasks::yield_now();
                order.lock().unwrap().push("a:3");
            })
            .unwrap()
    };

    outer.join().unwrap();
    assert!(wait_until(Duration::from_secs(2), || runtime.running_tasks() == 0));

    // B was runnable when A yielded, so B ran before A resumed.
    let order = order.lock().unwrap().clone();
    assert_eq!(order, ["a:1", "b:1", "a:2", "b:2", "a:3"]);

    runtime.shutdown();
}

#[test]
fn shutdown_drains_tasks_and_rejects_spawns() {
    let runtime = new_runtime(2);
    let wakeups = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let wakeups = Arc::clone(&wakeups);
            runtime
                .spawn(&format!("sleeper-{i}"), move || loop {
                    fiber_tasks::sleep(Duration::from_millis(5));
                    wakeups.fetch_add(1, Ordering::AcqRel);
                })
                .unwrap()
        })
        .collect();

    assert!(wait_until(Duration::from_secs(2), || {
        wakeups.load(Ordering::Acquire) >= 4
    }));

    runtime.shutdown();

    assert!(runtime.has_been_shutdown());
    assert_eq!(runtime.running_tasks(), 0);
    assert!(matches!(
        runtime.spawn("late", || {}),
        Err(Error::Rejected)
    ));
    for handle in &handles {
        assert!(handle.is_finished());
        assert!(matches!(handle.join(), Err(Error::TaskAborted)));
    }
}

#[test]
fn detached_carrier_is_identity_only() {
    let runtime = new_runtime(1);

    std::thread::spawn(|| {
        assert!(fiber_tasks::current_worker_id().is_none());
        let carrier = Carrier::current_or_attach().unwrap();
        assert!(carrier.worker_id().is_none());
        assert!(matches!(
            carrier.spawn("nope", || {}),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(carrier.hand_off(), Err(Error::InvalidState(_))));
    })
    .join()
    .unwrap();

    runtime.shutdown();
}

#[test]
fn worker_identity_is_visible_inside_tasks() {
    let runtime = new_runtime(1);
    let seen = Arc::new(Mutex::new(None));

    let handle = {
        let seen = Arc::clone(&seen);
        runtime
            .spawn("who-am-i", move || {
                *seen.lock().unwrap() = Some((
                    fiber_tasks::current_worker_id(),
                    fiber_tasks::current_task_name(),
                ));
            })
            .unwrap()
    };
    handle.join().unwrap();

    let seen = seen.lock().unwrap().clone();
    let (worker, name) = seen.expect("task did not run");
    assert!(worker.is_some());
    assert_eq!(name.as_deref(), Some("who-am-i"));

    runtime.shutdown();
}

#[derive(Default)]
struct RecordingPump {
    registrations: Mutex<Vec<(ChannelId, Interest, WakeupHandle)>>,
    deregistered: Mutex<Vec<ChannelId>>,
}

impl EventPump for RecordingPump {
    fn register(&self, wakeup: WakeupHandle, channel: ChannelId, interest: Interest) {
        self.registrations
            .lock()
            .unwrap()
            .push((channel, interest, wakeup));
    }

    fn deregister(&self, channel: ChannelId) {
        self.deregistered.lock().unwrap().push(channel);
    }
}

#[test]
fn event_pump_readiness_wakes_the_task() {
    INIT.call_once(pretty_env_logger::init);
    let pump = Arc::new(RecordingPump::default());
    let runtime = Builder::new()
        .workers(Some(1))
        .event_pump(pump.clone())
        .build()
        .unwrap();

    let handle = runtime
        .spawn("reader", || {
            let carrier = Carrier::current_or_attach().unwrap();
            carrier
                .register_event(ChannelId(7), Interest::READABLE)
                .unwrap();
            fiber_tasks::park();
            Carrier::current_or_attach().unwrap().unregister_event();
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        !pump.registrations.lock().unwrap().is_empty()
    }));
    {
        let registrations = pump.registrations.lock().unwrap();
        let (channel, interest, wakeup) = &registrations[0];
        assert_eq!(*channel, ChannelId(7));
        assert!(interest.contains(Interest::READABLE));
        // Simulate readiness.
        wakeup.wake();
    }

    handle.join().unwrap();
    assert_eq!(*pump.deregistered.lock().unwrap(), [ChannelId(7)]);

    runtime.shutdown();
}

use mpsc_channel::{Channel, Receiver, SendError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use sync_tools::LockExt;
use worker_pool::{
    Executor, PoolConfig, SpawnOptions, TaskError, TaskHandle, TaskStatus, Worker,
};

fn worker(max_workers: usize) -> Worker {
    Worker::with_config(PoolConfig::default().with_max_workers(max_workers))
}

fn wait<T: Clone>(handle: &TaskHandle<T>) -> Result<T, TaskError> {
    Executor::new().unwrap().run_until_complete(handle)
}

#[test]
fn pipeline_squares() {
    let worker = worker(4);
    let (numbers_tx, numbers_rx) = Channel::bounded::<u64>(5);
    let (squares_tx, squares_rx) = Channel::bounded::<u64>(5);

    let produce = worker.spawn(move || {
        for i in 1..=50 {
            numbers_tx.send(i).unwrap();
        }
    });
    let square = worker.spawn(move || {
        for n in &numbers_rx {
            squares_tx.send(n * n).unwrap();
        }
    });
    let sum = worker.spawn(move || squares_rx.iter().sum::<u64>());

    assert_eq!(wait(&sum).unwrap(), 42925);
    wait(&produce).unwrap();
    wait(&square).unwrap();
}

#[test]
fn fan_out_to_three_workers() {
    let worker = worker(4);
    let (jobs_tx, jobs_rx) = Channel::new::<u32>(None);
    let (results_tx, results_rx) = Channel::unbounded::<u32>();
    let jobs_rx = Arc::new(jobs_rx);

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let jobs_rx = Arc::clone(&jobs_rx);
            let results_tx = results_tx.clone();
            worker.spawn(move || {
                let mut handled = 0usize;
                while let Some(job) = jobs_rx.receive() {
                    results_tx.send(job * 10).unwrap();
                    handled += 1;
                }
                handled
            })
        })
        .collect();
    drop(results_tx);

    for job in 0..10 {
        jobs_tx.send(job).unwrap();
    }
    jobs_tx.close();

    let handled: usize = consumers.iter().map(|c| wait(c).unwrap()).sum();
    assert_eq!(handled, 10);

    let mut results: Vec<_> = results_rx.into_iter().collect();
    results.sort_unstable();
    assert_eq!(results, (0..10).map(|i| i * 10).collect::<Vec<_>>());
}

#[test]
fn fan_in_from_five_producers() {
    let worker = worker(6);
    let (tx, rx) = Channel::bounded::<(usize, usize)>(8);

    let producers = worker.spawn_all((0..5).map(|id| {
        let tx = tx.clone();
        move || {
            for seq in 0..20 {
                tx.send((id, seq)).unwrap();
            }
        }
    }));
    drop(tx);

    let mut tally: HashMap<usize, Vec<usize>> = HashMap::new();
    for (id, seq) in &rx {
        tally.entry(id).or_default().push(seq);
    }
    wait(&producers).unwrap();

    assert_eq!(tally.len(), 5);
    for seqs in tally.values() {
        // Each producer's own values arrive in the order it sent them.
        assert_eq!(*seqs, (0..20).collect::<Vec<_>>());
    }
}

#[test]
fn bounded_channel_backpressure() {
    let worker = worker(2);
    let (tx, rx) = Channel::bounded::<usize>(5);
    let send_times = Arc::new(Mutex::new(Vec::<Duration>::new()));

    let recorded = Arc::clone(&send_times);
    let producer = worker.spawn(move || {
        for i in 0..10 {
            let start = Instant::now();
            tx.send(i).unwrap();
            recorded.locked().push(start.elapsed());
        }
    });

    thread::sleep(Duration::from_millis(100));
    assert_eq!(rx.len(), 5);
    let received: Vec<_> = rx.iter().collect();
    wait(&producer).unwrap();

    assert_eq!(received, (0..10).collect::<Vec<_>>());
    let send_times = send_times.locked();
    assert!(send_times[..5].iter().all(|t| *t < Duration::from_millis(50)));
    assert!(send_times[5] >= Duration::from_millis(50));
}

#[test]
fn unbounded_channel_never_blocks() {
    let worker = worker(1);
    let (tx, rx) = Channel::unbounded::<usize>();

    let producer = worker.spawn(move || {
        let start = Instant::now();
        for i in 0..1000 {
            tx.send(i).unwrap();
        }
        start.elapsed()
    });

    let elapsed = wait(&producer).unwrap();
    assert!(elapsed < Duration::from_millis(500));
    assert_eq!(rx.len(), 1000);
    assert_eq!(rx.try_iter().count(), 1000);
    assert!(rx.receive().is_none());
}

#[derive(Debug)]
struct BadItem(i32);

impl std::fmt::Display for BadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot process item {}", self.0)
    }
}

impl std::error::Error for BadItem {}

#[test]
fn error_in_task_keeps_partial_data() {
    let worker = worker(2);
    let (tx, rx) = Channel::unbounded::<i32>();

    let producer = worker.try_spawn(move || -> Result<(), BadItem> {
        for item in [1, 2, -3, 4] {
            if item < 0 {
                return Err(BadItem(item));
            }
            tx.send(item).unwrap();
        }
        Ok(())
    });

    let err = wait(&producer).unwrap_err();
    assert_eq!(err.to_string(), "cannot process item -3");
    assert_eq!(err.downcast_ref::<BadItem>().map(|e| e.0), Some(-3));
    // The failed producer dropped its sender, so the receiver ends after the partial data.
    assert_eq!(rx.iter().collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn channel_closed_while_sending() {
    let worker = worker(2);
    let (tx, rx): (Sender<u8>, Receiver<u8>) = Channel::bounded(1);

    let producer = worker.spawn(move || {
        tx.send(1).unwrap();
        tx.send(2).map_err(SendError::into_inner)
    });

    thread::sleep(Duration::from_millis(50));
    rx.close();
    assert_eq!(wait(&producer).unwrap(), Err(2));
    // Closing the receiver keeps what was already buffered.
    assert_eq!(rx.receive(), Some(1));
    assert_eq!(rx.receive(), None);
}

#[test]
fn fifty_workers_ten_items_each() {
    let worker = worker(8);
    let (tx, rx) = Channel::bounded::<usize>(16);

    let producers = worker.spawn_all((0..50).map(|id| {
        let tx = tx.clone();
        move || {
            for i in 0..10 {
                tx.send(id * 10 + i).unwrap();
            }
        }
    }));
    drop(tx);

    let mut received: Vec<_> = rx.into_iter().collect();
    wait(&producers).unwrap();
    received.sort_unstable();
    assert_eq!(received, (0..500).collect::<Vec<_>>());
}

#[test]
fn cancel_before_the_task_runs() {
    let worker = worker(1);
    let (release_tx, release_rx) = Channel::bounded::<()>(1);
    let blocker = worker.spawn(move || release_rx.receive());

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let task = worker.spawn(move || counter.fetch_add(1, Ordering::SeqCst));
    assert!(task.cancel());
    assert!(!task.cancel());

    release_tx.send(()).unwrap();
    wait(&blocker).unwrap();
    assert!(wait(&task).unwrap_err().is_cancelled());
    worker.shutdown(true);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn timeout_on_slow_task() {
    let worker = worker(2);
    let start = Instant::now();
    let task = worker.spawn_with(
        || thread::sleep(Duration::from_millis(300)),
        SpawnOptions::new().timeout(Duration::from_millis(100)),
    );

    match wait(&task) {
        Err(TaskError::TimedOut(budget)) => assert_eq!(budget, Duration::from_millis(100)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(task.status(), TaskStatus::TimedOut);
}

#[test]
fn spawn_all_fails_fast() {
    let worker = worker(3);
    let start = Instant::now();
    let all = worker.try_spawn_all((0..3).map(|i| {
        move || -> Result<u32, BadItem> {
            if i == 1 {
                thread::sleep(Duration::from_millis(10));
                Err(BadItem(1))
            } else {
                thread::sleep(Duration::from_millis(300));
                Ok(i)
            }
        }
    }));

    let err = wait(&all).unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(250));
    assert!(err.downcast_ref::<BadItem>().is_some());
}

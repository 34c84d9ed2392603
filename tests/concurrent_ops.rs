//! Multi-thread end-to-end scenarios for the concurrent containers.

use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicIsize, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::thread;

use kioku::{Bbq, BoundedQueue, BoundedStack, UnboundedQueue, UnboundedStack};

const PRODUCERS: usize = 4;
const CONSUMERS: usize = 4;
const PER_PRODUCER: usize = 25_000;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runs `PRODUCERS` pushers and `CONSUMERS` poppers against a queue-like
/// `push`/`pop` pair and checks that every value surfaces exactly once.
fn check_mpmc_accounting<C>(container: Arc<C>, push: fn(&C, usize) -> bool, pop: fn(&C) -> Option<usize>)
where
    C: Send + Sync + 'static,
{
    let total = PRODUCERS * PER_PRODUCER;
    let received = Arc::new(Mutex::new(Vec::new()));
    let consumed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let container = Arc::clone(&container);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let value = p * PER_PRODUCER + i;
                while !push(&container, value) {
                    thread::yield_now();
                }
            }
        }));
    }
    for _ in 0..CONSUMERS {
        let container = Arc::clone(&container);
        let received = Arc::clone(&received);
        let consumed = Arc::clone(&consumed);
        handles.push(thread::spawn(move || {
            let mut local = Vec::new();
            while consumed.load(Ordering::Relaxed) < total {
                if let Some(value) = pop(&container) {
                    local.push(value);
                    consumed.fetch_add(1, Ordering::Relaxed);
                } else {
                    thread::yield_now();
                }
            }
            received.lock().unwrap().extend(local);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), total);
    let unique: HashSet<usize> = received.iter().copied().collect();
    assert_eq!(unique.len(), total, "some value surfaced more than once");
    assert!(pop(&container).is_none());
}

#[test]
fn bounded_queue_mpmc_accounts_for_every_value() {
    init_logger();
    check_mpmc_accounting(
        Arc::new(BoundedQueue::<usize, 64>::new()),
        |q, v| q.push(v).is_ok(),
        BoundedQueue::pop,
    );
}

#[test]
fn bbq_mpmc_accounts_for_every_value() {
    init_logger();
    check_mpmc_accounting(
        Arc::new(Bbq::<usize, 64, 8>::new()),
        |q, v| q.push(v).is_ok(),
        Bbq::pop,
    );
}

#[test]
fn bounded_stack_mpmc_accounts_for_every_value() {
    init_logger();
    check_mpmc_accounting(
        Arc::new(BoundedStack::<usize, 64>::new()),
        BoundedStack::push,
        BoundedStack::pop,
    );
}

#[test]
fn unbounded_queue_mpmc_accounts_for_every_value() {
    init_logger();
    check_mpmc_accounting(
        Arc::new(UnboundedQueue::<usize>::new()),
        |q, v| {
            q.push(v);
            true
        },
        UnboundedQueue::pop,
    );
}

#[test]
fn unbounded_stack_mpmc_accounts_for_every_value() {
    init_logger();
    check_mpmc_accounting(
        Arc::new(UnboundedStack::<usize>::new()),
        |s, v| {
            s.push(v);
            true
        },
        UnboundedStack::pop,
    );
}

#[test]
fn bounded_queue_spsc_preserves_fifo_order() {
    init_logger();
    const COUNT: usize = 200_000;
    let queue: Arc<BoundedQueue<usize, 128>> = Arc::new(BoundedQueue::new());

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for value in 0..COUNT {
                while queue.push(value).is_err() {
                    thread::yield_now();
                }
            }
        })
    };

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut expected = 0;
            while expected < COUNT {
                if let Some(value) = queue.pop() {
                    assert_eq!(value, expected);
                    expected += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
    assert!(queue.is_empty());
}

#[test]
fn unbounded_queue_keeps_per_producer_order() {
    init_logger();
    const COUNT: usize = 50_000;
    let queue: Arc<UnboundedQueue<(usize, usize)>> = Arc::new(UnboundedQueue::new());

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            for seq in 0..COUNT {
                queue.push((p, seq));
            }
        }));
    }

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut next_seq = [0usize; PRODUCERS];
            let mut remaining = PRODUCERS * COUNT;
            while remaining > 0 {
                if let Some((p, seq)) = queue.pop() {
                    assert_eq!(seq, next_seq[p], "producer {p} reordered");
                    next_seq[p] += 1;
                    remaining -= 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    for producer in producers {
        producer.join().unwrap();
    }
    consumer.join().unwrap();
    assert!(queue.is_empty());
}

#[test]
fn bounded_queue_never_exceeds_capacity() {
    init_logger();
    const CAPACITY: usize = 16;
    let queue: Arc<BoundedQueue<usize, CAPACITY>> = Arc::new(BoundedQueue::new());
    let outstanding = Arc::new(AtomicIsize::new(0));

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        let outstanding = Arc::clone(&outstanding);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                if queue.push(p * PER_PRODUCER + i).is_ok() {
                    let seen = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    // The counter trails pushes and leads pops by at most
                    // one in-flight update per thread.
                    assert!(seen <= (CAPACITY + PRODUCERS + CONSUMERS) as isize);
                }
            }
        }));
    }
    for _ in 0..CONSUMERS {
        let queue = Arc::clone(&queue);
        let outstanding = Arc::clone(&outstanding);
        handles.push(thread::spawn(move || {
            for _ in 0..PER_PRODUCER {
                if queue.pop().is_some() {
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                } else {
                    thread::yield_now();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

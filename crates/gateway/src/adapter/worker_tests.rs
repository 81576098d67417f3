use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn spawned_tasks_all_complete() {
    let pool = WorkerPool::new(2);
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let counter = Arc::clone(&counter);
        handles.push(pool.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn result_is_propagated_back_through_the_handle() {
    let pool = WorkerPool::new(1);
    let handle = pool.spawn(async { 7 + 35 });
    assert_eq!(handle.await.unwrap(), 42);
}

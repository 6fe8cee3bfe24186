mod common;

use common::{manual_runner, setup_log};
use futures::executor::block_on;
use promise_graph::{
    all, all_vec, any, Error, ManualPromiseResolver, Promise, PromiseResult, Rejected, Resolved,
    TaskRunner, TaskRunnerRef, ThreadTaskRunner, ThreadTaskRunnerConfig,
};
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

fn thread_runner(name: &str) -> (Arc<ThreadTaskRunner>, TaskRunnerRef) {
    let runner = ThreadTaskRunner::start(ThreadTaskRunnerConfig {
        name: name.into(),
        ..Default::default()
    })
    .expect("failed to start the task runner");
    let handle: TaskRunnerRef = runner.clone();
    (runner, handle)
}

#[test]
fn test_then_catch_finally_chain() {
    setup_log();
    let (runner, handle) = manual_runner();
    let resolver = ManualPromiseResolver::<u32, String>::new();
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let parsed = resolver
        .promise()
        .then(&handle, |v: &u32| -> PromiseResult<u32, String> {
            if *v > 10 {
                PromiseResult::Rejected(format!("{v} is too big"))
            } else {
                PromiseResult::Resolved(v + 1)
            }
        })
        .catch(&handle, |e: &String| Resolved(e.len() as u32))
        .finally(&handle, move || {
            flag.store(true, Ordering::SeqCst);
            Resolved("done")
        });

    resolver.resolve(42);
    runner.run_until_idle();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(parsed.value().as_deref(), Some(&"done"));
}

#[test]
fn test_then_and_catch_picks_one_branch() {
    setup_log();
    let (runner, handle) = manual_runner();
    let ok = Promise::<i32, String>::resolved(4).then_and_catch(
        &handle,
        |v: &i32| Resolved(format!("value {v}")),
        |e: &String| Ok::<String, String>(format!("error {e}")),
    );
    let failed = Promise::<i32, String>::rejected("🍓".into()).then_and_catch(
        &handle,
        |v: &i32| Ok::<String, u8>(format!("value {v}")),
        |_: &String| Rejected(7_u8),
    );
    failed.ignore_uncaught_catch_for_testing();
    runner.run_until_idle();

    assert_eq!(ok.value().as_deref().map(String::as_str), Some("value 4"));
    assert_eq!(failed.error().as_deref(), Some(&7));
}

#[test]
fn test_catch_move_recovers() {
    setup_log();
    let (runner, handle) = manual_runner();
    let recovered = Promise::<Vec<u8>, Vec<u8>>::rejected(vec![1, 2, 3])
        .catch_move(&handle, |mut bytes: Vec<u8>| {
            bytes.reverse();
            Resolved(bytes)
        });
    runner.run_until_idle();
    assert_eq!(recovered.value().as_deref(), Some(&vec![3, 2, 1]));
}

#[test]
fn test_all_tuple_of_mixed_types() {
    setup_log();
    let (runner, handle) = manual_runner();
    let number = Promise::<i32>::post_task(&handle, || Ok(10));
    let text = Promise::<String>::post_task(&handle, || Ok("ten".to_string()));
    let joined = all((number, text, Promise::<bool>::resolved(true)));
    assert!(!joined.is_settled());
    runner.run_until_idle();
    assert_eq!(
        joined.value().as_deref(),
        Some(&(10, "ten".to_string(), true))
    );
}

#[test]
fn test_all_vec_concrete_scenario() {
    setup_log();
    let resolvers: Vec<_> = (0..3).map(|_| ManualPromiseResolver::<i32>::new()).collect();
    let joined = all_vec(resolvers.iter().map(ManualPromiseResolver::promise));
    resolvers[1].resolve(20);
    resolvers[0].resolve(10);
    resolvers[2].resolve(30);
    assert_eq!(block_on(joined.into_future()), Ok(Ok(vec![10, 20, 30])));
}

#[test]
fn test_then_weak_cancels_after_receiver_dropped() {
    setup_log();
    let (runner, handle) = manual_runner();
    let receiver = Arc::new(String::from("receiver"));
    let resolver = ManualPromiseResolver::<usize>::new();

    let alive = resolver
        .promise()
        .then_weak(&handle, &Arc::downgrade(&receiver), |r: &String, v: &usize| {
            Ok(r.len() + v)
        });
    let gone_receiver = Arc::new(String::from("gone"));
    let gone = resolver
        .promise()
        .then_weak(&handle, &Arc::downgrade(&gone_receiver), |r: &String, v: &usize| {
            Ok(r.len() + v)
        });
    drop(gone_receiver);

    resolver.resolve(1);
    runner.run_until_idle();
    assert_eq!(alive.value().as_deref(), Some(&9));
    assert!(gone.is_canceled());
}

#[test]
fn test_continuations_hop_between_threads() {
    setup_log();
    let (first, first_handle) = thread_runner("first");
    let (second, second_handle) = thread_runner("second");

    let names = Promise::<Vec<String>>::post_task(&first_handle, || {
        Ok(vec![thread::current().name().unwrap_or_default().to_string()])
    })
    .then_move(&second_handle, |mut names: Vec<String>| {
        names.push(thread::current().name().unwrap_or_default().to_string());
        Ok(names)
    });

    let task1 = thread::spawn(move || block_on(async { names.await }));
    let names = task1.join().expect("The task1 thread has panicked");
    assert_eq!(names, Ok(Ok(vec!["first".to_string(), "second".to_string()])));

    first.stop();
    second.stop();
}

#[test]
fn test_stopped_runner_cancels_promises() {
    setup_log();
    let (runner, handle) = thread_runner("stopping");
    runner.stop();
    assert_eq!(handle.post_task(Box::new(|| {})), Err(Error::TaskRunnerStopped));

    let posted = Promise::<i32>::post_task(&handle, || Ok(1));
    assert!(posted.is_canceled());
    assert_eq!(block_on(posted.into_future()), Err(Error::Canceled));
}

#[test]
fn test_resolve_from_many_threads() {
    setup_log();
    let (runner, handle) = thread_runner("many");
    let resolvers: Vec<_> = (0..8).map(|_| ManualPromiseResolver::<usize>::new()).collect();
    let doubled: Vec<_> = resolvers
        .iter()
        .map(|resolver| resolver.promise().then(&handle, |v: &usize| Ok(v * 2)))
        .collect();
    let every = all_vec(doubled);

    let tasks: Vec<_> = resolvers
        .into_iter()
        .enumerate()
        .map(|(i, resolver)| thread::spawn(move || resolver.resolve(i)))
        .collect();
    for task in tasks {
        task.join().expect("The resolver thread has panicked");
    }

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || tx.send(block_on(async { every.await })).expect("the receiver is gone"));
    let every = rx.recv().expect("The waiting thread has panicked");
    assert_eq!(every, Ok(Ok((0..8).map(|i| i * 2).collect::<Vec<_>>())));
    runner.stop();
}

#[test]
fn test_any_races_thread_runners() {
    setup_log();
    let (a, a_handle) = thread_runner("a");
    let (b, b_handle) = thread_runner("b");
    let first = any([
        Promise::<u8>::post_task(&a_handle, || Ok(1)),
        Promise::<u8>::post_task(&b_handle, || Ok(2)),
    ]);
    let winner = block_on(first.into_future());
    assert!(matches!(winner, Ok(Ok(1 | 2))));
    a.stop();
    b.stop();
}

#[test]
fn test_dropped_resolver_fails_await() {
    setup_log();
    let resolver = ManualPromiseResolver::<String, String>::new();
    let promise = resolver.promise();
    let task1 = thread::spawn(move || block_on(async { promise.await }));
    let task2 = thread::spawn(move || drop(resolver));
    task2.join().expect("The task2 thread has panicked");
    assert_eq!(
        task1.join().expect("The task1 thread has panicked"),
        Err(Error::Canceled)
    );
}

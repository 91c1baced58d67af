//! Integration tests for ordered stage execution

use audiobook_downloader::converter::StepSequence;
use futures_util::FutureExt;
use std::time::Duration;

#[derive(Default)]
struct Trace {
    ran: Vec<&'static str>,
    errors_caught: usize,
}

#[tokio::test]
async fn test_failure_short_circuits_remaining_stages() {
    let mut steps = StepSequence::<Trace>::new();
    steps.add("A", |t: &mut Trace| {
        async move {
            t.ran.push("A");
            true
        }
        .boxed()
    });
    steps.add("B", |t: &mut Trace| {
        async move {
            t.ran.push("B");
            false
        }
        .boxed()
    });
    steps.add("C", |t: &mut Trace| {
        async move {
            t.ran.push("C");
            true
        }
        .boxed()
    });

    let mut trace = Trace::default();
    let result = steps.run(&mut trace).await;

    assert!(!result.success);
    assert_eq!(trace.ran, vec!["A", "B"]);
}

#[tokio::test]
async fn test_stage_that_handles_its_own_error_counts_as_success() {
    let mut steps = StepSequence::<Trace>::new();
    steps.add("Write sidecar", |t: &mut Trace| {
        async move {
            let written: Result<(), std::io::Error> =
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"));
            if written.is_err() {
                t.errors_caught += 1;
            }
            t.ran.push("Write sidecar");
            true
        }
        .boxed()
    });
    steps.add("Cleanup", |t: &mut Trace| {
        async move {
            t.ran.push("Cleanup");
            true
        }
        .boxed()
    });

    let mut trace = Trace::default();
    let result = steps.run(&mut trace).await;

    assert!(result.success);
    assert_eq!(trace.errors_caught, 1);
    assert_eq!(trace.ran, vec!["Write sidecar", "Cleanup"]);
}

#[tokio::test]
async fn test_elapsed_covers_every_stage() {
    let mut steps = StepSequence::<Trace>::new();
    for name in ["First", "Second"] {
        steps.add(name, move |t: &mut Trace| {
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                t.ran.push(name);
                true
            }
            .boxed()
        });
    }

    let mut trace = Trace::default();
    let result = steps.run(&mut trace).await;

    assert!(result.success);
    assert!(result.elapsed >= Duration::from_millis(40));
}

#[tokio::test]
async fn test_sequence_can_run_twice() {
    let mut steps = StepSequence::<Trace>::new();
    steps.add("Only", |t: &mut Trace| {
        async move {
            t.ran.push("Only");
            true
        }
        .boxed()
    });

    let mut trace = Trace::default();
    assert!(steps.run(&mut trace).await.success);
    assert!(steps.run(&mut trace).await.success);
    assert_eq!(trace.ran, vec!["Only", "Only"]);
}

//! Reader pipeline tests: line validation, namespace prefixing, and
//! deduplication, driven through `process_line` the way the manager's
//! reader tasks drive it.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use stratus::collector::{Collector, CollectorTable};
use stratus::queue::OutboundQueue;
use stratus::reader::{process_line, read_stdout};

fn mk_collector() -> Collector {
    Collector::new("c", 1, PathBuf::from("c"))
}

fn mk_queue(depth: usize) -> (OutboundQueue, mpsc::Receiver<String>) {
    OutboundQueue::new(depth)
}

fn feed(col: &mut Collector, queue: &OutboundQueue, lines: &[&str]) {
    for line in lines {
        process_line(col, queue, None, 600, line);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_numeric_values_are_rejected() {
    // Boolean literals and identifiers are not numbers. The upstream
    // behavior of coercing True/False silently is a bug this agent does
    // not reproduce.
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(
        &mut col,
        &queue,
        &[
            "mymetric 123 True a=b",
            "mymetric 123 False a=b",
            "xxx",
            "mymetric 123 Value a=b",
        ],
    );

    assert!(rx.try_recv().is_err(), "nothing should be enqueued");
    assert_eq!(col.lines_received, 4);
    assert_eq!(col.lines_invalid, 4);
    assert_eq!(col.lines_sent, 0);
}

#[tokio::test]
async fn valid_lines_pass_in_order() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    let lines = [
        "mymetric 123.24 12 a=b",
        "mymetric 124 12.7 a=b",
        "mymetric 125 12.7",
    ];
    feed(&mut col, &queue, &lines);

    for expected in lines {
        assert_eq!(rx.try_recv().unwrap(), expected);
    }
    assert!(rx.try_recv().is_err());
    assert_eq!(col.lines_received, 3);
    assert_eq!(col.lines_invalid, 0);
    assert_eq!(col.lines_sent, 3);
}

#[tokio::test]
async fn empty_line_counts_as_invalid() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(&mut col, &queue, &["", "   "]);

    assert!(rx.try_recv().is_err());
    assert_eq!(col.lines_received, 2);
    assert_eq!(col.lines_invalid, 2);
}

// ---------------------------------------------------------------------------
// Namespace prefix
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prefix_is_prepended_to_metric() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    process_line(&mut col, &queue, Some("my.namespace."), 600, "mymetric 123 12 a=b");

    assert_eq!(rx.try_recv().unwrap(), "my.namespace.mymetric 123 12 a=b");
    assert_eq!(col.lines_received, 1);
    assert_eq!(col.lines_invalid, 0);
}

#[tokio::test]
async fn prefix_is_not_applied_to_invalid_lines() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    process_line(&mut col, &queue, Some("my.namespace."), 600, "mymetric 123 nope");

    assert!(rx.try_recv().is_err());
    assert_eq!(col.lines_invalid, 1);
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeats_are_suppressed_within_the_window() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(
        &mut col,
        &queue,
        &["m 100 1 a=b", "m 200 1 a=b", "m 300 1 a=b"],
    );

    assert_eq!(rx.try_recv().unwrap(), "m 100 1 a=b");
    assert!(rx.try_recv().is_err(), "repeats must be suppressed");
    assert_eq!(col.lines_received, 3);
    assert_eq!(col.lines_sent, 1);
}

#[tokio::test]
async fn heartbeat_after_dedup_interval_carries_current_timestamp() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(
        &mut col,
        &queue,
        &["m 100 1 a=b", "m 200 1 a=b", "m 800 1 a=b"],
    );

    assert_eq!(rx.try_recv().unwrap(), "m 100 1 a=b");
    assert_eq!(rx.try_recv().unwrap(), "m 800 1 a=b");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn value_change_flushes_last_suppressed_point_first() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(
        &mut col,
        &queue,
        &["m 100 1 a=b", "m 200 1 a=b", "m 300 2 a=b"],
    );

    assert_eq!(rx.try_recv().unwrap(), "m 100 1 a=b");
    // The tail of the suppressed run goes out so the series draws a
    // step, not a ramp.
    assert_eq!(rx.try_recv().unwrap(), "m 200 1 a=b");
    assert_eq!(rx.try_recv().unwrap(), "m 300 2 a=b");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn value_change_without_suppression_emits_only_the_new_point() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(&mut col, &queue, &["m 100 1 a=b", "m 200 2 a=b"]);

    assert_eq!(rx.try_recv().unwrap(), "m 100 1 a=b");
    assert_eq!(rx.try_recv().unwrap(), "m 200 2 a=b");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn dedup_compares_values_numerically() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(&mut col, &queue, &["m 100 12 a=b", "m 200 12.0 a=b"]);

    assert_eq!(rx.try_recv().unwrap(), "m 100 12 a=b");
    assert!(rx.try_recv().is_err(), "12 and 12.0 are the same value");
}

#[tokio::test]
async fn distinct_series_do_not_interfere() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(
        &mut col,
        &queue,
        &["m 100 1 a=b", "m 100 1 a=c", "m 100 1"],
    );

    assert_eq!(rx.try_recv().unwrap(), "m 100 1 a=b");
    assert_eq!(rx.try_recv().unwrap(), "m 100 1 a=c");
    assert_eq!(rx.try_recv().unwrap(), "m 100 1");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn tag_order_does_not_split_a_series() {
    let (queue, mut rx) = mk_queue(10);
    let mut col = mk_collector();

    feed(&mut col, &queue, &["m 100 1 a=1 b=2", "m 200 1 b=2 a=1"]);

    assert_eq!(rx.try_recv().unwrap(), "m 100 1 a=1 b=2");
    assert!(rx.try_recv().is_err(), "same series regardless of tag order");
}

// ---------------------------------------------------------------------------
// Queue overflow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overflow_drops_newest_and_counts() {
    let (queue, mut rx) = mk_queue(2);
    let mut col = mk_collector();

    feed(
        &mut col,
        &queue,
        &["m 100 1", "n 100 1", "o 100 1"],
    );

    assert_eq!(queue.dropped(), 1);
    assert_eq!(col.lines_sent, 2);
    assert_eq!(rx.try_recv().unwrap(), "m 100 1");
    assert_eq!(rx.try_recv().unwrap(), "n 100 1");
    assert!(rx.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Line assembly
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unterminated_fragment_at_eof_is_discarded() {
    let (queue, mut rx) = mk_queue(10);
    let table = CollectorTable::new();
    table.insert(mk_collector());

    let (mut child_stdout, pipe) = tokio::io::duplex(256);
    let task = tokio::spawn(read_stdout(
        pipe,
        "c".to_string(),
        table.clone(),
        queue.clone(),
        None,
        600,
    ));

    child_stdout
        .write_all(b"m 123 1\npartial 456 7")
        .await
        .unwrap();
    drop(child_stdout);
    task.await.unwrap();

    assert_eq!(rx.try_recv().unwrap(), "m 123 1");
    assert!(rx.try_recv().is_err(), "the fragment never became a line");
    table
        .with_collector("c", |col| {
            assert_eq!(col.lines_received, 1);
            assert_eq!(col.lines_invalid, 0);
        })
        .expect("record exists");
}

#[tokio::test]
async fn crlf_line_endings_are_tolerated() {
    let (queue, mut rx) = mk_queue(10);
    let table = CollectorTable::new();
    table.insert(mk_collector());

    let (mut child_stdout, pipe) = tokio::io::duplex(256);
    let task = tokio::spawn(read_stdout(
        pipe,
        "c".to_string(),
        table.clone(),
        queue.clone(),
        None,
        600,
    ));

    child_stdout.write_all(b"m 123 1 a=b\r\n").await.unwrap();
    drop(child_stdout);
    task.await.unwrap();

    assert_eq!(rx.try_recv().unwrap(), "m 123 1 a=b");
}

use std::collections::hash_map::Entry;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::collector::{Collector, CollectorTable, DedupEntry, unix_now};
use crate::queue::OutboundQueue;
use crate::sample::Sample;

/// Validate one line of collector stdout and, unless deduplication
/// suppresses it, enqueue its serialization.
///
/// Counters on the record are updated unconditionally: every call bumps
/// `lines_received`, rejects bump `lines_invalid`, enqueued lines bump
/// `lines_sent`.
pub fn process_line(
    col: &mut Collector,
    queue: &OutboundQueue,
    prefix: Option<&str>,
    dedup_interval: u64,
    line: &str,
) {
    col.lines_received += 1;

    let trimmed = line.trim();
    let sample = match Sample::parse(trimmed) {
        Ok(sample) => sample,
        Err(err) => {
            col.lines_invalid += 1;
            tracing::debug!(collector = %col.name, %err, line = %trimmed, "rejecting line");
            return;
        }
    };

    col.last_datapoint = unix_now();

    // At most two lines go out per call: the flushed tail of a suppressed
    // run, then the current sample.
    let mut to_emit: Vec<String> = Vec::with_capacity(1);
    match col.dedup.entry(sample.series_key()) {
        Entry::Vacant(slot) => {
            slot.insert(DedupEntry {
                value: sample.value,
                emitted_ts: sample.timestamp,
                seen_ts: sample.timestamp,
                suppressed: 0,
            });
            to_emit.push(trimmed.to_string());
        }
        Entry::Occupied(mut slot) => {
            let entry = slot.get_mut();
            if entry.value == sample.value {
                if sample.timestamp.saturating_sub(entry.emitted_ts) < dedup_interval {
                    entry.suppressed += 1;
                    entry.seen_ts = sample.timestamp;
                } else {
                    // Heartbeat: an unchanged series still reports once
                    // per dedup window, carrying the current timestamp.
                    entry.emitted_ts = sample.timestamp;
                    entry.seen_ts = sample.timestamp;
                    entry.suppressed = 0;
                    to_emit.push(trimmed.to_string());
                }
            } else {
                // Value changed. If observations were suppressed, flush
                // the last one first; without it the series draws a ramp
                // from the old emission to the new value instead of a
                // step.
                if entry.suppressed > 0 && entry.seen_ts > entry.emitted_ts {
                    let tail = Sample {
                        metric: sample.metric.clone(),
                        timestamp: entry.seen_ts,
                        value: entry.value,
                        tags: sample.tags.clone(),
                    };
                    to_emit.push(tail.to_line());
                }
                entry.value = sample.value;
                entry.emitted_ts = sample.timestamp;
                entry.seen_ts = sample.timestamp;
                entry.suppressed = 0;
                to_emit.push(trimmed.to_string());
            }
        }
    }

    for text in to_emit {
        let out = match prefix {
            Some(p) => format!("{p}{text}"),
            None => text,
        };
        if queue.push(out) {
            col.lines_sent += 1;
        }
    }
}

/// Drain a child's stdout until EOF, handing complete lines to
/// `process_line`. A trailing fragment without a newline is discarded;
/// only terminated lines are valid.
pub async fn read_stdout<R>(
    stdout: R,
    name: String,
    table: CollectorTable,
    queue: OutboundQueue,
    prefix: Option<String>,
    dedup_interval: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    tracing::debug!(collector = %name, bytes = buf.len(), "discarding unterminated fragment at EOF");
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                let known = table
                    .with_collector(&name, |col| {
                        process_line(col, &queue, prefix.as_deref(), dedup_interval, line);
                    })
                    .is_some();
                if !known {
                    // Record removed while the child was still talking.
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(collector = %name, %err, "stdout read error");
                break;
            }
        }
    }
}

/// Log a child's stderr verbatim, one event per line.
pub async fn read_stderr<R>(stderr: R, name: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    tracing::warn!(collector = %name, "{line}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(collector = %name, %err, "stderr read error");
                break;
            }
        }
    }
}

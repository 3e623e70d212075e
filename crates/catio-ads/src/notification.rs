//! Notification stream codec and client-side reduction.
//!
//! Stream payload layout:
//!
//! ```text
//! length u32 | stamp_count u32
//!   per stamp:  timestamp u64 (FILETIME) | sample_count u32
//!   per sample: handle u32 | size u32 | data
//! ```
//!
//! `length` counts every byte after the length field itself.
//!
//! Samples received within one flush window are reduced to one value per
//! field by arithmetic mean and the result is diffed against the previous
//! snapshot, so consumers only see fields that changed.

use crate::codec::ByteReader;
use crate::command::Payload;
use crate::symbols::SymbolEntry;
use catio_common::ads_types::AdsDataType;
use catio_common::error::{AdsError, AdsResult};
use catio_common::time::FileTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// One sample of one notification handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSample {
    /// Notification handle.
    pub handle: u32,
    /// Raw sample bytes.
    pub data: Vec<u8>,
}

/// Samples sharing one timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationStamp {
    /// Sampling time.
    pub timestamp: FileTime,
    /// Samples taken at that time.
    pub samples: Vec<NotificationSample>,
}

/// Payload of a DeviceNotification frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotificationStream {
    /// Stamps in arrival order.
    pub stamps: Vec<NotificationStamp>,
}

impl NotificationStream {
    /// Total number of samples across all stamps.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.stamps.iter().map(|s| s.samples.len()).sum()
    }
}

impl Payload for NotificationStream {
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.stamps.len() as u32).to_le_bytes());
        for stamp in &self.stamps {
            body.extend_from_slice(&stamp.timestamp.ticks().to_le_bytes());
            body.extend_from_slice(&(stamp.samples.len() as u32).to_le_bytes());
            for sample in &stamp.samples {
                body.extend_from_slice(&sample.handle.to_le_bytes());
                body.extend_from_slice(&(sample.data.len() as u32).to_le_bytes());
                body.extend_from_slice(&sample.data);
            }
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        let length = r.u32()? as usize;
        if length != r.remaining() {
            return Err(AdsError::InvalidPayload(format!(
                "notification length {length} but {} bytes follow",
                r.remaining()
            )));
        }

        let stamp_count = r.u32()?;
        let mut stamps = Vec::new();
        for _ in 0..stamp_count {
            let timestamp = FileTime(r.u64()?);
            let sample_count = r.u32()?;
            let mut samples = Vec::new();
            for _ in 0..sample_count {
                let handle = r.u32()?;
                let data = r.sized()?.to_vec();
                samples.push(NotificationSample { handle, data });
            }
            stamps.push(NotificationStamp { timestamp, samples });
        }
        Ok(Self { stamps })
    }
}

/// Where a named field lives inside the samples of one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name reported to consumers.
    pub name: String,
    /// Notification handle carrying the field.
    pub handle: u32,
    /// Byte offset inside the sample.
    pub offset: usize,
    /// Element type.
    pub kind: AdsDataType,
    /// Number of elements; more than one makes an array field.
    pub count: usize,
}

impl FieldSpec {
    /// A scalar field.
    #[must_use]
    pub fn scalar(name: &str, handle: u32, offset: usize, kind: AdsDataType) -> Self {
        Self {
            name: name.to_string(),
            handle,
            offset,
            kind,
            count: 1,
        }
    }

    /// A field covering a whole symbol subscribed under `handle`.
    ///
    /// Returns `None` for structured types, which have no element layout.
    #[must_use]
    pub fn for_symbol(entry: &SymbolEntry, handle: u32) -> Option<Self> {
        let kind = entry.ads_type().filter(|k| k.size() > 0)?;
        Some(Self {
            name: entry.name.clone(),
            handle,
            offset: 0,
            kind,
            count: entry.element_count(),
        })
    }

    /// Bytes the field occupies.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.kind.size() * self.count
    }

    /// Decode the field from one sample.
    #[must_use]
    pub fn decode(&self, data: &[u8]) -> Option<FieldValue> {
        let raw = data.get(self.offset..self.offset + self.byte_len())?;
        let values = raw
            .chunks_exact(self.kind.size())
            .map(|chunk| self.kind.decode_f64(chunk))
            .collect::<Option<Vec<f64>>>()?;
        if self.count == 1 {
            values.first().copied().map(FieldValue::Scalar)
        } else {
            Some(FieldValue::Array(values))
        }
    }
}

/// Value of one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Single element.
    Scalar(f64),
    /// Element-wise array.
    Array(Vec<f64>),
}

/// Arithmetic mean of a burst, component-wise for arrays.
///
/// A burst of identical values reduces to that value unchanged. Samples
/// whose shape differs from the first are ignored.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(samples: &[FieldValue]) -> Option<FieldValue> {
    let first = samples.first()?;
    if samples.iter().all(|s| s == first) {
        return Some(first.clone());
    }

    match first {
        FieldValue::Scalar(_) => {
            let values: Vec<f64> = samples
                .iter()
                .filter_map(|s| match s {
                    FieldValue::Scalar(v) => Some(*v),
                    FieldValue::Array(_) => None,
                })
                .collect();
            Some(FieldValue::Scalar(
                values.iter().sum::<f64>() / values.len() as f64,
            ))
        }
        FieldValue::Array(head) => {
            let rows: Vec<&Vec<f64>> = samples
                .iter()
                .filter_map(|s| match s {
                    FieldValue::Array(v) if v.len() == head.len() => Some(v),
                    _ => None,
                })
                .collect();
            let n = rows.len() as f64;
            let means = (0..head.len())
                .map(|i| rows.iter().map(|row| row[i]).sum::<f64>() / n)
                .collect();
            Some(FieldValue::Array(means))
        }
    }
}

/// Latest reduced value per field.
pub type Snapshot = BTreeMap<String, FieldValue>;

/// Fields of `next` whose value differs from `previous`.
///
/// With no previous snapshot every field counts as changed.
#[must_use]
pub fn diff(previous: Option<&Snapshot>, next: &Snapshot) -> BTreeMap<String, FieldValue> {
    next.iter()
        .filter(|(name, value)| previous.and_then(|p| p.get(*name)) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Fields that changed in one flush window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Timestamp of the newest sample in the window.
    pub timestamp: FileTime,
    /// Changed fields and their new values.
    pub changes: BTreeMap<String, FieldValue>,
}

/// Accumulates samples and turns each flush window into a [`ChangeSet`].
#[derive(Debug)]
pub struct NotificationReducer {
    fields: Vec<FieldSpec>,
    pending: HashMap<usize, Vec<FieldValue>>,
    latest: Option<FileTime>,
    snapshot: Option<Snapshot>,
}

impl NotificationReducer {
    /// Create a reducer for the given field layout.
    #[must_use]
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            pending: HashMap::new(),
            latest: None,
            snapshot: None,
        }
    }

    /// Field layout.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Last emitted snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Decode and buffer every sample that belongs to a known field.
    ///
    /// Returns the number of field values buffered.
    pub fn accumulate(&mut self, stream: &NotificationStream) -> usize {
        let mut buffered = 0;
        for stamp in &stream.stamps {
            self.latest = Some(self.latest.map_or(stamp.timestamp, |t| t.max(stamp.timestamp)));
            for sample in &stamp.samples {
                for (index, field) in self.fields.iter().enumerate() {
                    if field.handle != sample.handle {
                        continue;
                    }
                    match field.decode(&sample.data) {
                        Some(value) => {
                            self.pending.entry(index).or_default().push(value);
                            buffered += 1;
                        }
                        None => warn!(
                            field = %field.name,
                            handle = sample.handle,
                            size = sample.data.len(),
                            "Sample too short for field"
                        ),
                    }
                }
            }
        }
        trace!(buffered, "Accumulated notification samples");
        buffered
    }

    /// Reduce the buffered window and diff it against the last snapshot.
    ///
    /// Returns `None` when nothing was buffered or nothing changed.
    pub fn flush(&mut self) -> Option<ChangeSet> {
        if self.pending.is_empty() {
            return None;
        }
        let timestamp = self.latest.take().unwrap_or_default();

        let mut next = self.snapshot.clone().unwrap_or_default();
        for (index, samples) in self.pending.drain() {
            if let Some(value) = mean(&samples) {
                next.insert(self.fields[index].name.clone(), value);
            }
        }

        let changes = diff(self.snapshot.as_ref(), &next);
        self.snapshot = Some(next);

        if changes.is_empty() {
            None
        } else {
            debug!(fields = changes.len(), "Notification changes");
            Some(ChangeSet { timestamp, changes })
        }
    }

    /// Forget the snapshot and buffered samples; the next flush reports
    /// every field again.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.latest = None;
        self.snapshot = None;
    }
}

/// Shortest flush window the monitor runs at.
pub const MIN_FLUSH_WINDOW: Duration = Duration::from_millis(1);

/// Background task that drains notification streams, flushes the reducer
/// every window and forwards non-empty change sets.
#[derive(Debug)]
pub struct NotificationMonitor;

impl NotificationMonitor {
    /// Spawn the monitor.
    ///
    /// The task ends when the stream source closes (after a final flush) or
    /// when the change set consumer is dropped. It yields the reducer back.
    pub fn spawn(
        mut streams: mpsc::Receiver<NotificationStream>,
        mut reducer: NotificationReducer,
        flush_window: Duration,
        changes: mpsc::Sender<ChangeSet>,
    ) -> JoinHandle<NotificationReducer> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_window.max(MIN_FLUSH_WINDOW));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    stream = streams.recv() => match stream {
                        Some(stream) => {
                            reducer.accumulate(&stream);
                        }
                        None => {
                            if let Some(set) = reducer.flush() {
                                let _ = changes.send(set).await;
                            }
                            debug!("Notification source closed");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Some(set) = reducer.flush() {
                            if changes.send(set).await.is_err() {
                                debug!("Change set consumer dropped");
                                break;
                            }
                        }
                    }
                }
            }
            reducer
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_stream(handle: u32, tick: u64, values: &[u32]) -> NotificationStream {
        NotificationStream {
            stamps: vec![NotificationStamp {
                timestamp: FileTime(tick),
                samples: values
                    .iter()
                    .map(|v| NotificationSample {
                        handle,
                        data: v.to_le_bytes().to_vec(),
                    })
                    .collect(),
            }],
        }
    }

    fn counter_reducer() -> NotificationReducer {
        NotificationReducer::new(vec![FieldSpec::scalar(
            "counter",
            5,
            0,
            AdsDataType::Udint,
        )])
    }

    #[test]
    fn test_stream_layout() {
        let stream = counter_stream(5, 1, &[10]);
        let bytes = stream.encode();
        // length, stamp count, timestamp, sample count, handle, size, data
        assert_eq!(bytes.len(), 4 + 4 + 8 + 4 + 4 + 4 + 4);
        assert_eq!(&bytes[0..4], &(bytes.len() as u32 - 4).to_le_bytes());
        assert_eq!(NotificationStream::decode(&bytes).unwrap(), stream);
    }

    #[test]
    fn test_stream_length_mismatch() {
        let mut bytes = counter_stream(5, 1, &[10]).encode();
        bytes.push(0);
        assert!(NotificationStream::decode(&bytes).is_err());
    }

    #[test]
    fn test_mean_idempotent() {
        let burst = vec![FieldValue::Scalar(0.1); 7];
        assert_eq!(mean(&burst), Some(FieldValue::Scalar(0.1)));

        let arrays = vec![FieldValue::Array(vec![1.0, 2.0]); 3];
        assert_eq!(mean(&arrays), Some(FieldValue::Array(vec![1.0, 2.0])));
    }

    #[test]
    fn test_mean_component_wise() {
        let burst = vec![
            FieldValue::Array(vec![1.0, 10.0]),
            FieldValue::Array(vec![3.0, 20.0]),
        ];
        assert_eq!(mean(&burst), Some(FieldValue::Array(vec![2.0, 15.0])));
        assert_eq!(
            mean(&[FieldValue::Scalar(1.0), FieldValue::Scalar(2.0)]),
            Some(FieldValue::Scalar(1.5))
        );
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_diff() {
        let mut a = Snapshot::new();
        a.insert("x".into(), FieldValue::Scalar(1.0));
        a.insert("y".into(), FieldValue::Array(vec![1.0, 2.0]));
        assert!(diff(Some(&a), &a.clone()).is_empty());

        let mut b = a.clone();
        b.insert("y".into(), FieldValue::Array(vec![1.0, 3.0]));
        let changes = diff(Some(&a), &b);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes["y"], FieldValue::Array(vec![1.0, 3.0]));

        assert_eq!(diff(None, &a).len(), 2);
    }

    #[test]
    fn test_counter_bursts() {
        let mut reducer = counter_reducer();

        reducer.accumulate(&counter_stream(5, 1, &[10, 10]));
        let first = reducer.flush().unwrap();
        assert_eq!(first.changes["counter"], FieldValue::Scalar(10.0));
        assert_eq!(first.timestamp, FileTime(1));

        reducer.accumulate(&counter_stream(5, 2, &[12, 12]));
        let second = reducer.flush().unwrap();
        assert_eq!(second.changes["counter"], FieldValue::Scalar(12.0));

        reducer.accumulate(&counter_stream(5, 3, &[12, 12]));
        assert!(reducer.flush().is_none());
    }

    #[test]
    fn test_unknown_handle_and_empty_window() {
        let mut reducer = counter_reducer();
        assert!(reducer.flush().is_none());
        assert_eq!(reducer.accumulate(&counter_stream(99, 1, &[1])), 0);
        assert!(reducer.flush().is_none());
    }

    #[test]
    fn test_reset_reports_full_again() {
        let mut reducer = counter_reducer();
        reducer.accumulate(&counter_stream(5, 1, &[4]));
        assert!(reducer.flush().is_some());
        reducer.reset();
        reducer.accumulate(&counter_stream(5, 2, &[4]));
        assert!(reducer.flush().is_some());
    }

    #[test]
    fn test_array_field_decode() {
        let spec = FieldSpec {
            name: "ai".into(),
            handle: 1,
            offset: 2,
            kind: AdsDataType::Int,
            count: 2,
        };
        let data = [0, 0, 0xFF, 0xFF, 0x05, 0x00];
        assert_eq!(spec.decode(&data), Some(FieldValue::Array(vec![-1.0, 5.0])));
        assert_eq!(spec.decode(&data[..5]), None);
    }

    #[tokio::test]
    async fn test_monitor_forwards_changes() {
        let (stream_tx, stream_rx) = mpsc::channel(8);
        let (change_tx, mut change_rx) = mpsc::channel(8);
        let task = NotificationMonitor::spawn(
            stream_rx,
            counter_reducer(),
            Duration::from_millis(20),
            change_tx,
        );

        stream_tx.send(counter_stream(5, 1, &[10, 10])).await.unwrap();
        let set = change_rx.recv().await.unwrap();
        assert_eq!(set.changes["counter"], FieldValue::Scalar(10.0));

        stream_tx.send(counter_stream(5, 2, &[12])).await.unwrap();
        drop(stream_tx);
        let set = change_rx.recv().await.unwrap();
        assert_eq!(set.changes["counter"], FieldValue::Scalar(12.0));

        let reducer = task.await.unwrap();
        assert_eq!(
            reducer.snapshot().unwrap()["counter"],
            FieldValue::Scalar(12.0)
        );
    }
}

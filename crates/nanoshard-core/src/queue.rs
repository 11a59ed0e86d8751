use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::NanoshardError;
use crate::types::{RawSample, Result};

/// One entry on the shared work queue.
///
/// `Done` is the terminal sentinel: each reader pushes exactly one on every
/// exit path, and encoders count observed sentinels to detect exhaustion.
#[derive(Debug)]
pub enum QueueItem {
    Sample(Box<RawSample>),
    Done,
}

/// Fixed-capacity FIFO shared by all readers and encoders.
///
/// `put` blocks while the queue is full and `get_timeout` blocks up to its
/// deadline while empty. This blocking is the pipeline's only flow control:
/// a full queue throttles readers, an empty one parks encoders.
#[derive(Debug, Clone)]
pub struct BoundedQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    capacity: usize,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Blocking enqueue of one sample.
    pub fn put(&self, sample: RawSample) -> Result<()> {
        self.tx
            .send(QueueItem::Sample(Box::new(sample)))
            .map_err(|_| {
                NanoshardError::PipelineError("work queue closed before producer finished".to_string())
            })
    }

    /// Pushes the terminal sentinel for one producer.
    pub fn put_done(&self) -> Result<()> {
        self.tx.send(QueueItem::Done).map_err(|_| {
            NanoshardError::PipelineError("work queue closed before sentinel delivery".to_string())
        })
    }

    /// Dequeues one item, waiting up to `timeout`. Returns `None` on timeout.
    pub fn get_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use super::*;
    use crate::types::PcmAudio;

    fn sample(text: &str) -> RawSample {
        RawSample {
            text: text.to_string(),
            audio: PcmAudio::new(vec![0.0; 16], 22050),
            speaker: None,
            extra_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            queue.put(sample(&format!("s{i}"))).expect("put succeeds");
        }
        for i in 0..5 {
            match queue.get_timeout(Duration::from_millis(100)) {
                Some(QueueItem::Sample(s)) => assert_eq!(s.text, format!("s{i}")),
                other => panic!("expected sample, got {other:?}"),
            }
        }
    }

    #[test]
    fn put_blocks_at_capacity_until_a_consumer_drains() {
        let queue = BoundedQueue::new(2);
        queue.put(sample("a")).expect("put succeeds");
        queue.put(sample("b")).expect("put succeeds");
        assert_eq!(queue.len(), 2);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.put(sample("c")).expect("put succeeds after drain");
            })
        };

        // The producer cannot finish until we pop one item.
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert!(queue.len() <= queue.capacity());

        let _ = queue.get_timeout(Duration::from_millis(100));
        producer.join().expect("producer joins");
        assert!(queue.len() <= queue.capacity());
    }

    #[test]
    fn sentinel_travels_in_order_behind_samples() {
        let queue = BoundedQueue::new(4);
        queue.put(sample("last")).expect("put succeeds");
        queue.put_done().expect("sentinel enqueues");

        assert!(matches!(
            queue.get_timeout(Duration::from_millis(100)),
            Some(QueueItem::Sample(_))
        ));
        assert!(matches!(
            queue.get_timeout(Duration::from_millis(100)),
            Some(QueueItem::Done)
        ));
        assert!(queue.get_timeout(Duration::from_millis(20)).is_none());
    }
}

use super::RawExample;
use crate::common::*;
use flume::TryRecvError;
use tfrecord::Example;

/// An example tagged with the sequence number assigned at dequeue.
#[derive(Debug, Clone)]
pub struct IndexedExample {
    pub index: usize,
    pub epoch: usize,
    pub example: Example,
}

/// The bounded buffer between the readers and the preprocessing workers.
///
/// In random shuffle mode, an item is dequeued at a random position and only
/// while more than `min_after_dequeue` items are buffered, unless the input
/// is closed. In FIFO mode, items leave in arrival order.
#[derive(Debug)]
pub struct ExampleBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    min_after_dequeue: usize,
    shuffle: bool,
}

impl<T> ExampleBuffer<T> {
    pub fn random_shuffle(capacity: usize, min_after_dequeue: usize) -> Self {
        assert!(
            capacity > min_after_dequeue,
            "capacity must be greater than min_after_dequeue"
        );
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            min_after_dequeue,
            shuffle: true,
        }
    }

    pub fn fifo(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            min_after_dequeue: 0,
            shuffle: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tells whether an item can leave the buffer.
    ///
    /// After the input is closed, the buffer drains regardless of
    /// `min_after_dequeue`.
    pub fn can_pop(&self, closed: bool) -> bool {
        let len = self.items.len();
        len > self.min_after_dequeue || (closed && len > 0)
    }

    /// Pushes an item. A full buffer gives the item back.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop<R>(&mut self, rng: &mut R) -> Option<T>
    where
        R: Rng + ?Sized,
    {
        if self.items.is_empty() {
            return None;
        }

        if self.shuffle {
            let index = rng.gen_range(0..self.items.len());
            self.items.swap_remove_back(index)
        } else {
            self.items.pop_front()
        }
    }
}

/// Runs the example queue until the input ends or the output is dropped.
pub fn example_queue(
    mut buffer: ExampleBuffer<RawExample>,
    mut rng: StdRng,
    rx: flume::Receiver<Result<RawExample>>,
    tx: flume::Sender<Result<IndexedExample>>,
) {
    let mut closed = false;
    let mut index = 0;

    loop {
        // take what is ready without blocking
        while !closed && !buffer.is_full() {
            match rx.try_recv() {
                Ok(Ok(item)) => {
                    if buffer.push(item).is_err() {
                        unreachable!("the buffer is checked to be not full");
                    }
                }
                Ok(Err(err)) => {
                    let _ = tx.send(Err(err));
                    return;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => closed = true,
            }
        }

        if buffer.can_pop(closed) {
            if let Some(RawExample { epoch, example }) = buffer.pop(&mut rng) {
                let item = IndexedExample {
                    index,
                    epoch,
                    example,
                };
                index += 1;
                if tx.send(Ok(item)).is_err() {
                    return;
                }
            }
            continue;
        }

        if closed {
            // closed and drained
            return;
        }

        // wait for more input
        match rx.recv() {
            Ok(Ok(item)) => {
                if buffer.push(item).is_err() {
                    unreachable!("a non-full buffer is required before waiting");
                }
            }
            Ok(Err(err)) => {
                let _ = tx.send(Err(err));
                return;
            }
            Err(_) => closed = true,
        }
    }
}

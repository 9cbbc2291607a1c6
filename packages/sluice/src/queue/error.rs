// queue error types.

use thiserror::Error;


/// Error for operating on a queue that has been shut down
///
/// Every operation attempted after [`shutdown`](crate::Queue::shutdown), and
/// every operation parked at the moment shutdown runs, fails with this error.
/// It is a cancellation-family signal, not a data error: a taker observing it
/// learns that the queue is gone, not that an element was malformed or
/// rejected. (Rejection by the dropping strategy is an `Ok(false)` result,
/// never an error.)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("queue shut down")]
pub struct ShutdownError;

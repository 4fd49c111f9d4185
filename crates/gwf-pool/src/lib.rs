// gwf-pool - Bounded worker pool with retry and saturation shedding
//
// The pool owns the only in-memory buffer between detection and delivery:
// a bounded FIFO channel drained by a fixed set of workers. Retry policy
// is computed once at startup; queue-saturation shedding wraps the pool's
// enqueue for the watcher side.

mod pool;
mod retry;
mod shed;

pub use pool::{PoolConfig, UploadPool};
pub use retry::RetryPolicy;
pub use shed::SheddingSink;

//! Pipe-stage contracts
//!
//! A query executes as a chain of pipe stages. Upstream workers push
//! blocks into a stage with `write_block`; `flush` is called once after
//! every writer has finished. Stages must accept concurrent `write_block`
//! calls for distinct worker ids.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::data::Block;
use crate::Result;

/// One stage in a chained query pipeline.
pub trait PipeProcessor: Send + Sync {
    /// Feed one block from upstream worker `worker_id`.
    fn write_block(&self, worker_id: usize, br: &Block);

    /// Finish the stage after all writers are done.
    fn flush(&self) -> Result<()>;
}

/// Cooperative cancellation flag shared across a pipeline.
///
/// Lock-free; fired once, never reset. Long-running loops poll it and
/// bail out without error.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Terminal pipe stage buffering every received block in memory.
///
/// Used as the sink of a pipeline when the caller wants the result rows
/// directly, and throughout the test suite.
#[derive(Debug, Default)]
pub struct CollectorPipe {
    blocks: Mutex<Vec<Block>>,
}

impl CollectorPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().clone()
    }

    /// Flatten all received blocks into one `column name -> value` map per
    /// row.
    pub fn rows(&self) -> Vec<std::collections::HashMap<String, String>> {
        let mut out = Vec::new();
        for br in self.blocks.lock().iter() {
            for row in 0..br.row_count() {
                let mut m = std::collections::HashMap::new();
                for c in br.columns() {
                    m.insert(c.name.clone(), c.value(row));
                }
                out.push(m);
            }
        }
        out
    }
}

impl PipeProcessor for CollectorPipe {
    fn write_block(&self, _worker_id: usize, br: &Block) {
        self.blocks.lock().push(br.clone());
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

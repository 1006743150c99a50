use crate::datum::Input;
use anyhow::Result;

/// Processes a single datum. The chain decides when a datum is safe to hand
/// out; what actually happens to it is entirely the worker's business.
pub trait Worker: Send + Sync {
    fn process(&self, inputs: &[Input]) -> Result<()>;
}

/// A worker that just pretends to do the work, slowly enough that the
/// scheduling is observable.
#[derive(Debug, Default)]
pub struct FakeWorker {}

impl Worker for FakeWorker {
    fn process(&self, inputs: &[Input]) -> Result<()> {
        log::debug!("processing datum: {:?}", inputs);

        std::thread::sleep(std::time::Duration::from_millis(10));

        Ok(())
    }
}

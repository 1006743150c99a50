//! A job-chain scheduler for data-processing pipelines.
//!
//! Jobs arrive in order, each consuming a set of datums. A job whose datums
//! overlap an earlier unfinished job's defers the shared work until that job
//! completes; everything else is handed out immediately. Success, failure,
//! and recovered datums propagate down the chain so every job sees a correct
//! base state, and the finished prefix of the chain is pruned as it goes.

mod addresser;
mod chain;
mod datum;
mod hash;
mod iterator;
mod worker;

pub use addresser::{Addresser, ShardAddress};
pub use chain::{JobChain, Problem};
pub use datum::{DatumIterator, DatumSet, Input, JobData, JobId, ListJob};
pub use hash::{Blake3Hasher, DatumHasher};
pub use iterator::JobIterator;
pub use worker::{FakeWorker, Worker};

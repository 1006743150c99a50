use crate::datum::{DatumSet, JobData, JobId};
use crate::hash::DatumHasher;
use crate::iterator::{recalculate, JobIterator, JobSlot};
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Sequences a stream of jobs so that a job which shares datums with an
/// earlier unfinished job defers the shared work until that job completes.
///
/// The chain is ordered by submission. `start` hands back a [`JobIterator`]
/// which yields the job's datums as they become safe to process; the caller
/// reports the outcome with `succeed` or `fail`, which unblocks any
/// descendants waiting on the job. Whenever a finished prefix of the chain
/// exists it is dropped, folding the last successful job's datums into the
/// committed base set.
#[derive(Clone)]
pub struct JobChain {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) hasher: Box<dyn DatumHasher>,
    pub(crate) state: Mutex<ChainState>,
}

pub(crate) struct ChainState {
    // None until `initialize` is called; the base set itself may be empty.
    pub(crate) base_datums: Option<DatumSet>,
    pub(crate) jobs: Vec<Arc<JobSlot>>,
}

impl JobChain {
    pub fn new(hasher: Box<dyn DatumHasher>) -> Self {
        JobChain {
            shared: Arc::new(Shared {
                hasher,
                state: Mutex::new(ChainState {
                    base_datums: None,
                    jobs: Vec::new(),
                }),
            }),
        }
    }

    pub fn initialized(&self) -> bool {
        self.shared.state.lock().unwrap().base_datums.is_some()
    }

    /// Set the committed datum set that precedes the first job. Must be
    /// called exactly once, before the first `start`.
    pub fn initialize(&self, base_datums: DatumSet) -> Result<()> {
        let mut chain = self.shared.state.lock().unwrap();

        if chain.base_datums.is_some() {
            bail!(Problem::AlreadyInitialized);
        }

        chain.base_datums = Some(base_datums);
        Ok(())
    }

    /// Append a job to the chain and return the iterator that will yield its
    /// datums in a safe order.
    pub fn start(&self, data: &dyn JobData) -> Result<JobIterator> {
        let mut dit = data
            .iterator()
            .with_context(|| format!("could not get a datum iterator for job {}", data.id()))?;

        // Enumerating the datums may be expensive, so it happens before the
        // chain lock is taken.
        let mut all_datums = DatumSet::new();
        dit.reset();
        for n in 0..dit.len() {
            all_datums.insert(self.shared.hasher.hash(dit.datum_n(n)));
        }

        let mut chain = self.shared.state.lock().unwrap();
        let Some(base_datums) = chain.base_datums.as_ref() else {
            bail!(Problem::NotInitialized);
        };

        let plan = recalculate(&all_datums, &DatumSet::new(), base_datums, &chain.jobs);
        log::debug!(
            "starting job {}: {} datums ({} deferred), waiting on {} jobs, additive: {}",
            data.id(),
            all_datums.len(),
            plan.unyielded.len(),
            plan.ancestors.len(),
            plan.additive_only,
        );

        let (slot, ancestors) = JobSlot::create(data.id(), all_datums, plan);
        chain.jobs.push(Arc::clone(&slot));

        Ok(JobIterator::new(
            Arc::clone(&self.shared),
            slot,
            ancestors,
            dit,
        ))
    }

    /// Mark a job as successfully finished. `recovered_datums` are the
    /// fingerprints the job declined to commit; they are subtracted from its
    /// datum set so descendants treat them as unprocessed.
    ///
    /// Fails if the job still has datums to yield: success may only be
    /// reported for a fully drained iterator.
    pub fn succeed(&self, data: &dyn JobData, recovered_datums: DatumSet) -> Result<()> {
        let mut chain = self.shared.state.lock().unwrap();
        if chain.base_datums.is_none() {
            bail!(Problem::NotInitialized);
        }

        let slot = Self::find(&chain, data.id())?;
        {
            let mut state = slot.state.lock().unwrap();

            if !state.yielding.is_empty() || !state.unyielded.is_empty() {
                bail!(Problem::DatumsRemaining {
                    job: data.id(),
                    yielding: state.yielding.len(),
                    unyielded: state.unyielded.len(),
                });
            }

            if let Some(all_datums) = state.all_datums.as_mut() {
                for hash in &recovered_datums {
                    all_datums.remove(hash);
                }
            }
            state.recovered_datums = recovered_datums;
            state.finished = true;
            state.success = true;
        }
        slot.done.send_replace(true);

        log::info!("job {} succeeded", data.id());
        Self::prune(&mut chain);
        Ok(())
    }

    /// Mark a job as failed. Its datum set is discarded so it contributes
    /// nothing to the base state seen by descendants.
    pub fn fail(&self, data: &dyn JobData) -> Result<()> {
        let mut chain = self.shared.state.lock().unwrap();
        if chain.base_datums.is_none() {
            bail!(Problem::NotInitialized);
        }

        let slot = Self::find(&chain, data.id())?;
        {
            let mut state = slot.state.lock().unwrap();
            state.all_datums = None;
            state.finished = true;
            state.success = false;
        }
        slot.done.send_replace(true);

        log::warn!("job {} failed", data.id());
        Self::prune(&mut chain);
        Ok(())
    }

    /// The committed datum set preceding the oldest live job, or None before
    /// `initialize`.
    pub fn base_datums(&self) -> Option<DatumSet> {
        self.shared.state.lock().unwrap().base_datums.clone()
    }

    fn find(chain: &ChainState, id: JobId) -> Result<Arc<JobSlot>> {
        chain
            .jobs
            .iter()
            .find(|slot| slot.id == id)
            .cloned()
            .ok_or_else(|| anyhow!(Problem::JobNotFound(id)))
    }

    // Drop the finished prefix of the chain, folding the datum set of the
    // last dropped successful job into base_datums. Failed jobs are skipped
    // over; if every dropped job failed, the base is left as it was.
    fn prune(chain: &mut ChainState) {
        let finished = chain
            .jobs
            .iter()
            .take_while(|slot| slot.state.lock().unwrap().finished)
            .count();
        if finished == 0 {
            return;
        }

        let base = chain.jobs[..finished]
            .iter()
            .rev()
            .find_map(|slot| slot.state.lock().unwrap().all_datums.clone());

        chain.jobs.drain(..finished);
        if base.is_some() {
            chain.base_datums = base;
        }

        log::debug!(
            "pruned {} finished jobs, {} still live",
            finished,
            chain.jobs.len(),
        );
    }
}

/// Everything that can go wrong inside the scheduler itself. Misuse and
/// invariant breaks are reported through this so callers can tell them apart
/// from errors passed through from the datum iterator.
#[derive(Debug, PartialEq, Eq)]
pub enum Problem {
    AlreadyInitialized,
    NotInitialized,
    JobNotFound(JobId),
    DatumsRemaining {
        job: JobId,
        yielding: usize,
        unyielded: usize,
    },
    Canceled,
    StrandedDatums {
        unyielded: usize,
    },
    ExtraAncestors {
        count: usize,
    },
    UnyieldedDatums {
        yielding: usize,
    },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::AlreadyInitialized => {
                write!(f, "the job chain was already initialized")
            }

            Problem::NotInitialized => {
                write!(f, "the job chain has not been initialized yet")
            }

            Problem::JobNotFound(id) => {
                write!(f, "job {} is not in the chain", id)
            }

            Problem::DatumsRemaining {
                job,
                yielding,
                unyielded,
            } => write!(
                f,
                "job {} still has {} datums to yield and {} waiting on other jobs, so it can't succeed yet",
                job, yielding, unyielded,
            ),

            Problem::Canceled => {
                write!(f, "iteration was canceled")
            }

            Problem::StrandedDatums { unyielded } => write!(
                f,
                "{} datums are still waiting but there are no jobs left to wait on",
                unyielded,
            ),

            Problem::ExtraAncestors { count } => write!(
                f,
                "an additive-only job was waiting on {} jobs besides its parent",
                count,
            ),

            Problem::UnyieldedDatums { yielding } => write!(
                f,
                "{} datums were not yielded during iteration",
                yielding,
            ),
        }
    }
}

impl std::error::Error for Problem {}

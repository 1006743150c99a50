use crate::chain::{Problem, Shared};
use crate::datum::{DatumIterator, DatumSet, Input, JobId};
use anyhow::{bail, Context, Result};
use futures::future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// The chain's record of one live job. The chain holds it until the job is
/// pruned; the job's own [`JobIterator`] holds it for as long as the caller
/// keeps the iterator around.
pub(crate) struct JobSlot {
    pub(crate) id: JobId,
    // One-shot broadcast, flipped to true exactly once when the job reaches a
    // terminal state. Descendants wait on subscriptions to this.
    pub(crate) done: watch::Sender<bool>,
    pub(crate) state: Mutex<JobState>,
}

pub(crate) struct JobState {
    // Every fingerprint the job would process. None after a failure, meaning
    // the job contributes nothing to the base state.
    pub(crate) all_datums: Option<DatumSet>,
    // Fingerprints currently safe to hand out.
    pub(crate) yielding: DatumSet,
    // Fingerprints blocked until an ancestor finishes.
    pub(crate) unyielded: DatumSet,
    // Fingerprints already handed out by `next`.
    pub(crate) yielded: DatumSet,
    // Fingerprints the job surfaced at success as not actually processed.
    pub(crate) recovered_datums: DatumSet,
    pub(crate) additive_only: bool,
    pub(crate) finished: bool,
    pub(crate) success: bool,
}

impl JobSlot {
    pub(crate) fn create(
        id: JobId,
        all_datums: DatumSet,
        plan: Plan,
    ) -> (Arc<JobSlot>, Vec<Arc<JobSlot>>) {
        let Plan {
            unyielded,
            yielding,
            ancestors,
            additive_only,
        } = plan;

        let slot = Arc::new(JobSlot {
            id,
            done: watch::channel(false).0,
            state: Mutex::new(JobState {
                all_datums: Some(all_datums),
                yielding,
                unyielded,
                yielded: DatumSet::new(),
                recovered_datums: DatumSet::new(),
                additive_only,
                finished: false,
                success: false,
            }),
        });

        (slot, ancestors)
    }
}

/// A job's datum plan: which fingerprints may be handed out now, which must
/// wait, and which earlier jobs they are waiting on.
pub(crate) struct Plan {
    pub(crate) unyielded: DatumSet,
    pub(crate) yielding: DatumSet,
    pub(crate) ancestors: Vec<Arc<JobSlot>>,
    pub(crate) additive_only: bool,
}

/// Compute a job's plan against a snapshot of the chain.
///
/// Every fingerprint not yet yielded is either blocked (some unfinished older
/// job also has it) or immediately eligible. Each older job that blocks at
/// least one fingerprint becomes an ancestor to wait on.
///
/// A job whose datums are a superset of its parent's (the job directly before
/// it, or the base set when it is first in line) is additive-only: the
/// parent's datums are inherited rather than reprocessed, and all remaining
/// work is deferred until the parent finishes, at which point the job picks
/// up its new datums plus whatever the parent recovered.
///
/// The caller must hold the chain lock so the snapshot is consistent.
pub(crate) fn recalculate(
    all_datums: &DatumSet,
    yielded: &DatumSet,
    base_datums: &DatumSet,
    older: &[Arc<JobSlot>],
) -> Plan {
    let mut unyielded = DatumSet::new();
    let mut ancestors: Vec<Arc<JobSlot>> = Vec::new();

    for ancestor in older {
        let state = ancestor.state.lock().unwrap();
        if state.finished {
            continue;
        }
        let Some(ancestor_datums) = state.all_datums.as_ref() else {
            continue;
        };

        let mut interesting = false;
        for hash in all_datums {
            if yielded.contains(hash) {
                continue;
            }
            if ancestor_datums.contains(hash) {
                unyielded.insert(hash.clone());
                interesting = true;
            }
        }
        if interesting {
            ancestors.push(Arc::clone(ancestor));
        }
    }

    let mut yielding: DatumSet = all_datums
        .iter()
        .filter(|hash| !yielded.contains(*hash) && !unyielded.contains(*hash))
        .cloned()
        .collect();

    let parent = older.last();
    let parent_datums = match parent {
        // A failed parent has no datums left, which makes any job additive
        // over it.
        Some(slot) => slot
            .state
            .lock()
            .unwrap()
            .all_datums
            .clone()
            .unwrap_or_default(),
        None => base_datums.clone(),
    };

    let additive_only = parent_datums.is_subset(all_datums);
    if additive_only {
        for hash in &parent_datums {
            yielding.remove(hash);
            unyielded.remove(hash);
        }
        match parent {
            Some(slot) => {
                // The whole delta waits for the parent, not just the part the
                // parent's datums overlap.
                unyielded.extend(yielding.drain());
                ancestors = vec![Arc::clone(slot)];
            }
            None => ancestors.clear(),
        }
    }

    Plan {
        unyielded,
        yielding,
        ancestors,
        additive_only,
    }
}

/// Yields one job's datums, in underlying iterator order, as they become safe
/// to process. Obtained from [`crate::JobChain::start`].
pub struct JobIterator {
    shared: Arc<Shared>,
    slot: Arc<JobSlot>,
    ancestors: Vec<Arc<JobSlot>>,
    dit: Box<dyn DatumIterator>,
}

impl std::fmt::Debug for JobIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobIterator").finish()
    }
}

impl JobIterator {
    pub(crate) fn new(
        shared: Arc<Shared>,
        slot: Arc<JobSlot>,
        ancestors: Vec<Arc<JobSlot>>,
        dit: Box<dyn DatumIterator>,
    ) -> Self {
        JobIterator {
            shared,
            slot,
            ancestors,
            dit,
        }
    }

    /// Advance to the next safe datum. Returns false once every datum this
    /// job is going to yield has been yielded.
    ///
    /// Blocks while all eligible datums are exhausted but ancestors are still
    /// running. Firing `cancel` interrupts the wait with [`Problem::Canceled`];
    /// that abandons this call but not the job, which still has to be
    /// reported to the chain as succeeded or failed.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<bool> {
        loop {
            loop {
                {
                    let state = self.slot.state.lock().unwrap();
                    if !state.yielding.is_empty() {
                        break;
                    }
                    if self.ancestors.is_empty() {
                        if state.unyielded.is_empty() {
                            return Ok(false);
                        }
                        bail!(Problem::StrandedDatums {
                            unyielded: state.unyielded.len(),
                        });
                    }
                }

                let fired = self.wait_for_ancestor(cancel).await?;
                let ancestor = self.ancestors.remove(fired);

                if self.slot.state.lock().unwrap().additive_only {
                    self.absorb_parent(&ancestor)?;
                } else {
                    self.settle_unyielded();
                }

                // Newly eligible datums may sit at positions the scan has
                // already passed, so the next scan starts over.
                self.dit.reset();
            }

            while self.dit.next() {
                let hash = self.shared.hasher.hash(self.dit.datum());
                let mut state = self.slot.state.lock().unwrap();
                if state.yielding.remove(&hash) {
                    state.yielded.insert(hash);
                    return Ok(true);
                }
            }

            // The scan ran dry while datums were still eligible: the hasher
            // and the underlying iterator disagree about this job's datums.
            let yielding = self.slot.state.lock().unwrap().yielding.len();
            if yielding > 0 {
                bail!(Problem::UnyieldedDatums { yielding });
            }
        }
    }

    /// How many datums `next` could currently yield without waiting.
    pub fn num_available(&self) -> usize {
        self.slot.state.lock().unwrap().yielding.len()
    }

    /// The datum most recently yielded by `next`.
    pub fn datum(&self) -> &[Input] {
        self.dit.datum()
    }

    /// Every fingerprint this job processes. Callers diff this against what
    /// they actually committed to report recovered datums.
    pub fn datum_set(&self) -> DatumSet {
        self.slot
            .state
            .lock()
            .unwrap()
            .all_datums
            .clone()
            .unwrap_or_default()
    }

    pub fn additive_only(&self) -> bool {
        self.slot.state.lock().unwrap().additive_only
    }

    // Wait until any current ancestor finishes, returning its position in
    // self.ancestors. Must not be called with no ancestors.
    async fn wait_for_ancestor(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let waits: Vec<_> = self
            .ancestors
            .iter()
            .map(|ancestor| {
                let mut done = ancestor.done.subscribe();
                Box::pin(async move {
                    let _ = done.wait_for(|finished| *finished).await;
                })
            })
            .collect();

        tokio::select! {
            _ = cancel.cancelled() => bail!(Problem::Canceled),
            (_, fired, _) = future::select_all(waits) => Ok(fired),
        }
    }

    // An additive-only job's sole remaining ancestor (its parent) finished.
    // On success, everything that was parked becomes eligible, along with any
    // datums of ours the parent recovered. On failure the upstream state is
    // different from the one this job was planned against, so plan again.
    fn absorb_parent(&mut self, parent: &Arc<JobSlot>) -> Result<()> {
        if !self.ancestors.is_empty() {
            bail!(Problem::ExtraAncestors {
                count: self.ancestors.len(),
            });
        }

        let (success, recovered) = {
            let state = parent.state.lock().unwrap();
            (state.success, state.recovered_datums.clone())
        };

        if success {
            let mut state = self.slot.state.lock().unwrap();
            let parked: Vec<String> = state.unyielded.drain().collect();
            state.yielding.extend(parked);
            for hash in recovered {
                let ours = state
                    .all_datums
                    .as_ref()
                    .map_or(false, |all| all.contains(&hash));
                if ours && !state.yielded.contains(&hash) {
                    state.yielding.insert(hash);
                }
            }
            Ok(())
        } else {
            self.replan()
        }
    }

    // Rebuild this job's plan from scratch against the current chain state,
    // considering only the jobs still ahead of it.
    fn replan(&mut self) -> Result<()> {
        let chain = self.shared.state.lock().unwrap();
        let Some(base_datums) = chain.base_datums.as_ref() else {
            bail!(Problem::NotInitialized);
        };

        let index = chain
            .jobs
            .iter()
            .position(|slot| Arc::ptr_eq(slot, &self.slot))
            .context("job is no longer part of the chain")?;

        let (all_datums, yielded) = {
            let state = self.slot.state.lock().unwrap();
            (
                state.all_datums.clone().unwrap_or_default(),
                state.yielded.clone(),
            )
        };

        let plan = recalculate(&all_datums, &yielded, base_datums, &chain.jobs[..index]);
        log::debug!(
            "job {} replanned after its parent failed: {} datums eligible, {} deferred, waiting on {} jobs",
            self.slot.id,
            plan.yielding.len(),
            plan.unyielded.len(),
            plan.ancestors.len(),
        );

        {
            let mut state = self.slot.state.lock().unwrap();
            state.unyielded = plan.unyielded;
            state.yielding = plan.yielding;
            state.additive_only = plan.additive_only;
        }
        self.ancestors = plan.ancestors;
        Ok(())
    }

    // An ancestor finished; anything no longer covered by a remaining
    // ancestor becomes eligible.
    fn settle_unyielded(&mut self) {
        // Hold the chain lock so no ancestor changes state mid-scan.
        let _chain = self.shared.state.lock().unwrap();

        let unyielded: Vec<String> = {
            let state = self.slot.state.lock().unwrap();
            state.unyielded.iter().cloned().collect()
        };

        let mut blocked = DatumSet::new();
        for ancestor in &self.ancestors {
            let state = ancestor.state.lock().unwrap();
            let Some(ancestor_datums) = state.all_datums.as_ref() else {
                continue;
            };
            for hash in &unyielded {
                if ancestor_datums.contains(hash) {
                    blocked.insert(hash.clone());
                }
            }
        }

        let mut state = self.slot.state.lock().unwrap();
        for hash in unyielded {
            if !blocked.contains(&hash) {
                state.unyielded.remove(&hash);
                state.yielding.insert(hash);
            }
        }
    }
}

#[cfg(test)]
mod test_recalculate {
    use super::{recalculate, JobSlot, Plan};
    use crate::datum::DatumSet;
    use std::sync::Arc;

    fn datum_set(hashes: &[&str]) -> DatumSet {
        hashes.iter().map(|hash| hash.to_string()).collect()
    }

    fn live_job(id: u64, all_datums: &[&str]) -> Arc<JobSlot> {
        let (slot, _) = JobSlot::create(
            id.into(),
            datum_set(all_datums),
            Plan {
                unyielded: DatumSet::new(),
                yielding: DatumSet::new(),
                ancestors: Vec::new(),
                additive_only: false,
            },
        );
        slot
    }

    fn finished_job(id: u64, all_datums: &[&str], success: bool) -> Arc<JobSlot> {
        let slot = live_job(id, all_datums);
        {
            let mut state = slot.state.lock().unwrap();
            state.finished = true;
            state.success = success;
            if !success {
                state.all_datums = None;
            }
        }
        slot
    }

    #[test]
    fn no_ancestors_everything_is_eligible() {
        let plan = recalculate(
            &datum_set(&["a", "b"]),
            &DatumSet::new(),
            &DatumSet::new(),
            &[],
        );

        assert_eq!(plan.yielding, datum_set(&["a", "b"]));
        assert!(plan.unyielded.is_empty());
        assert!(plan.ancestors.is_empty());
        // an empty base is a subset of anything
        assert!(plan.additive_only);
    }

    #[test]
    fn overlap_with_a_live_job_defers_the_shared_datums() {
        let older = [live_job(1, &["a", "b"])];

        let plan = recalculate(
            &datum_set(&["b", "c"]),
            &DatumSet::new(),
            &DatumSet::new(),
            &older,
        );

        assert_eq!(plan.yielding, datum_set(&["c"]));
        assert_eq!(plan.unyielded, datum_set(&["b"]));
        assert_eq!(plan.ancestors.len(), 1);
        assert!(!plan.additive_only);
    }

    #[test]
    fn finished_jobs_do_not_block() {
        let older = [
            finished_job(1, &["a"], true),
            finished_job(2, &["b"], false),
            live_job(3, &["z"]),
        ];

        let plan = recalculate(
            &datum_set(&["a", "b"]),
            &DatumSet::new(),
            &DatumSet::new(),
            &older,
        );

        assert_eq!(plan.yielding, datum_set(&["a", "b"]));
        assert!(plan.unyielded.is_empty());
        assert!(plan.ancestors.is_empty());
    }

    #[test]
    fn every_blocking_job_becomes_an_ancestor() {
        let older = [live_job(1, &["a"]), live_job(2, &["a", "b"])];

        let plan = recalculate(
            &datum_set(&["a", "c"]),
            &DatumSet::new(),
            &DatumSet::new(),
            &older,
        );

        assert_eq!(plan.unyielded, datum_set(&["a"]));
        assert_eq!(plan.ancestors.len(), 2);
    }

    #[test]
    fn additive_job_defers_everything_until_the_parent_finishes() {
        let older = [live_job(1, &["a", "b"])];

        let plan = recalculate(
            &datum_set(&["a", "b", "c"]),
            &DatumSet::new(),
            &DatumSet::new(),
            &older,
        );

        assert!(plan.additive_only);
        assert!(plan.yielding.is_empty());
        assert_eq!(plan.unyielded, datum_set(&["c"]));
        assert_eq!(plan.ancestors.len(), 1);
        assert!(Arc::ptr_eq(&plan.ancestors[0], &older[0]));
    }

    #[test]
    fn additive_over_the_base_trims_but_does_not_wait() {
        let plan = recalculate(
            &datum_set(&["a", "c"]),
            &DatumSet::new(),
            &datum_set(&["a"]),
            &[],
        );

        assert!(plan.additive_only);
        assert_eq!(plan.yielding, datum_set(&["c"]));
        assert!(plan.unyielded.is_empty());
        assert!(plan.ancestors.is_empty());
    }

    #[test]
    fn a_missing_parent_datum_makes_the_job_general() {
        let older = [live_job(1, &["a", "b"])];

        // b is in the parent but not here, so this is not additive
        let plan = recalculate(
            &datum_set(&["a", "c"]),
            &DatumSet::new(),
            &DatumSet::new(),
            &older,
        );

        assert!(!plan.additive_only);
        assert_eq!(plan.yielding, datum_set(&["c"]));
        assert_eq!(plan.unyielded, datum_set(&["a"]));
    }

    #[test]
    fn yielded_datums_are_not_replanned() {
        let older = [live_job(1, &["b", "x"])];

        let plan = recalculate(
            &datum_set(&["a", "b"]),
            &datum_set(&["a"]),
            &DatumSet::new(),
            &older,
        );

        assert!(!plan.additive_only);
        assert!(plan.yielding.is_empty());
        assert_eq!(plan.unyielded, datum_set(&["b"]));
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// A set of datum fingerprints. Membership is the only query the scheduler
/// ever makes, so a plain hash set of the fingerprint strings is enough.
pub type DatumSet = HashSet<String>;

/// One input to a datum: a named piece of content identified by the hash of
/// that content. A datum is a tuple of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Input {
    pub name: String,
    pub hash: String,
}

#[derive(Debug, Eq, Hash, PartialEq, Clone, Copy)]
pub struct JobId(u64);

impl From<u64> for JobId {
    fn from(unwrapped: u64) -> Self {
        JobId(unwrapped)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A finite, restartable cursor over a job's datums.
///
/// `reset` rewinds the cursor, `next` advances it (returning false once the
/// sequence is exhausted), and `datum` reads the tuple the cursor is on.
/// `datum` is only meaningful after `next` has returned true. `len` and
/// `datum_n` give positional access for the one-time enumeration the chain
/// does when a job starts; they do not move the cursor.
pub trait DatumIterator: Send {
    fn reset(&mut self);
    fn next(&mut self) -> bool;
    fn datum(&self) -> &[Input];
    fn len(&self) -> usize;
    fn datum_n(&self, n: usize) -> &[Input];
}

/// Handle to a job submitted to the chain. The chain only needs two things
/// from it: a stable identity, and the datums the job intends to process.
pub trait JobData {
    fn id(&self) -> JobId;
    fn iterator(&self) -> Result<Box<dyn DatumIterator>>;
}

/// A job whose datums are held in memory. This is what the CLI builds from a
/// pipeline description, and what the tests use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJob {
    pub name: String,
    pub datums: Vec<Vec<Input>>,
}

impl JobData for ListJob {
    fn id(&self) -> JobId {
        // Datum order is meaningful here (it is the iteration order), so
        // everything gets hashed in sequence.
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.datums.hash(&mut hasher);
        JobId::from(hasher.finish())
    }

    fn iterator(&self) -> Result<Box<dyn DatumIterator>> {
        Ok(Box::new(ListDatumIterator {
            datums: self.datums.clone(),
            consumed: 0,
        }))
    }
}

#[derive(Debug)]
struct ListDatumIterator {
    datums: Vec<Vec<Input>>,
    consumed: usize,
}

impl DatumIterator for ListDatumIterator {
    fn reset(&mut self) {
        self.consumed = 0;
    }

    fn next(&mut self) -> bool {
        if self.consumed < self.datums.len() {
            self.consumed += 1;
            true
        } else {
            false
        }
    }

    fn datum(&self) -> &[Input] {
        &self.datums[self.consumed - 1]
    }

    fn len(&self) -> usize {
        self.datums.len()
    }

    fn datum_n(&self, n: usize) -> &[Input] {
        &self.datums[n]
    }
}

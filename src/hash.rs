use crate::datum::Input;
use itertools::Itertools;

/// Maps a datum (a tuple of inputs) to a stable string fingerprint.
///
/// The fingerprint decides whether two jobs touch the same datum, so it must
/// be deterministic and stay stable for the lifetime of a chain. A hasher
/// that drifts between a job and its descendants makes the ordering
/// guarantees meaningless.
pub trait DatumHasher: Send + Sync {
    fn hash(&self, inputs: &[Input]) -> String;
}

/// The default fingerprint: a blake3 digest over the inputs, rendered as hex.
///
/// Input order within a datum carries no meaning, so inputs are sorted by
/// name before hashing to keep the fingerprint insensitive to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl DatumHasher for Blake3Hasher {
    fn hash(&self, inputs: &[Input]) -> String {
        let mut hasher = blake3::Hasher::new();

        for input in inputs.iter().sorted_by(|a, b| a.name.cmp(&b.name)) {
            hasher.update(input.name.as_bytes());
            hasher.update(&[0]);
            hasher.update(input.hash.as_bytes());
            hasher.update(&[0]);
        }

        hasher.finalize().to_hex().to_string()
    }
}

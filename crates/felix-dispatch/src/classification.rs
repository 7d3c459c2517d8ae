// Classification weights biasing which per-class cursor a key polls next.
use parking_lot::{RwLock, RwLockReadGuard};
use rand::Rng;

/// Cursor index used for unclassified traffic and as the walk fallback.
pub const UNCLASSIFIED: usize = 0;

/// Snapshot of the classification set. Index 0 is reserved for unclassified
/// traffic; classes occupy indices `1..=n` in configuration order.
#[derive(Debug, Default, Clone)]
pub struct ClassTable {
    names: Vec<String>,
    weights: Vec<u32>,
    // Bumped only when the set of class names changes.
    version: u64,
}

impl ClassTable {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_classified(&self) -> bool {
        !self.names.is_empty()
    }

    /// Number of cursors a key needs for this table.
    pub fn cursor_count(&self) -> usize {
        self.names.len() + 1
    }

    pub fn class_name(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|slot| self.names.get(slot))
            .map(String::as_str)
    }

    pub fn weight(&self, index: usize) -> u32 {
        index
            .checked_sub(1)
            .and_then(|slot| self.weights.get(slot))
            .copied()
            .unwrap_or(0)
    }

    /// Maps a message tag to its cursor index; unknown or missing tags map to 0.
    pub fn index_of(&self, class: Option<&str>) -> usize {
        class
            .and_then(|name| self.names.iter().position(|known| known == name))
            .map_or(UNCLASSIFIED, |slot| slot + 1)
    }

    /// Weighted random choice among the untried class indices. Falls back to
    /// [`UNCLASSIFIED`] when nothing with a positive weight remains.
    pub fn weighted_pick<R: Rng + ?Sized>(&self, untried: &[usize], rng: &mut R) -> usize {
        let total: u64 = untried
            .iter()
            .filter(|index| **index != UNCLASSIFIED)
            .map(|index| u64::from(self.weight(*index)))
            .sum();
        if total == 0 {
            return UNCLASSIFIED;
        }
        let mut roll = rng.gen_range(0..total);
        for index in untried.iter().copied().filter(|i| *i != UNCLASSIFIED) {
            let weight = u64::from(self.weight(index));
            if roll < weight {
                return index;
            }
            roll -= weight;
        }
        UNCLASSIFIED
    }
}

/// Shared, reconfigurable classification table.
///
/// ```
/// use felix_dispatch::Classifications;
///
/// let classes = Classifications::new();
/// assert!(classes.set_weights([("gold", 3), ("bronze", 1)]));
/// // Weight-only edits keep the structure version.
/// assert!(!classes.set_weights([("gold", 5), ("bronze", 1)]));
/// assert_eq!(classes.read().index_of(Some("bronze")), 2);
/// ```
#[derive(Debug, Default)]
pub struct Classifications {
    table: RwLock<ClassTable>,
}

impl Classifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the weight table. Returns true when the set of classes changed,
    /// which forces dependent keys to rebuild their cursor arrays on next use.
    pub fn set_weights<I, S>(&self, weights: I) -> bool
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut names: Vec<String> = Vec::new();
        let mut values: Vec<u32> = Vec::new();
        for (name, weight) in weights {
            let name = name.into();
            match names.iter().position(|known| *known == name) {
                Some(slot) => values[slot] = weight,
                None => {
                    names.push(name);
                    values.push(weight);
                }
            }
        }

        let mut table = self.table.write();
        let same_set = names.len() == table.names.len()
            && names.iter().all(|name| table.names.contains(name));
        if same_set {
            let reordered: Vec<u32> = table
                .names
                .iter()
                .map(|known| {
                    names
                        .iter()
                        .position(|name| name == known)
                        .map_or(0, |slot| values[slot])
                })
                .collect();
            table.weights = reordered;
            return false;
        }
        table.names = names;
        table.weights = values;
        table.version += 1;
        tracing::debug!(
            version = table.version,
            classes = table.names.len(),
            "classification set changed"
        );
        true
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ClassTable> {
        self.table.read()
    }

    pub fn version(&self) -> u64 {
        self.table.read().version
    }
}

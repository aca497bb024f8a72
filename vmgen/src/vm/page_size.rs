use log::*;
use rand::Rng;

use crate::arch::Granule;
use crate::choice::{ChoiceError, ChoiceTree, ChoicesModerator};
use crate::utils::DisplaySize;

/// A page size, together with the level at which it is mapped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageSize {
    /// The size in bytes.
    pub size: u64,

    /// The page-table level of the leaf entry.
    pub level: usize,

    /// The granule to which the size belongs.
    pub granule: &'static str,
}

/// A weighted chooser over the page sizes of a single granule.
///
/// Excluding a size only affects this instance.
/// Clone the chooser to explore a branch without disturbing the weights of the parent.
#[derive(Clone, Debug)]
pub struct PageSizeChoice {
    granule: Granule,
    tree: ChoiceTree,
}

impl PageSizeChoice {
    /// Creates a chooser from `tree`. Choices that are not a page size of `granule` are disabled.
    pub fn new(granule: Granule, mut tree: ChoiceTree) -> Self {
        let unsupported = tree
            .choices()
            .iter()
            .filter(|c| c.weight > 0 && !granule.supports(c.value))
            .map(|c| c.value)
            .collect::<Vec<_>>();
        for value in unsupported {
            trace!("Ignoring page size {} for the {} granule", DisplaySize(value), granule.name);
            tree.set_weight(value, 0);
        }

        PageSizeChoice {
            granule,
            tree,
        }
    }

    /// Creates a chooser from the page size tree of `granule` in `moderator`.
    pub fn from_moderator(moderator: &ChoicesModerator, granule: Granule) -> Result<Self, ChoiceError> {
        Ok(Self::new(granule, moderator.page_size_tree(granule.name)?))
    }

    /// The granule of the page sizes.
    pub fn granule(&self) -> &Granule {
        &self.granule
    }

    /// Returns true if there is at least one page size left to choose.
    pub fn has_choice(&self) -> bool {
        self.tree.has_choice()
    }

    fn page_size(&self, size: u64) -> Option<PageSize> {
        self.granule.level_of(size).map(|level| PageSize {
            size,
            level,
            granule: self.granule.name,
        })
    }

    /// Picks a page size at random, proportionally to the weights.
    pub fn choose(&self, rng: &mut impl Rng) -> Option<PageSize> {
        self.tree.choose(rng).and_then(|c| self.page_size(c.value))
    }

    /// Prevents `size` from being chosen again.
    pub fn exclude(&mut self, size: u64) {
        self.tree.set_weight(size, 0);
    }

    /// Prevents every size of at least `size` bytes from being chosen again.
    pub fn exclude_at_least(&mut self, size: u64) {
        let sizes = self
            .tree
            .choices()
            .iter()
            .filter(|c| c.value >= size)
            .map(|c| c.value)
            .collect::<Vec<_>>();
        for size in sizes {
            self.exclude(size);
        }
    }

    /// The page sizes that can still be chosen, smallest first.
    pub fn available(&self) -> Vec<PageSize> {
        let mut sizes = self
            .tree
            .choices()
            .iter()
            .filter(|c| c.weight > 0)
            .flat_map(|c| self.page_size(c.value))
            .collect::<Vec<_>>();
        sizes.sort_by_key(|s| s.size);
        sizes.dedup();
        sizes
    }

    /// Picks a page size of at most `max` bytes.
    /// If no such size is available, the smallest page size of the granule is returned.
    pub fn choose_at_most(&self, max: u64, rng: &mut impl Rng) -> PageSize {
        let mut limited = self.clone();
        limited.exclude_at_least(max.saturating_add(1));
        limited.choose(rng).unwrap_or_else(|| {
            let size = self.granule.smallest_page_size();
            PageSize {
                size,
                level: self.granule.leaf_levels[0],
                granule: self.granule.name,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;
    use test_log::test;

    use super::PageSizeChoice;
    use crate::arch::fake::{GRANULE_16K, GRANULE_4K};
    use crate::choice::ChoicesModerator;

    #[test]
    pub fn unsupported_sizes_are_ignored() {
        let moderator = ChoicesModerator::default();
        let choice = PageSizeChoice::from_moderator(&moderator, GRANULE_16K).unwrap();
        let sizes = choice.available().iter().map(|s| s.size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![0x4000, 0x200_0000]);

        let choice = PageSizeChoice::from_moderator(&moderator, GRANULE_4K).unwrap();
        let sizes = choice.available().iter().map(|s| s.size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![0x1000, 0x20_0000, 0x4000_0000]);
    }

    #[test]
    pub fn exclusion_exhausts_choices() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut choice = PageSizeChoice::from_moderator(&ChoicesModerator::default(), GRANULE_4K).unwrap();
        let snapshot = choice.clone();

        let mut seen = Vec::new();
        while choice.has_choice() {
            let size = choice.choose(&mut rng).unwrap();
            assert!(!seen.contains(&size.size));
            assert_eq!(GRANULE_4K.entry_spans[size.level], size.size);
            seen.push(size.size);
            choice.exclude(size.size);
        }

        assert_eq!(seen.len(), 3);
        assert!(choice.choose(&mut rng).is_none());
        assert_eq!(snapshot.available().len(), 3);
    }

    #[test]
    pub fn choose_at_most() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut choice = PageSizeChoice::from_moderator(&ChoicesModerator::default(), GRANULE_4K).unwrap();
        for _ in 0..50 {
            assert!(choice.choose_at_most(0x20_0000, &mut rng).size <= 0x20_0000);
        }

        assert_eq!(choice.choose_at_most(0x1000, &mut rng).size, 0x1000);

        choice.exclude_at_least(0x1000);
        assert!(!choice.has_choice());
        assert_eq!(choice.choose_at_most(0x20_0000, &mut rng).size, 0x1000);
    }
}

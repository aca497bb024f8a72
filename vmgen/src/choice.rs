//! Weighted random choices, loaded from configuration.
//!
//! A [`ChoiceTree`] is a named list of weighted values. Components that need to make a weighted decision (which page
//! size to try, which free-range strategy to use) clone the tree they need from the [`ChoicesModerator`] and set the
//! weight of choices that failed to zero, so that they are not retried during the same request.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The name of the tree that weighs the free-range resolution strategies.
pub const FREE_RANGE_STRATEGY_TREE: &str = "Free range strategy";

/// Returns the name of the page size tree for the granule `granule`.
pub fn page_size_tree_name(granule: &str) -> String {
    format!("Page size#{granule} granule")
}

/// Error returned by the [`ChoicesModerator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChoiceError {
    /// No tree with the requested name exists.
    #[error("No choice tree named {:?}", .0)]
    UnknownTree(String),
}

/// A single weighted value in a [`ChoiceTree`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    /// A human-readable name.
    pub name: String,

    /// The value that is returned when this choice is picked.
    pub value: u64,

    /// The relative weight. Zero means the choice is never picked.
    pub weight: u32,
}

impl Choice {
    /// Creates a new choice.
    pub fn new(name: impl Into<String>, value: u64, weight: u32) -> Self {
        Choice {
            name: name.into(),
            value,
            weight,
        }
    }
}

/// A named list of weighted choices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceTree {
    name: String,
    choices: Vec<Choice>,
}

impl ChoiceTree {
    /// Creates a new tree.
    pub fn new(name: impl Into<String>, choices: Vec<Choice>) -> Self {
        ChoiceTree {
            name: name.into(),
            choices,
        }
    }

    /// The name of the tree.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All choices in the tree, including those with weight zero.
    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    /// Returns true if at least one choice has a nonzero weight.
    pub fn has_choice(&self) -> bool {
        self.choices.iter().any(|c| c.weight > 0)
    }

    /// Picks a choice at random, proportionally to the weights.
    /// Returns `None` if every weight is zero.
    pub fn choose(&self, rng: &mut impl Rng) -> Option<&Choice> {
        let dist = WeightedIndex::new(self.choices.iter().map(|c| c.weight)).ok()?;
        Some(&self.choices[dist.sample(rng)])
    }

    /// Returns the weight of the choice with value `value`.
    pub fn weight(&self, value: u64) -> Option<u32> {
        self.choices.iter().find(|c| c.value == value).map(|c| c.weight)
    }

    /// Sets the weight of every choice with value `value`. Returns false if there is no such choice.
    pub fn set_weight(&mut self, value: u64, weight: u32) -> bool {
        let mut found = false;
        for choice in self.choices.iter_mut().filter(|c| c.value == value) {
            choice.weight = weight;
            found = true;
        }

        found
    }
}

/// Holds all choice trees of a generation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoicesModerator {
    trees: BTreeMap<String, ChoiceTree>,
}

impl ChoicesModerator {
    /// Creates a moderator without any trees.
    pub fn empty() -> Self {
        ChoicesModerator {
            trees: BTreeMap::new(),
        }
    }

    /// Adds `tree`, replacing any existing tree with the same name.
    pub fn insert(&mut self, tree: ChoiceTree) {
        self.trees.insert(tree.name.clone(), tree);
    }

    /// Iterates over all trees.
    pub fn trees(&self) -> impl Iterator<Item = &ChoiceTree> {
        self.trees.values()
    }

    /// Returns a copy of the tree named `name`, which the caller may modify freely.
    pub fn clone_choice_tree(&self, name: &str) -> Result<ChoiceTree, ChoiceError> {
        self.trees
            .get(name)
            .cloned()
            .ok_or_else(|| ChoiceError::UnknownTree(name.to_owned()))
    }

    /// Returns a copy of the page size tree for `granule`.
    pub fn page_size_tree(&self, granule: &str) -> Result<ChoiceTree, ChoiceError> {
        self.clone_choice_tree(&page_size_tree_name(granule))
    }
}

impl Default for ChoicesModerator {
    fn default() -> Self {
        let mut moderator = ChoicesModerator::empty();
        moderator.insert(ChoiceTree::new(
            page_size_tree_name("4K"),
            vec![
                Choice::new("4K", 0x1000, 30),
                Choice::new("2M", 0x20_0000, 10),
                Choice::new("1G", 0x4000_0000, 2),
                Choice::new("512G", 0x80_0000_0000, 1),
                Choice::new("256T", 0x1_0000_0000_0000, 1),
            ],
        ));
        moderator.insert(ChoiceTree::new(
            page_size_tree_name("16K"),
            vec![
                Choice::new("16K", 0x4000, 30),
                Choice::new("32M", 0x200_0000, 10),
                Choice::new("64G", 0x10_0000_0000, 2),
            ],
        ));
        moderator.insert(ChoiceTree::new(
            FREE_RANGE_STRATEGY_TREE,
            vec![
                Choice::new("LowRangeOnly", 0, 10),
                Choice::new("HighRangeOnly", 1, 10),
                Choice::new("CrossRange", 2, 10),
            ],
        ));

        moderator
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;
    use test_log::test;

    use super::{Choice, ChoiceError, ChoiceTree, ChoicesModerator, FREE_RANGE_STRATEGY_TREE};

    #[test]
    pub fn choose_respects_weights() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut tree = ChoiceTree::new("test", vec![Choice::new("a", 1, 1), Choice::new("b", 2, 0), Choice::new("c", 3, 5)]);

        for _ in 0..100 {
            assert_ne!(tree.choose(&mut rng).unwrap().value, 2);
        }

        assert!(tree.set_weight(3, 0));
        for _ in 0..100 {
            assert_eq!(tree.choose(&mut rng).unwrap().value, 1);
        }

        assert!(tree.set_weight(1, 0));
        assert!(!tree.has_choice());
        assert!(tree.choose(&mut rng).is_none());
        assert!(!tree.set_weight(42, 1));
    }

    #[test]
    pub fn cloned_trees_are_independent() {
        let moderator = ChoicesModerator::default();
        let mut tree = moderator.clone_choice_tree(FREE_RANGE_STRATEGY_TREE).unwrap();
        tree.set_weight(0, 0);

        assert_eq!(tree.weight(0), Some(0));
        assert_eq!(moderator.clone_choice_tree(FREE_RANGE_STRATEGY_TREE).unwrap().weight(0), Some(10));
    }

    #[test]
    pub fn unknown_tree() {
        let moderator = ChoicesModerator::default();
        assert_eq!(
            moderator.page_size_tree("3K"),
            Err(ChoiceError::UnknownTree(String::from("Page size#3K granule")))
        );
        assert!(moderator.page_size_tree("4K").is_ok());
    }
}

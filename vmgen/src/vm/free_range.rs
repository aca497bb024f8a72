//! Finds free virtual ranges in which a sequence of pages can be mapped.

use std::fmt::{self, Display};
use std::str::FromStr;

use arrayvec::ArrayVec;
use itertools::Itertools;
use log::*;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::page_size::{PageSize, PageSizeChoice};
use crate::arch::{Granule, RangeKind};
use crate::choice::{ChoicesModerator, FREE_RANGE_STRATEGY_TREE};
use crate::error::FatalError;
use crate::interval::{Interval, IntervalSet};
use crate::utils::{parse_size, DisplaySize};

/// The size of a page in a free-range request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageSizeRequest {
    /// Exactly this size, if the granule of the range supports it.
    /// Otherwise, a smaller supported size is substituted.
    Exact(u64),

    /// Any page size.
    Any,
}

/// Error returned when a [`PageSizeRequest`] cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid page size: {:?}", .0)]
pub struct InvalidPageSize(String);

impl FromStr for PageSizeRequest {
    type Err = InvalidPageSize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" | "*" => Ok(PageSizeRequest::Any),
            s => match parse_size(s) {
                Some(size) if size.is_power_of_two() => Ok(PageSizeRequest::Exact(size)),
                _ => Err(InvalidPageSize(s.to_owned())),
            },
        }
    }
}

impl Display for PageSizeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageSizeRequest::Exact(size) => write!(f, "{}", DisplaySize(*size)),
            PageSizeRequest::Any => write!(f, "any"),
        }
    }
}

/// One page of a resolved free range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
    /// The canonical range that contains the page.
    pub kind: RangeKind,

    /// The virtual addresses of the page.
    pub range: Interval,

    /// The page-table level at which the page would be mapped.
    pub level: usize,

    /// The granule of the page.
    pub granule: String,
}

impl ResolvedRange {
    /// The size of the page.
    pub fn page_size(&self) -> u64 {
        self.range.size()
    }
}

/// The result of a successful claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResult {
    /// The virtual address of the first page.
    pub start: u64,

    /// The strategy that produced the result.
    pub strategy: Strategy,

    /// The pages, in the order in which they were requested.
    pub ranges: Vec<ResolvedRange>,
}

impl ClaimResult {
    /// The resolved page sizes, in the order in which they were requested.
    pub fn page_sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().map(|r| r.page_size())
    }
}

/// The free virtual memory of one canonical range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeSpace {
    /// The canonical range.
    pub kind: RangeKind,

    /// The granule of the page tables of the range.
    pub granule: Granule,

    /// The addresses that are not mapped yet and may be mapped.
    pub usable: IntervalSet,
}

/// Resolves free ranges inside a single canonical range.
#[derive(Clone, Debug)]
pub struct FreeRangeResolver<'a> {
    space: &'a FreeSpace,
    choice: PageSizeChoice,
}

impl<'a> FreeRangeResolver<'a> {
    /// Creates a resolver that substitutes unsupported page sizes with sizes picked by `choice`.
    pub fn new(space: &'a FreeSpace, choice: PageSizeChoice) -> Self {
        FreeRangeResolver {
            space,
            choice,
        }
    }

    /// Maps a requested page size to a page size that the granule of the range supports.
    fn resolve_size(&self, request: PageSizeRequest, rng: &mut impl Rng) -> PageSize {
        let granule = &self.space.granule;
        match request {
            PageSizeRequest::Exact(size) => match granule.level_of(size) {
                Some(level) => PageSize {
                    size,
                    level,
                    granule: granule.name,
                },
                None => {
                    let substitute = self.choice.choose_at_most(size, rng);
                    trace!(
                        "The {} granule does not support {} pages, using {} pages instead",
                        granule.name,
                        DisplaySize(size),
                        DisplaySize(substitute.size)
                    );
                    substitute
                },
            },
            PageSizeRequest::Any => self
                .choice
                .choose(rng)
                .unwrap_or_else(|| self.choice.choose_at_most(0, rng)),
        }
    }

    /// Lays out `requested` from a single random start address in `region`.
    /// Pages are placed until the next page does not fit or `max` pages have been placed.
    ///
    /// Returns `None` if not even the first page fits.
    pub fn resolve_prefix(
        &self, region: &IntervalSet, requested: &[PageSizeRequest], max: usize, rng: &mut impl Rng,
    ) -> Option<Vec<ResolvedRange>> {
        let (first, rest) = requested.split_first()?;
        if max == 0 {
            return None;
        }

        let mut usable = self.space.usable.clone();
        usable.apply_intersection(region);

        let first = self.resolve_size(*first, rng);
        let mut aligned = usable.clone();
        aligned.align_with_size(first.size);
        let start = aligned.choose_aligned_start(first.size, first.size, rng)?;

        let mut pages = vec![self.resolved(start, first)];
        let mut next = start.checked_add(first.size);
        for &request in rest.iter().take(max - 1) {
            let Some(address) = next else {
                break;
            };

            let size = self.resolve_size(request, rng);
            let fits = address % size.size == 0
                && address
                    .checked_add(size.size - 1)
                    .is_some_and(|end| usable.contains_range(address, end));
            if !fits {
                trace!("A {} page does not fit at 0x{address:x}", DisplaySize(size.size));
                break;
            }

            pages.push(self.resolved(address, size));
            next = address.checked_add(size.size);
        }

        Some(pages)
    }

    /// Lays out all of `requested` contiguously, starting at a single random address in `region`.
    /// There is no backtracking: if the pages do not fit after the chosen start address, resolution fails.
    pub fn resolve(
        &self, region: &IntervalSet, requested: &[PageSizeRequest], rng: &mut impl Rng,
    ) -> Option<Vec<ResolvedRange>> {
        self.resolve_prefix(region, requested, requested.len(), rng)
            .filter(|pages| pages.len() == requested.len())
    }

    fn resolved(&self, start: u64, size: PageSize) -> ResolvedRange {
        ResolvedRange {
            kind: self.space.kind,
            range: Interval::from_start_size(start, size.size),
            level: size.level,
            granule: size.granule.to_owned(),
        }
    }
}

/// Resolves free ranges that start in the low canonical range and continue in the high canonical range.
#[derive(Clone, Debug)]
pub struct CrossRangeResolver<'a> {
    low: FreeRangeResolver<'a>,
    high: FreeRangeResolver<'a>,
}

impl<'a> CrossRangeResolver<'a> {
    /// Creates a resolver from independent resolvers for both halves.
    pub fn new(low: FreeRangeResolver<'a>, high: FreeRangeResolver<'a>) -> Self {
        CrossRangeResolver {
            low,
            high,
        }
    }

    /// Places as many pages as possible (but at least one, and not all) in the low range, and the rest in the high range.
    pub fn resolve(
        &self, region: &IntervalSet, requested: &[PageSizeRequest], rng: &mut impl Rng,
    ) -> Option<Vec<ResolvedRange>> {
        if requested.len() < 2 {
            return None;
        }

        let mut pages = self.low.resolve_prefix(region, requested, requested.len() - 1, rng)?;
        trace!("Placed {} of {} pages in the low range", pages.len(), requested.len());

        pages.extend(self.high.resolve(region, &requested[pages.len()..], rng)?);
        Some(pages)
    }
}

/// A way to satisfy a free-range request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// All pages are placed in the low canonical range.
    LowRangeOnly,

    /// All pages are placed in the high canonical range.
    HighRangeOnly,

    /// The pages are split over the low and high canonical ranges.
    CrossRange,
}

impl Strategy {
    /// Converts the value of a choice in the free-range strategy tree.
    pub fn from_choice_value(value: u64) -> Option<Strategy> {
        match value {
            0 => Some(Strategy::LowRangeOnly),
            1 => Some(Strategy::HighRangeOnly),
            2 => Some(Strategy::CrossRange),
            _ => None,
        }
    }

    fn is_available(&self, has_low: bool, has_high: bool) -> bool {
        match self {
            Strategy::LowRangeOnly => has_low,
            Strategy::HighRangeOnly => has_high,
            Strategy::CrossRange => has_low && has_high,
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Claims free ranges by trying the available strategies in a weighted random order.
///
/// Every strategy is tried at most once per claim, so a claim always terminates.
/// Claiming does not reserve anything: the caller is expected to commit the pages it uses.
#[derive(Clone, Debug)]
pub struct FreeRangeClaimer {
    low: Option<(FreeSpace, PageSizeChoice)>,
    high: Option<(FreeSpace, PageSizeChoice)>,
    strategies: ArrayVec<(Strategy, u32), 3>,
}

impl FreeRangeClaimer {
    /// Creates a claimer for `spaces`. Strategy weights and page size trees are taken from `moderator`.
    pub fn new(spaces: impl IntoIterator<Item = FreeSpace>, moderator: &ChoicesModerator) -> Result<Self, FatalError> {
        let mut low = None;
        let mut high = None;
        for space in spaces {
            let choice = PageSizeChoice::from_moderator(moderator, space.granule)?;
            match space.kind {
                RangeKind::Low => low = Some((space, choice)),
                RangeKind::High => high = Some((space, choice)),
            }
        }

        let mut strategies = ArrayVec::<(Strategy, u32), 3>::new();
        for choice in moderator.clone_choice_tree(FREE_RANGE_STRATEGY_TREE)?.choices() {
            let strategy = Strategy::from_choice_value(choice.value).ok_or_else(|| {
                FatalError::Config(format!("unknown free range strategy {} ({})", choice.value, choice.name))
            })?;

            if strategy.is_available(low.is_some(), high.is_some()) && !strategies.iter().any(|(s, _)| *s == strategy) {
                strategies.push((strategy, choice.weight));
            }
        }

        debug!("Free range strategies: {strategies:?}");
        Ok(FreeRangeClaimer {
            low,
            high,
            strategies,
        })
    }

    /// The strategies that may be tried, with their weights.
    pub fn strategies(&self) -> &[(Strategy, u32)] {
        &self.strategies
    }

    fn resolver(side: &Option<(FreeSpace, PageSizeChoice)>) -> Option<FreeRangeResolver<'_>> {
        side.as_ref()
            .map(|(space, choice)| FreeRangeResolver::new(space, choice.clone()))
    }

    fn attempt(
        &self, strategy: Strategy, region: &IntervalSet, requested: &[PageSizeRequest], rng: &mut impl Rng,
    ) -> Option<Vec<ResolvedRange>> {
        match strategy {
            Strategy::LowRangeOnly => Self::resolver(&self.low)?.resolve(region, requested, rng),
            Strategy::HighRangeOnly => Self::resolver(&self.high)?.resolve(region, requested, rng),
            Strategy::CrossRange => {
                CrossRangeResolver::new(Self::resolver(&self.low)?, Self::resolver(&self.high)?).resolve(region, requested, rng)
            },
        }
    }

    /// Finds free virtual memory in `region` for the pages in `requested`.
    /// Returns `None` when no strategy succeeds.
    pub fn claim(&self, region: &IntervalSet, requested: &[PageSizeRequest], rng: &mut impl Rng) -> Option<ClaimResult> {
        let mut weights = self.strategies.iter().map(|&(_, weight)| weight).collect::<ArrayVec<_, 3>>();

        if !requested.is_empty() {
            while let Ok(dist) = WeightedIndex::new(weights.iter().copied()) {
                let index = dist.sample(rng);
                let strategy = self.strategies[index].0;
                weights[index] = 0;

                if let Some(ranges) = self.attempt(strategy, region, requested, rng) {
                    let start = ranges[0].range.lo();
                    info!(
                        "Claimed {} at 0x{start:x} with strategy {strategy}: {}",
                        ranges.iter().map(|r| DisplaySize(r.page_size())).join(", "),
                        ranges.iter().map(|r| format!("{} ({})", r.range, r.kind)).join(", ")
                    );

                    return Some(ClaimResult {
                        start,
                        strategy,
                        ranges,
                    });
                }

                debug!("Strategy {strategy} failed");
            }
        }

        info!(
            "Unable to claim free ranges for pages [{}] in {region}",
            requested.iter().join(", ")
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;
    use test_log::test;

    use super::{
        CrossRangeResolver, FreeRangeClaimer, FreeRangeResolver, FreeSpace, PageSizeRequest, Strategy,
    };
    use crate::arch::fake::{GRANULE_16K, GRANULE_4K};
    use crate::arch::RangeKind;
    use crate::choice::{Choice, ChoiceTree, ChoicesModerator, FREE_RANGE_STRATEGY_TREE};
    use crate::error::FatalError;
    use crate::interval::{Interval, IntervalSet};
    use crate::vm::page_size::PageSizeChoice;

    const HIGH_START: u64 = 0xffff_8000_0000_0000;

    fn low_space(usable: IntervalSet) -> FreeSpace {
        FreeSpace {
            kind: RangeKind::Low,
            granule: GRANULE_4K,
            usable,
        }
    }

    fn high_space(usable: IntervalSet) -> FreeSpace {
        FreeSpace {
            kind: RangeKind::High,
            granule: GRANULE_16K,
            usable,
        }
    }

    fn choice_4k() -> PageSizeChoice {
        PageSizeChoice::from_moderator(&ChoicesModerator::default(), GRANULE_4K).unwrap()
    }

    fn choice_16k() -> PageSizeChoice {
        PageSizeChoice::from_moderator(&ChoicesModerator::default(), GRANULE_16K).unwrap()
    }

    #[test]
    pub fn parse_page_size_requests() {
        assert_eq!("4K".parse(), Ok(PageSizeRequest::Exact(0x1000)));
        assert_eq!("0x200000".parse(), Ok(PageSizeRequest::Exact(0x20_0000)));
        assert_eq!("any".parse(), Ok(PageSizeRequest::Any));
        assert!("3K".parse::<PageSizeRequest>().is_err());
        assert!("huge".parse::<PageSizeRequest>().is_err());
        assert_eq!(PageSizeRequest::Exact(0x20_0000).to_string(), "2M");
    }

    #[test]
    pub fn resolved_pages_are_aligned_and_contiguous() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let space = low_space(IntervalSet::from_range(0x1_0000, 0x8000_1fff));
        let resolver = FreeRangeResolver::new(&space, choice_4k());
        let requested = [
            PageSizeRequest::Exact(0x20_0000),
            PageSizeRequest::Exact(0x1000),
            PageSizeRequest::Exact(0x1000),
        ];

        for _ in 0..100 {
            let pages = resolver.resolve(&IntervalSet::full(), &requested, &mut rng).unwrap();
            assert_eq!(pages.len(), 3);
            assert_eq!(pages[0].range.lo() % 0x20_0000, 0);
            assert_eq!(pages[0].level, 1);
            for (a, b) in pages.iter().zip(pages.iter().skip(1)) {
                assert_eq!(a.range.hi() + 1, b.range.lo());
                assert_eq!(b.range.lo() % b.page_size(), 0);
            }

            assert!(pages.iter().all(|p| space.usable.contains_interval(&p.range)));
        }
    }

    #[test]
    pub fn resolution_respects_region() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let space = low_space(IntervalSet::from_range(0x1_0000, 0x7fff_ffff));
        let resolver = FreeRangeResolver::new(&space, choice_4k());
        let region = IntervalSet::from_range(0x4000_0000, 0x4000_3fff);

        for _ in 0..20 {
            let pages = resolver
                .resolve(&region, &[PageSizeRequest::Exact(0x1000), PageSizeRequest::Exact(0x1000)], &mut rng)
                .unwrap();
            assert!(pages.iter().all(|p| region.contains_interval(&p.range)));
        }

        assert!(resolver.resolve(&region, &[PageSizeRequest::Exact(0x20_0000)], &mut rng).is_none());
    }

    #[test]
    pub fn no_backtracking() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        // Room for two 4K pages at 0x10000, or a single 4K page at 0x20000.
        let mut usable = IntervalSet::from_range(0x1_0000, 0x1_1fff);
        usable.add_range(0x2_0000, 0x2_0fff);
        let space = low_space(usable);
        let resolver = FreeRangeResolver::new(&space, choice_4k());
        let requested = [PageSizeRequest::Exact(0x1000), PageSizeRequest::Exact(0x1000)];

        let mut successes = 0;
        for _ in 0..100 {
            if let Some(pages) = resolver.resolve(&IntervalSet::full(), &requested, &mut rng) {
                assert_eq!(pages[0].range.lo(), 0x1_0000);
                successes += 1;
            }
        }

        assert!(successes > 0 && successes < 100);
    }

    #[test]
    pub fn unsupported_sizes_are_substituted() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let space = high_space(IntervalSet::from_range(HIGH_START, u64::MAX));
        let resolver = FreeRangeResolver::new(&space, choice_16k());

        for _ in 0..50 {
            let pages = resolver
                .resolve(&IntervalSet::full(), &[PageSizeRequest::Exact(0x20_0000)], &mut rng)
                .unwrap();
            assert_eq!(pages[0].page_size(), 0x4000);
            assert_eq!(pages[0].granule, "16K");

            let pages = resolver
                .resolve(&IntervalSet::full(), &[PageSizeRequest::Exact(0x1000)], &mut rng)
                .unwrap();
            assert_eq!(pages[0].page_size(), 0x4000);

            let pages = resolver.resolve(&IntervalSet::full(), &[PageSizeRequest::Any], &mut rng).unwrap();
            assert!([0x4000, 0x200_0000].contains(&pages[0].page_size()));
        }
    }

    #[test]
    pub fn cross_range_splits_the_request() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);
        // The low range has room for exactly two 4K pages.
        let low = low_space(IntervalSet::from_range(0x7fff_e000, 0x7fff_ffff));
        let high = high_space(IntervalSet::from_range(HIGH_START, u64::MAX));
        let resolver = CrossRangeResolver::new(
            FreeRangeResolver::new(&low, choice_4k()),
            FreeRangeResolver::new(&high, choice_16k()),
        );

        let requested = [PageSizeRequest::Exact(0x1000); 4];
        for _ in 0..20 {
            let pages = resolver.resolve(&IntervalSet::full(), &requested, &mut rng).unwrap();
            assert_eq!(pages.len(), 4);
            let low_pages = pages.iter().filter(|p| p.kind == RangeKind::Low).count();
            assert!((1..=2).contains(&low_pages));
            assert!(pages[..low_pages].iter().all(|p| p.page_size() == 0x1000));
            assert!(pages[low_pages..].iter().all(|p| p.kind == RangeKind::High && p.page_size() == 0x4000));
        }

        assert!(resolver.resolve(&IntervalSet::full(), &requested[..1], &mut rng).is_none());
    }

    #[test]
    pub fn claim_outside_usable_fails() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let claimer = FreeRangeClaimer::new(
            [
                low_space(IntervalSet::from_range(0x1_0000, 0x7fff_ffff)),
                high_space(IntervalSet::from_range(HIGH_START, u64::MAX)),
            ],
            &ChoicesModerator::default(),
        )
        .unwrap();
        assert_eq!(claimer.strategies().len(), 3);

        let region = IntervalSet::from_range(0x1_0000_0000, 0x1_ffff_ffff);
        assert_eq!(claimer.claim(&region, &[PageSizeRequest::Exact(0x1000)], &mut rng), None);
        assert_eq!(claimer.claim(&IntervalSet::full(), &[], &mut rng), None);
    }

    #[test]
    pub fn claim_uses_every_strategy() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(6);
        let claimer = FreeRangeClaimer::new(
            [
                low_space(IntervalSet::from_range(0x1_0000, 0x7fff_ffff)),
                high_space(IntervalSet::from_range(HIGH_START, u64::MAX)),
            ],
            &ChoicesModerator::default(),
        )
        .unwrap();

        let requested = [PageSizeRequest::Exact(0x1000), PageSizeRequest::Exact(0x1000)];
        let mut seen = Vec::new();
        for _ in 0..200 {
            let result = claimer.claim(&IntervalSet::full(), &requested, &mut rng).unwrap();
            assert_eq!(result.start, result.ranges[0].range.lo());
            assert_eq!(result.ranges.len(), 2);
            if !seen.contains(&result.strategy) {
                seen.push(result.strategy);
            }
        }

        assert_eq!(seen.len(), 3);
    }

    #[test]
    pub fn single_range_keeps_only_low_strategy() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let claimer = FreeRangeClaimer::new(
            [low_space(IntervalSet::from_range(0x1_0000, 0x7fff_ffff))],
            &ChoicesModerator::default(),
        )
        .unwrap();
        assert_eq!(claimer.strategies(), &[(Strategy::LowRangeOnly, 10)]);

        let result = claimer
            .claim(&IntervalSet::full(), &[PageSizeRequest::Any], &mut rng)
            .unwrap();
        assert_eq!(result.strategy, Strategy::LowRangeOnly);
    }

    #[test]
    pub fn failing_strategies_fall_through() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        // The low range is full, so only HighRangeOnly can succeed.
        let claimer = FreeRangeClaimer::new(
            [
                low_space(IntervalSet::new()),
                high_space(IntervalSet::from_range(HIGH_START, u64::MAX)),
            ],
            &ChoicesModerator::default(),
        )
        .unwrap();

        for _ in 0..50 {
            let result = claimer
                .claim(&IntervalSet::full(), &[PageSizeRequest::Exact(0x4000)], &mut rng)
                .unwrap();
            assert_eq!(result.strategy, Strategy::HighRangeOnly);
            assert!(result.ranges[0].range.lo() >= HIGH_START);
            assert_eq!(result.ranges[0].range, Interval::from_start_size(result.start, 0x4000));
        }
    }

    #[test]
    pub fn unknown_strategy_is_fatal() {
        let mut moderator = ChoicesModerator::default();
        moderator.insert(ChoiceTree::new(FREE_RANGE_STRATEGY_TREE, vec![Choice::new("Sideways", 7, 1)]));

        let result = FreeRangeClaimer::new([low_space(IntervalSet::full())], &moderator);
        assert!(matches!(result, Err(FatalError::Config(_))));
    }
}

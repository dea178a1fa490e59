//! Tick aggregation and outlier filtering for depth displays

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;

use super::{AggregatedLevel, Side};
use crate::error::{MarketDataError, Result};

/// Round a price to the nearest multiple of `tick`. Non-positive ticks leave
/// the price unchanged; `None` when the result is not representable.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Option<Decimal> {
    if tick <= Decimal::ZERO {
        return Some(price);
    }
    price
        .checked_div(tick)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .checked_mul(tick)
}

/// Aggregate one side of a book.
///
/// Prices are rounded to `tick` and sizes at the same rounded price summed.
/// Levels larger than `outlier_multiple` times the mean aggregated size are
/// removed (a non-positive multiple disables the filter). The best `depth`
/// survivors are returned, best price first, with a running cumulative size.
/// Fails with `InvalidQuery` when `tick` cannot represent a price.
pub fn aggregate_side<I>(
    levels: I,
    side: Side,
    tick: Decimal,
    depth: usize,
    outlier_multiple: Decimal,
) -> Result<Vec<AggregatedLevel>>
where
    I: IntoIterator<Item = (Decimal, Decimal)>,
{
    let mut buckets: BTreeMap<Decimal, Decimal> = BTreeMap::new();
    for (price, size) in levels {
        if size <= Decimal::ZERO {
            continue;
        }
        let rounded = round_to_tick(price, tick).ok_or_else(|| {
            MarketDataError::InvalidQuery(format!("tick {} cannot round price {}", tick, price))
        })?;
        let bucket = buckets.entry(rounded).or_insert(Decimal::ZERO);
        *bucket = bucket.saturating_add(size);
    }

    let mut ordered: Vec<(Decimal, Decimal)> = match side {
        Side::Bid => buckets.into_iter().rev().collect(),
        Side::Ask => buckets.into_iter().collect(),
    };

    if outlier_multiple > Decimal::ZERO && !ordered.is_empty() {
        let total = ordered
            .iter()
            .fold(Decimal::ZERO, |acc, (_, size)| acc.saturating_add(*size));
        let mean = total / Decimal::from(ordered.len());
        // An unrepresentable ceiling filters nothing
        if let Some(ceiling) = mean.checked_mul(outlier_multiple) {
            ordered.retain(|(_, size)| *size <= ceiling);
        }
    }

    let mut cumulative = Decimal::ZERO;
    Ok(ordered
        .into_iter()
        .take(depth)
        .map(|(price, size)| {
            cumulative = cumulative.saturating_add(size);
            AggregatedLevel {
                price,
                size,
                cumulative,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(100.24), dec!(0.5)), Some(dec!(100.0)));
        assert_eq!(round_to_tick(dec!(100.25), dec!(0.5)), Some(dec!(100.5)));
        assert_eq!(round_to_tick(dec!(100.74), dec!(0.5)), Some(dec!(100.5)));
        assert_eq!(round_to_tick(dec!(12.345), dec!(0)), Some(dec!(12.345)));
    }

    #[test]
    fn test_tiny_tick_is_rejected_not_panicking() {
        let tick = Decimal::from_str("0.0000000000000000000000000001").unwrap();
        assert_eq!(round_to_tick(dec!(50000), tick), None);

        let bids = vec![(dec!(50000), dec!(1))];
        let err = aggregate_side(bids, Side::Bid, tick, 5, Decimal::ZERO).unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidQuery(_)));
    }

    #[test]
    fn test_huge_outlier_multiple_filters_nothing() {
        let asks = vec![(dec!(10), dec!(1000000)), (dec!(11), dec!(1))];
        let levels = aggregate_side(asks, Side::Ask, dec!(0), 10, Decimal::MAX).unwrap();
        assert_eq!(levels.len(), 2);
    }

    #[test]
    fn test_merges_levels_on_same_tick() {
        let bids = vec![
            (dec!(100.1), dec!(1)),
            (dec!(100.2), dec!(2)),
            (dec!(99.4), dec!(3)),
        ];
        let levels = aggregate_side(bids, Side::Bid, dec!(1), 10, Decimal::ZERO).unwrap();

        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, dec!(100));
        assert_eq!(levels[0].size, dec!(3));
        assert_eq!(levels[1].price, dec!(99));
        assert_eq!(levels[1].cumulative, dec!(6));
    }

    #[test]
    fn test_filters_spoofed_level() {
        let asks = vec![
            (dec!(10), dec!(1)),
            (dec!(11), dec!(1)),
            (dec!(12), dec!(1)),
            (dec!(13), dec!(97)),
        ];
        // mean = 25, ceiling = 50 → the 97 lot is removed
        let levels = aggregate_side(asks, Side::Ask, dec!(0), 10, dec!(2)).unwrap();

        assert_eq!(levels.len(), 3);
        assert!(levels.iter().all(|l| l.price != dec!(13)));
        assert_eq!(levels.last().unwrap().cumulative, dec!(3));
    }

    #[test]
    fn test_depth_and_ordering() {
        let asks = (1..=20).map(|i| (Decimal::from(i), dec!(1)));
        let levels = aggregate_side(asks, Side::Ask, dec!(0), 5, Decimal::ZERO).unwrap();

        assert_eq!(levels.len(), 5);
        assert_eq!(levels[0].price, dec!(1));
        assert_eq!(levels[4].price, dec!(5));
        assert!(levels.windows(2).all(|w| w[0].cumulative <= w[1].cumulative));
    }

    #[test]
    fn test_skips_non_positive_sizes() {
        let bids = vec![(dec!(5), dec!(0)), (dec!(4), dec!(-1)), (dec!(3), dec!(2))];
        let levels = aggregate_side(bids, Side::Bid, dec!(0), 10, Decimal::ZERO).unwrap();
        assert_eq!(levels.len(), 1);
        assert!(levels.iter().all(|l| l.size > Decimal::ZERO));
    }
}

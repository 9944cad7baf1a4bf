//! Distribution of pool sizes over zones.

use crate::crds::IntOrPercent;

/// Share of `total` for the zone at `index` out of `zones`: the floor of the
/// even split plus one for each of the first `total % zones` zones.
#[must_use]
pub fn distribute_over_zones(index: usize, total: i32, zones: usize) -> i32 {
    let Ok(zones) = i32::try_from(zones) else {
        return 0;
    };
    if zones == 0 {
        return total;
    }
    let Ok(index) = i32::try_from(index) else {
        return 0;
    };
    let extra = i32::from(index < total % zones);
    total / zones + extra
}

/// Like [`distribute_over_zones`] for surge and unavailability: percentages
/// apply per zone as they are, and a positive number leaves every zone at
/// least one.
#[must_use]
pub fn distribute_positive(index: usize, value: &IntOrPercent, zones: usize) -> IntOrPercent {
    match value {
        IntOrPercent::Percent(percent) => IntOrPercent::Percent(percent.clone()),
        IntOrPercent::Int(total) => {
            let share = distribute_over_zones(index, *total, zones);
            if *total > 0 {
                IntOrPercent::Int(share.max(1))
            } else {
                IntOrPercent::Int(share)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_goes_to_the_first_zones() {
        let shares: Vec<i32> = (0..3).map(|i| distribute_over_zones(i, 7, 3)).collect();
        assert_eq!(shares, vec![3, 2, 2]);
        assert_eq!(shares.iter().sum::<i32>(), 7);
        assert_eq!(distribute_over_zones(2, 1, 3), 0);
        assert_eq!(distribute_over_zones(0, 5, 0), 5);
    }

    #[test]
    fn surge_keeps_at_least_one_per_zone() {
        assert_eq!(distribute_positive(2, &IntOrPercent::Int(1), 3), IntOrPercent::Int(1));
        assert_eq!(distribute_positive(0, &IntOrPercent::Int(0), 3), IntOrPercent::Int(0));
        assert_eq!(
            distribute_positive(1, &IntOrPercent::Percent("25%".to_string()), 3),
            IntOrPercent::Percent("25%".to_string())
        );
    }
}

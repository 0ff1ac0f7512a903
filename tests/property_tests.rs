//! Property-based tests for capture timing and amount conversion.

use proptest::prelude::*;
use rust_decimal::Decimal;

use capture_scheduler::capture::{
    currency::{from_minor_units, to_minor_units},
    delay::{calculate_capture_delay_ms, DelayPolicy, EDIT_WINDOW_SECS},
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn capture_delay_never_exceeds_edit_window(buffer in 0u64..10_000) {
        let delay = calculate_capture_delay_ms(buffer);
        prop_assert!(delay <= EDIT_WINDOW_SECS * 1000);
    }

    #[test]
    fn capture_delay_matches_window_minus_buffer(buffer in 0u64..=EDIT_WINDOW_SECS) {
        prop_assert_eq!(
            calculate_capture_delay_ms(buffer),
            (EDIT_WINDOW_SECS - buffer) * 1000
        );
    }

    #[test]
    fn oversized_buffer_floors_at_zero(buffer in EDIT_WINDOW_SECS..u64::MAX / 2) {
        prop_assert_eq!(DelayPolicy::new(buffer).capture_delay_ms(), 0);
    }

    #[test]
    fn larger_buffer_never_delays_capture_further(a in 0u64..5_000, b in 0u64..5_000) {
        let (small, large) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(calculate_capture_delay_ms(large) <= calculate_capture_delay_ms(small));
    }

    #[test]
    fn two_decimal_amounts_survive_minor_unit_conversion(cents in 0i64..100_000_000) {
        let amount = Decimal::new(cents, 2);
        let minor = to_minor_units(amount, "usd").unwrap();
        prop_assert_eq!(minor, cents);
        prop_assert_eq!(from_minor_units(minor, "usd"), amount);
    }

    #[test]
    fn zero_decimal_amounts_are_not_scaled(yen in 0i64..100_000_000) {
        let minor = to_minor_units(Decimal::from(yen), "jpy").unwrap();
        prop_assert_eq!(minor, yen);
    }
}

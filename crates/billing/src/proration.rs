//! Upgrade price proration
//!
//! Pure calculations for plan changes: the unused remaining value of the
//! current plan is credited against the target plan's price. No I/O.

use quillcheck_shared::{MemberPlan, PeriodType};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// The current membership period a proration is computed against
#[derive(Debug, Clone, Copy)]
pub struct CurrentPeriod {
    pub start: OffsetDateTime,
    pub expire: OffsetDateTime,
}

/// Price in cents for changing to `target`.
///
/// With no current plan the target's full price applies. Otherwise the
/// remaining value of the current plan (daily rate times remaining days) is
/// refunded against the target price, floored at zero. Dates are truncated to
/// day granularity before subtraction so time-of-day never skews the result.
pub fn price_for_change(
    current: Option<(&MemberPlan, CurrentPeriod)>,
    target: &MemberPlan,
    today: OffsetDateTime,
) -> i64 {
    let (plan, period) = match current {
        Some(c) => c,
        None => return target.price_cents,
    };

    let total_days = (period.expire.date() - period.start.date()).whole_days();
    if total_days <= 0 {
        // Degenerate period carries no remaining value
        return target.price_cents;
    }
    let used_days = (today.date() - period.start.date()).whole_days();
    let remaining_days = (total_days - used_days).max(0);

    let refund = div_round(plan.price_cents as i128 * remaining_days as i128, total_days as i128);
    (target.price_cents - refund).max(0)
}

/// Integer division rounding half up, for cents-per-day arithmetic
fn div_round(numerator: i128, denominator: i128) -> i64 {
    ((numerator * 2 + denominator) / (denominator * 2)) as i64
}

/// Whether moving from `current` to `target` is a legal upgrade.
///
/// Rules: a yearly plan never shortens to a monthly one, and within the same
/// period type the target level must be strictly higher. Switching from
/// monthly to yearly is allowed at any target level; this asymmetry matches
/// the existing catalog semantics and is kept for compatibility.
pub fn is_valid_upgrade(current: &MemberPlan, target: &MemberPlan) -> BillingResult<()> {
    if current.period_type == PeriodType::Yearly && target.period_type == PeriodType::Monthly {
        return Err(BillingError::InvalidUpgrade(
            "cannot change a yearly plan to a monthly one".to_string(),
        ));
    }
    if current.period_type == target.period_type && target.level <= current.level {
        return Err(BillingError::InvalidUpgrade(format!(
            "target level {} is not above current level {}",
            target.level, current.level
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use uuid::Uuid;

    fn plan(level: i32, period_type: PeriodType, price_cents: i64) -> MemberPlan {
        MemberPlan {
            id: Uuid::new_v4(),
            name: format!("plan-{}", level),
            level,
            period_type,
            price_cents,
            detection_quota: 100,
            rewrite_quota: 50,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn period_ending_after(start: OffsetDateTime, days: i64) -> CurrentPeriod {
        CurrentPeriod {
            start,
            expire: start + Duration::days(days),
        }
    }

    #[test]
    fn no_current_plan_pays_full_price() {
        let target = plan(2, PeriodType::Monthly, 4900);
        assert_eq!(price_for_change(None, &target, OffsetDateTime::now_utc()), 4900);
    }

    #[test]
    fn yearly_plan_90_days_in_refunds_remaining_value() {
        // 120.00 yearly plan across 360 days, 90 days used: daily rate is a
        // third of a unit, refund 90.00, so a 200.00 target costs 110.00.
        let current = plan(1, PeriodType::Yearly, 12_000);
        let target = plan(2, PeriodType::Yearly, 20_000);
        let start = OffsetDateTime::now_utc() - Duration::days(90);
        let period = period_ending_after(start, 360);

        let price = price_for_change(Some((&current, period)), &target, OffsetDateTime::now_utc());
        assert_eq!(price, 11_000);
    }

    #[test]
    fn refund_larger_than_target_price_floors_at_zero() {
        let current = plan(3, PeriodType::Yearly, 100_000);
        let target = plan(4, PeriodType::Yearly, 5_000);
        let start = OffsetDateTime::now_utc() - Duration::days(1);
        let period = period_ending_after(start, 365);

        let price = price_for_change(Some((&current, period)), &target, OffsetDateTime::now_utc());
        assert_eq!(price, 0);
    }

    #[test]
    fn fully_used_period_refunds_nothing() {
        let current = plan(1, PeriodType::Monthly, 2_000);
        let target = plan(2, PeriodType::Monthly, 5_000);
        let start = OffsetDateTime::now_utc() - Duration::days(30);
        let period = period_ending_after(start, 30);

        let price = price_for_change(Some((&current, period)), &target, OffsetDateTime::now_utc());
        assert_eq!(price, 5_000);
    }

    #[test]
    fn degenerate_zero_day_period_charges_full_price() {
        let current = plan(1, PeriodType::Monthly, 2_000);
        let target = plan(2, PeriodType::Monthly, 5_000);
        let now = OffsetDateTime::now_utc();
        let period = period_ending_after(now, 0);

        assert_eq!(price_for_change(Some((&current, period)), &target, now), 5_000);
    }

    #[test]
    fn time_of_day_does_not_skew_day_counts() {
        let current = plan(1, PeriodType::Yearly, 12_000);
        let target = plan(2, PeriodType::Yearly, 20_000);
        // Start late in the day; truncation to dates must still count 90 used days
        let start = OffsetDateTime::now_utc().replace_time(time::Time::MIDNIGHT)
            - Duration::days(90)
            + Duration::hours(23);
        let period = period_ending_after(start, 360);

        let price = price_for_change(Some((&current, period)), &target, OffsetDateTime::now_utc());
        assert_eq!(price, 11_000);
    }

    #[test]
    fn yearly_to_monthly_is_rejected() {
        let current = plan(2, PeriodType::Yearly, 12_000);
        let target = plan(3, PeriodType::Monthly, 3_000);
        assert!(matches!(
            is_valid_upgrade(&current, &target),
            Err(BillingError::InvalidUpgrade(_))
        ));
    }

    #[test]
    fn same_period_requires_strictly_higher_level() {
        let monthly1 = plan(1, PeriodType::Monthly, 1_000);
        let monthly2 = plan(2, PeriodType::Monthly, 2_000);
        assert!(is_valid_upgrade(&monthly1, &monthly2).is_ok());
        assert!(is_valid_upgrade(&monthly2, &monthly1).is_err());
        assert!(is_valid_upgrade(&monthly1, &plan(1, PeriodType::Monthly, 1_500)).is_err());
    }

    #[test]
    fn monthly_to_yearly_is_allowed_at_any_level() {
        // Compatibility: period-type switches to yearly skip the level check
        let monthly3 = plan(3, PeriodType::Monthly, 3_000);
        let yearly1 = plan(1, PeriodType::Yearly, 10_000);
        assert!(is_valid_upgrade(&monthly3, &yearly1).is_ok());
    }
}

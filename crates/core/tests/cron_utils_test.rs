#[cfg(test)]
mod cron_utils_tests {
    use chrono::{Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
    use taskq_core::cron_utils::{CronEvaluator, CronExpression};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    fn days_between(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
        from.iter_days().take_while(move |d| *d <= to)
    }

    #[test]
    fn test_range_wraps_across_midnight() {
        let expr = "0 0 22-2 * * *";
        for hour in 0..24 {
            let expected = matches!(hour, 22 | 23 | 0 | 1 | 2);
            assert_eq!(
                CronEvaluator::is_due_at(expr, &at(2024, 1, 1, hour, 0, 0)),
                expected,
                "hour {hour}"
            );
        }
        assert!(!CronEvaluator::is_due_at(expr, &at(2024, 1, 1, 23, 1, 0)));
        assert!(!CronEvaluator::is_due_at(expr, &at(2024, 1, 1, 23, 0, 1)));
    }

    #[test]
    fn test_nth_weekday_uses_sunday_zero_numbering() {
        // 1 = 周一，2 = 周二
        let first_monday = CronExpression::parse("0 0 12 ? * 1#1 *").unwrap();
        let first_tuesday = CronExpression::parse("0 0 12 ? * 2#1 *").unwrap();

        for day in days_between(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        ) {
            let noon = day.and_hms_opt(12, 0, 0).unwrap();
            let iso = day.weekday().number_from_monday();
            assert_eq!(first_monday.matches(&noon), iso == 1 && day.day() <= 7, "{day}");
            assert_eq!(first_tuesday.matches(&noon), iso == 2 && day.day() <= 7, "{day}");
            assert!(!first_monday.matches(&day.and_hms_opt(12, 0, 1).unwrap()));
        }

        assert!(first_monday.matches(&at(2024, 1, 1, 12, 0, 0)));
        assert!(first_tuesday.matches(&at(2024, 1, 2, 12, 0, 0)));
        assert!(!first_monday.matches(&at(2024, 1, 8, 12, 0, 0)));
    }

    #[test]
    fn test_nth_weekday_missing_occurrence() {
        // 2024 年 2 月只有 4 个周一
        let fifth_monday = CronExpression::parse("0 0 0 ? * 1#5").unwrap();
        for day in days_between(
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        ) {
            assert!(!fifth_monday.matches(&day.and_hms_opt(0, 0, 0).unwrap()));
        }
        // 2024-09-30 是九月的第五个周一
        assert!(fifth_monday.matches(&at(2024, 9, 30, 0, 0, 0)));
    }

    #[test]
    fn test_last_day_of_every_month() {
        let expr = CronExpression::parse("0 0 0 L * ? *").unwrap();
        for day in days_between(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        ) {
            let is_last = (day + Duration::days(1)).month() != day.month();
            assert_eq!(expr.matches(&day.and_hms_opt(0, 0, 0).unwrap()), is_last, "{day}");
        }
        assert!(expr.matches(&at(2024, 2, 29, 0, 0, 0)));
        assert!(expr.matches(&at(2023, 2, 28, 0, 0, 0)));
        assert!(!expr.matches(&at(2024, 2, 28, 0, 0, 0)));
    }

    #[test]
    fn test_last_weekday_and_nearest_weekday() {
        let last_weekday = CronExpression::parse("0 0 0 LW * ?").unwrap();
        assert!(last_weekday.matches(&at(2024, 3, 29, 0, 0, 0)));
        assert!(!last_weekday.matches(&at(2024, 3, 31, 0, 0, 0)));

        // 2024-06-01 是周六，最近的工作日不跨月，落到 6 月 3 日
        let first_weekday = CronExpression::parse("0 0 0 1W * ?").unwrap();
        assert!(first_weekday.matches(&at(2024, 6, 3, 0, 0, 0)));
        assert!(!first_weekday.matches(&at(2024, 6, 1, 0, 0, 0)));

        // 2 月没有 30 号
        let thirtieth = CronExpression::parse("0 0 0 30W * ?").unwrap();
        for day in days_between(
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        ) {
            assert!(!thirtieth.matches(&day.and_hms_opt(0, 0, 0).unwrap()));
        }
    }

    #[test]
    fn test_day_of_week_specials() {
        let last_monday = CronExpression::parse("0 0 0 ? * 1L").unwrap();
        assert!(last_monday.matches(&at(2024, 5, 27, 0, 0, 0)));
        assert!(!last_monday.matches(&at(2024, 5, 20, 0, 0, 0)));

        let weekdays = CronExpression::parse("0 0 9 ? * W").unwrap();
        assert!(weekdays.matches(&at(2024, 5, 31, 9, 0, 0)));
        assert!(!weekdays.matches(&at(2024, 6, 1, 9, 0, 0)));

        let sunday = CronExpression::parse("0 0 0 ? * 0").unwrap();
        assert!(sunday.matches(&at(2024, 6, 2, 0, 0, 0)));
        assert!(!sunday.matches(&at(2024, 6, 3, 0, 0, 0)));

        // 周五到周一，跨越周日回绕
        let long_weekend = CronExpression::parse("0 0 0 ? * 5-1").unwrap();
        assert!(long_weekend.matches(&at(2024, 5, 31, 0, 0, 0)));
        assert!(long_weekend.matches(&at(2024, 6, 1, 0, 0, 0)));
        assert!(long_weekend.matches(&at(2024, 6, 2, 0, 0, 0)));
        assert!(long_weekend.matches(&at(2024, 6, 3, 0, 0, 0)));
        assert!(!long_weekend.matches(&at(2024, 6, 5, 0, 0, 0)));
    }

    #[test]
    fn test_steps_lists_and_optional_fields() {
        let every_quarter = CronExpression::parse("0/15 * * * * ?").unwrap();
        for second in 0..60 {
            assert_eq!(
                every_quarter.matches(&at(2024, 1, 1, 0, 0, second)),
                second % 15 == 0
            );
        }

        let minutes = CronExpression::parse("0 /20,7 * * * ?").unwrap();
        assert!(minutes.matches(&at(2024, 1, 1, 3, 40, 0)));
        assert!(minutes.matches(&at(2024, 1, 1, 3, 7, 0)));
        assert!(!minutes.matches(&at(2024, 1, 1, 3, 41, 0)));

        // 五字段：没有秒字段，只在第 0 秒触发
        let five_fields = CronExpression::parse("30 12 * * ?").unwrap();
        assert!(five_fields.matches(&at(2024, 1, 1, 12, 30, 0)));
        assert!(!five_fields.matches(&at(2024, 1, 1, 12, 30, 1)));

        let with_year = CronExpression::parse("0 0 0 1 1 ? 2025").unwrap();
        assert!(with_year.matches(&at(2025, 1, 1, 0, 0, 0)));
        assert!(!with_year.matches(&at(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn test_validate() {
        for valid in [
            "0 0 22-2 * * *",
            "0 0 12 ? * 2#1 *",
            "0 0 0 L * ? *",
            "* * * * *",
            "0 15 10 ? * 6L 2099",
            "05 0/5 8-18 LW,15W 1-6 ?",
            "0 0 0 ? * W,0",
        ] {
            assert!(CronEvaluator::validate(valid), "{valid}");
        }

        for invalid in [
            "",
            "* * * *",
            "0 0 0 1 1 ? 2025 9",
            "60 * * * * ?",
            "0 0 24 * * ?",
            "0 0 0 ? * ?",
            "0 0 0 L * L",
            "0 0 0 32 * ?",
            "0 0 0 * 13 ?",
            "0 0 0 * * 7",
            "0 0 0 1 1 ? 1969",
            "0 0 0 1W,? * 1",
            "0 0 0 ? * 1#0",
            "0 0/0 * * * ?",
            "a b c d e f",
            "0 0 0 1,,2 * ?",
        ] {
            assert!(!CronEvaluator::validate(invalid), "{invalid}");
            assert!(!CronEvaluator::is_due_at(invalid, &at(2024, 1, 1, 0, 0, 0)));
        }
    }

    #[test]
    fn test_is_due_uses_supplied_instant_calendar() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let local = tz.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap();
        let utc = Utc.with_ymd_and_hms(2024, 1, 1, 14, 0, 0).unwrap();
        assert_eq!(local, utc);

        assert!(CronEvaluator::is_due("0 0 22 * * ?", &local));
        assert!(!CronEvaluator::is_due("0 0 22 * * ?", &utc));
    }
}

//! CRON表达式解析与匹配
//!
//! 支持 5-7 个以空白分隔的字段:
//!
//! ```text
//! [秒] 分 时 日 月 周 [年]
//! ```
//!
//! 缺省秒字段时只在第 0 秒触发，缺省年字段时匹配任意年份。每个字段按 `,` 拆分为
//! 若干子模式，任一子模式匹配即字段匹配。子模式语法:
//!
//! - `*` 任意值；`a-b` 闭区间，`a > b` 时跨越边界回绕（小时 `22-2` 即 22,23,0,1,2）
//! - `a/n` 从 `a`（省略时为字段最小值）起每隔 `n`；`a` 精确值
//! - 日: `L` 月末，`LW` 月末最后一个工作日，`NW` 距 N 号最近的工作日（不跨月），`?`
//! - 周: `W` 周一到周五，`DL` 当月最后一个周 D，`D#k` 当月第 k 个周 D，`?`
//!
//! 周字段取值 0-6，0 表示周日，与 ISO 星期（周日为 7）比较。日与周字段最多只能有一个为 `?`。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Weekday};
use tracing::debug;

use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
    Year,
}

impl FieldKind {
    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Second | FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 6),
            FieldKind::Year => (1970, 2099),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::Second => "秒",
            FieldKind::Minute => "分",
            FieldKind::Hour => "时",
            FieldKind::DayOfMonth => "日",
            FieldKind::Month => "月",
            FieldKind::DayOfWeek => "周",
            FieldKind::Year => "年",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronItem {
    Any,
    Unspecified,
    Value(u32),
    Range(u32, u32),
    Step { start: u32, step: u32 },
    LastDay,
    LastWeekday,
    NearestWeekday(u32),
    Weekdays,
    LastOfWeekday(u32),
    NthWeekday { weekday: u32, nth: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    kind: FieldKind,
    items: Vec<CronItem>,
}

impl CronField {
    fn any(kind: FieldKind) -> Self {
        Self {
            kind,
            items: vec![CronItem::Any],
        }
    }

    fn only_zero(kind: FieldKind) -> Self {
        Self {
            kind,
            items: vec![CronItem::Value(0)],
        }
    }

    fn is_unspecified(&self) -> bool {
        self.items == [CronItem::Unspecified]
    }

    fn parse(kind: FieldKind, raw: &str) -> Result<Self, String> {
        let items = raw
            .split(',')
            .map(|segment| parse_item(kind, segment))
            .collect::<Result<Vec<_>, _>>()?;

        if items.len() > 1 && items.contains(&CronItem::Unspecified) {
            return Err(format!("{}字段中 `?` 不能与其他值组合", kind.name()));
        }

        Ok(Self { kind, items })
    }

    /// `value` 为该字段在目标时刻的取值，周字段传入 ISO 星期 (1-7)
    fn matches(&self, value: u32, date: NaiveDate) -> bool {
        self.items.iter().any(|item| self.item_matches(item, value, date))
    }

    fn item_matches(&self, item: &CronItem, value: u32, date: NaiveDate) -> bool {
        // 周字段内部按 0-6 比较
        let value = if self.kind == FieldKind::DayOfWeek {
            value % 7
        } else {
            value
        };

        match *item {
            CronItem::Any | CronItem::Unspecified => true,
            CronItem::Value(v) => v == value,
            CronItem::Range(from, to) => {
                if from <= to {
                    (from..=to).contains(&value)
                } else {
                    value >= from || value <= to
                }
            }
            CronItem::Step { start, step } => value >= start && (value - start) % step == 0,
            CronItem::LastDay => date.day() == days_in_month(date),
            CronItem::LastWeekday => date.day() == last_weekday_of_month(date),
            CronItem::NearestWeekday(day) => nearest_weekday(date, day) == Some(date.day()),
            CronItem::Weekdays => (1..=5).contains(&value),
            CronItem::LastOfWeekday(weekday) => {
                value == weekday && date.day() + 7 > days_in_month(date)
            }
            CronItem::NthWeekday { weekday, nth } => {
                value == weekday && (date.day() - 1) / 7 + 1 == nth
            }
        }
    }
}

fn parse_number(kind: FieldKind, raw: &str) -> Result<u32, String> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("{}字段包含无效数值 `{raw}`", kind.name()));
    }
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("{}字段数值过大 `{raw}`", kind.name()))?;
    let (min, max) = kind.bounds();
    if value < min || value > max {
        return Err(format!(
            "{}字段数值 {value} 超出范围 {min}-{max}",
            kind.name()
        ));
    }
    Ok(value)
}

fn parse_item(kind: FieldKind, segment: &str) -> Result<CronItem, String> {
    if segment.is_empty() {
        return Err(format!("{}字段包含空的子模式", kind.name()));
    }

    if segment == "*" {
        return Ok(CronItem::Any);
    }

    if segment == "?" {
        return match kind {
            FieldKind::DayOfMonth | FieldKind::DayOfWeek => Ok(CronItem::Unspecified),
            _ => Err(format!("{}字段不支持 `?`", kind.name())),
        };
    }

    if let Some((start, step)) = segment.split_once('/') {
        let start = match start {
            "" | "*" => kind.bounds().0,
            other => parse_number(kind, other)?,
        };
        let step = match step.parse::<u32>() {
            Ok(n) if n > 0 && step.bytes().all(|b| b.is_ascii_digit()) => n,
            _ => return Err(format!("{}字段步长无效 `{segment}`", kind.name())),
        };
        return Ok(CronItem::Step { start, step });
    }

    if let Some((from, to)) = segment.split_once('-') {
        return Ok(CronItem::Range(
            parse_number(kind, from)?,
            parse_number(kind, to)?,
        ));
    }

    match kind {
        FieldKind::DayOfMonth => {
            if segment == "L" {
                return Ok(CronItem::LastDay);
            }
            if segment == "LW" {
                return Ok(CronItem::LastWeekday);
            }
            if let Some(day) = segment.strip_suffix('W') {
                return Ok(CronItem::NearestWeekday(parse_number(kind, day)?));
            }
        }
        FieldKind::DayOfWeek => {
            if segment == "W" {
                return Ok(CronItem::Weekdays);
            }
            if let Some(weekday) = segment.strip_suffix('L') {
                return Ok(CronItem::LastOfWeekday(parse_number(kind, weekday)?));
            }
            if let Some((weekday, nth)) = segment.split_once('#') {
                let weekday = parse_number(kind, weekday)?;
                let nth: u32 = nth
                    .parse()
                    .map_err(|_| format!("周字段序号无效 `{segment}`"))?;
                if !(1..=5).contains(&nth) {
                    return Err(format!("周字段序号必须在 1-5 之间 `{segment}`"));
                }
                return Ok(CronItem::NthWeekday { weekday, nth });
            }
        }
        _ => {}
    }

    parse_number(kind, segment).map(CronItem::Value)
}

fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

fn last_weekday_of_month(date: NaiveDate) -> u32 {
    let last = days_in_month(date);
    match date.with_day(last).map(|d| d.weekday()) {
        Some(Weekday::Sat) => last - 1,
        Some(Weekday::Sun) => last - 2,
        _ => last,
    }
}

/// 距 `day` 号最近的工作日，不跨月；`day` 超出当月天数时为 None
fn nearest_weekday(date: NaiveDate, day: u32) -> Option<u32> {
    let last = days_in_month(date);
    if day > last {
        return None;
    }
    match date.with_day(day)?.weekday() {
        Weekday::Sat if day == 1 => Some(day + 2),
        Weekday::Sat => Some(day - 1),
        Weekday::Sun if day == last => Some(day - 2),
        Weekday::Sun => Some(day + 1),
        _ => Some(day),
    }
}

/// 解析后的CRON表达式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    second: CronField,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
    year: CronField,
}

impl CronExpression {
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        Self::parse_fields(expression).map_err(|message| SchedulerError::InvalidCron {
            expr: expression.to_string(),
            message,
        })
    }

    fn parse_fields(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (second, rest) = match fields.len() {
            5 => (CronField::only_zero(FieldKind::Second), &fields[..]),
            6 | 7 => (CronField::parse(FieldKind::Second, fields[0])?, &fields[1..]),
            n => return Err(format!("字段数量必须为 5-7，实际为 {n}")),
        };

        let minute = CronField::parse(FieldKind::Minute, rest[0])?;
        let hour = CronField::parse(FieldKind::Hour, rest[1])?;
        let day_of_month = CronField::parse(FieldKind::DayOfMonth, rest[2])?;
        let month = CronField::parse(FieldKind::Month, rest[3])?;
        let day_of_week = CronField::parse(FieldKind::DayOfWeek, rest[4])?;
        let year = match rest.get(5) {
            Some(raw) => CronField::parse(FieldKind::Year, raw)?,
            None => CronField::any(FieldKind::Year),
        };

        if day_of_month.is_unspecified() && day_of_week.is_unspecified() {
            return Err("日与周字段不能同时为 `?`".to_string());
        }

        Ok(Self {
            source: expression.to_string(),
            second,
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
            year,
        })
    }

    /// 判断给定的日历时刻是否匹配，所有字段都必须匹配
    pub fn matches(&self, instant: &NaiveDateTime) -> bool {
        let date = instant.date();
        let year = match u32::try_from(instant.year()) {
            Ok(year) => year,
            Err(_) => return false,
        };

        self.second.matches(instant.second(), date)
            && self.minute.matches(instant.minute(), date)
            && self.hour.matches(instant.hour(), date)
            && self.day_of_month.matches(date.day(), date)
            && self.month.matches(date.month(), date)
            && self
                .day_of_week
                .matches(date.weekday().number_from_monday(), date)
            && self.year.matches(year, date)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// CRON触发判定
pub struct CronEvaluator;

impl CronEvaluator {
    /// 表达式在 `instant` 所在时区的日历时刻是否触发；无效表达式恒为 false
    pub fn is_due<Tz: TimeZone>(expression: &str, instant: &DateTime<Tz>) -> bool {
        Self::is_due_at(expression, &instant.naive_local())
    }

    pub fn is_due_at(expression: &str, instant: &NaiveDateTime) -> bool {
        match CronExpression::parse(expression) {
            Ok(cron) => cron.matches(instant),
            Err(e) => {
                debug!("跳过无效的CRON表达式: {}", e);
                false
            }
        }
    }

    pub fn validate(expression: &str) -> bool {
        CronExpression::parse(expression).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(date(2024, 2, 10)), 29);
        assert_eq!(days_in_month(date(2023, 2, 10)), 28);
        assert_eq!(days_in_month(date(2024, 12, 1)), 31);
        assert_eq!(days_in_month(date(2024, 4, 1)), 30);
    }

    #[test]
    fn test_nearest_weekday_rules() {
        // 2024-06-01 是周六，不能回退到上个月
        assert_eq!(nearest_weekday(date(2024, 6, 1), 1), Some(3));
        // 2024-06-15 是周六
        assert_eq!(nearest_weekday(date(2024, 6, 1), 15), Some(14));
        // 2024-06-16 是周日
        assert_eq!(nearest_weekday(date(2024, 6, 1), 16), Some(17));
        // 2024-06-30 是周日，且为月末
        assert_eq!(nearest_weekday(date(2024, 6, 1), 30), Some(28));
        assert_eq!(nearest_weekday(date(2024, 6, 1), 31), None);
    }

    #[test]
    fn test_last_weekday_of_month() {
        // 2024-08-31 是周六
        assert_eq!(last_weekday_of_month(date(2024, 8, 1)), 30);
        // 2024-03-31 是周日
        assert_eq!(last_weekday_of_month(date(2024, 3, 1)), 29);
        // 2024-07-31 是周三
        assert_eq!(last_weekday_of_month(date(2024, 7, 1)), 31);
    }

    #[test]
    fn test_parse_items() {
        assert_eq!(
            parse_item(FieldKind::Minute, "/15").unwrap(),
            CronItem::Step { start: 0, step: 15 }
        );
        assert_eq!(parse_item(FieldKind::Hour, "05").unwrap(), CronItem::Value(5));
        assert_eq!(
            parse_item(FieldKind::DayOfWeek, "5#3").unwrap(),
            CronItem::NthWeekday { weekday: 5, nth: 3 }
        );
        assert_eq!(
            parse_item(FieldKind::DayOfMonth, "15W").unwrap(),
            CronItem::NearestWeekday(15)
        );
        assert!(parse_item(FieldKind::Minute, "L").is_err());
        assert!(parse_item(FieldKind::DayOfWeek, "7").is_err());
        assert!(parse_item(FieldKind::DayOfWeek, "1#6").is_err());
        assert!(parse_item(FieldKind::Second, "5/0").is_err());
        assert!(parse_item(FieldKind::Hour, "?").is_err());
    }
}

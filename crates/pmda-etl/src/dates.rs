//! Japanese era (wareki) date conversion.
//!
//! PMDA pages print approval dates as e.g. `令和3年5月27日`. This converts
//! the five modern eras to Gregorian dates, handling the `元年` first-year
//! form and full-width digits.

use chrono::NaiveDate;

/// Era name and the Gregorian year of that era's year zero
/// (era year 1 = base + 1).
const ERAS: &[(&str, i32)] = &[
    ("令和", 2018),
    ("平成", 1988),
    ("昭和", 1925),
    ("大正", 1911),
    ("明治", 1867),
];

/// Convert a wareki or Gregorian date string to a date.
/// Returns None on anything unparseable; callers decide whether that is
/// a null cell or an error.
pub fn to_iso_date(text: &str) -> Option<NaiveDate> {
    let text = normalize_digits(text.trim());

    for (era, base) in ERAS {
        let Some(rest) = text.strip_prefix(era) else {
            continue;
        };
        let (year_part, rest) = rest.split_once('年')?;
        let year = if year_part.trim() == "元" {
            1
        } else {
            year_part.trim().parse::<i32>().ok()?
        };
        let (month_part, rest) = rest.split_once('月')?;
        let month: u32 = month_part.trim().parse().ok()?;
        let day_part = rest.trim().trim_end_matches('日');
        let day: u32 = day_part.trim().parse().ok()?;
        return NaiveDate::from_ymd_opt(base + year, month, day);
    }

    NaiveDate::parse_from_str(&text, "%Y年%m月%d日")
        .or_else(|_| NaiveDate::parse_from_str(&text, "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(&text, "%Y/%m/%d"))
        .ok()
}

fn normalize_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_reiwa() {
        assert_eq!(to_iso_date("令和3年5月27日"), Some(date(2021, 5, 27)));
        assert_eq!(to_iso_date("令和元年10月1日"), Some(date(2019, 10, 1)));
    }

    #[test]
    fn test_earlier_eras() {
        assert_eq!(to_iso_date("平成元年1月8日"), Some(date(1989, 1, 8)));
        assert_eq!(to_iso_date("昭和64年1月7日"), Some(date(1989, 1, 7)));
        assert_eq!(to_iso_date("大正15年12月25日"), Some(date(1926, 12, 25)));
        assert_eq!(to_iso_date("明治1年9月8日"), Some(date(1868, 9, 8)));
    }

    #[test]
    fn test_full_width_digits() {
        assert_eq!(to_iso_date("令和５年１１月２４日"), Some(date(2023, 11, 24)));
    }

    #[test]
    fn test_gregorian_passthrough() {
        assert_eq!(to_iso_date("2021年5月27日"), Some(date(2021, 5, 27)));
        assert_eq!(to_iso_date("2021-05-27"), Some(date(2021, 5, 27)));
        assert_eq!(to_iso_date("2021/05/27"), Some(date(2021, 5, 27)));
    }

    #[test]
    fn test_unparseable() {
        assert_eq!(to_iso_date(""), None);
        assert_eq!(to_iso_date("未定"), None);
        assert_eq!(to_iso_date("令和3年13月1日"), None);
    }
}

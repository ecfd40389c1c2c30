use jiff::{
    Span,
    civil::{Date, DateTime},
};
use serde::Deserialize;

use crate::{config::ConfigError, resolver::Target};

/// Which messages to act on. `delete_years` wins over `cutoff_date`, which
/// wins over `years_old`.
#[derive(Debug, Default, Deserialize)]
pub struct CleanupConfig {
    /// Messages older than this many years, 1 when nothing else is set.
    years_old: Option<u32>,
    /// `05-Jan-2020` or `2020-01-05`.
    cutoff_date: Option<String>,
    /// `2016-2017` or `2016`.
    delete_years: Option<String>,
}

const MIN_YEAR: i16 = 1970;
const MAX_YEAR: i16 = 9998;

impl CleanupConfig {
    pub fn target(&self, now: DateTime) -> Result<Target, ConfigError> {
        if let Some(years) = &self.delete_years {
            let (first, last) = parse_years(years)?;
            return Ok(Target::Years { first, last });
        }
        if let Some(cutoff) = &self.cutoff_date {
            return Ok(Target::Before(parse_cutoff(cutoff)?.at(0, 0, 0, 0)));
        }

        let years_old = self.years_old.unwrap_or(1);
        let cutoff = Span::new()
            .try_days(i64::from(years_old) * 365)
            .ok()
            .and_then(|span| now.checked_sub(span).ok())
            .ok_or_else(|| ConfigError::Cleanup(format!("years_old {years_old} is too large")))?;
        Ok(Target::Before(cutoff))
    }
}

fn parse_years(years: &str) -> Result<(i16, i16), ConfigError> {
    let parse = |year: &str| {
        year.trim()
            .parse::<i16>()
            .ok()
            .filter(|year| (MIN_YEAR..=MAX_YEAR).contains(year))
            .ok_or_else(|| {
                ConfigError::Cleanup(format!(
                    "delete_years {years:?}: {year:?} is not a year between {MIN_YEAR} and {MAX_YEAR}"
                ))
            })
    };

    let (first, last) = match years.split_once('-') {
        Some((first, last)) => (parse(first)?, parse(last)?),
        None => {
            let year = parse(years)?;
            (year, year)
        }
    };
    if first > last {
        return Err(ConfigError::Cleanup(format!(
            "delete_years {years:?} ends before it starts"
        )));
    }
    Ok((first, last))
}

fn parse_cutoff(cutoff: &str) -> Result<Date, ConfigError> {
    let cutoff = cutoff.trim();
    Date::strptime("%d-%b-%Y", cutoff)
        .or_else(|_| cutoff.parse::<Date>())
        .map_err(|_| {
            ConfigError::Cleanup(format!(
                "cutoff_date {cutoff:?} is neither like 05-Jan-2020 nor like 2020-01-05"
            ))
        })
}

#[cfg(test)]
mod tests {
    use assertables::*;
    use jiff::civil::date;
    use rstest::*;

    use super::*;

    #[fixture]
    fn now() -> DateTime {
        date(2024, 6, 15).at(12, 0, 0, 0)
    }

    fn cleanup(toml: &str) -> CleanupConfig {
        assert_ok!(toml::from_str(toml))
    }

    #[rstest]
    #[case("", Target::Before(date(2023, 6, 16).at(12, 0, 0, 0)))]
    #[case("years_old = 2", Target::Before(date(2022, 6, 16).at(12, 0, 0, 0)))]
    #[case(r#"cutoff_date = "05-Jan-2020""#, Target::Before(date(2020, 1, 5).at(0, 0, 0, 0)))]
    #[case(r#"cutoff_date = "2020-01-05""#, Target::Before(date(2020, 1, 5).at(0, 0, 0, 0)))]
    #[case(r#"delete_years = "2016-2017""#, Target::Years { first: 2016, last: 2017 })]
    #[case(r#"delete_years = " 2015 ""#, Target::Years { first: 2015, last: 2015 })]
    #[case(
        "years_old = 3\ncutoff_date = \"05-Jan-2020\"\ndelete_years = \"2012\"",
        Target::Years { first: 2012, last: 2012 }
    )]
    #[case(
        "years_old = 3\ncutoff_date = \"05-Jan-2020\"",
        Target::Before(date(2020, 1, 5).at(0, 0, 0, 0))
    )]
    fn test_target_resolution(now: DateTime, #[case] toml: &str, #[case] expected: Target) {
        assert_eq!(expected, assert_ok!(cleanup(toml).target(now)));
    }

    #[rstest]
    #[case(r#"delete_years = "2017-2016""#)]
    #[case(r#"delete_years = "1969""#)]
    #[case(r#"delete_years = "twenty""#)]
    #[case(r#"cutoff_date = "5/1/2020""#)]
    #[case("years_old = 4000000000")]
    fn test_invalid_targets(now: DateTime, #[case] toml: &str) {
        assert_matches!(cleanup(toml).target(now), Err(ConfigError::Cleanup(_)));
    }
}

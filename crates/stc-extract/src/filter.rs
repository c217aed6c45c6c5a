use crate::path::Segment;
use crate::stream::TokenKind;
use chrono::NaiveDate;
use stc_core::parse_day;

/// Verdict returned when an in-flight entity closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Retain,
    DropStale,
    DropMalformed { field: String },
}

/// Per-entity inclusion filter, consulted for every token while the entity
/// is being built and once more at close. State never outlives one entity.
#[derive(Debug)]
pub enum InclusionFilter {
    Unfiltered,
    TaskActivity(ActivityScan),
}

impl InclusionFilter {
    pub fn for_task(cutoff: Option<NaiveDate>) -> Self {
        InclusionFilter::TaskActivity(ActivityScan::new(cutoff))
    }

    pub fn for_project() -> Self {
        InclusionFilter::Unfiltered
    }

    pub fn observe(&mut self, relative_path: &[Segment], kind: &TokenKind) {
        match self {
            InclusionFilter::Unfiltered => {}
            InclusionFilter::TaskActivity(scan) => scan.observe(relative_path, kind),
        }
    }

    pub fn verdict(&self) -> Verdict {
        match self {
            InclusionFilter::Unfiltered => Verdict::Retain,
            InclusionFilter::TaskActivity(scan) => scan.verdict(),
        }
    }
}

const TIME_SPENT_FIELD: &str = "timeSpentOnDay";

/// Watches `timeSpentOnDay` keys while a task streams by and remembers the
/// most recent day seen. The maximum starts empty for every entity, so a day
/// observed in one task can never leak into a sibling.
#[derive(Debug)]
pub struct ActivityScan {
    cutoff: Option<NaiveDate>,
    max_day_seen: Option<NaiveDate>,
    bad_day: Option<String>,
}

impl ActivityScan {
    fn new(cutoff: Option<NaiveDate>) -> Self {
        Self {
            cutoff,
            max_day_seen: None,
            bad_day: None,
        }
    }

    fn observe(&mut self, relative_path: &[Segment], kind: &TokenKind) {
        let TokenKind::Key(day_key) = kind else {
            return;
        };
        let ends_in_time_spent = relative_path
            .last()
            .and_then(Segment::as_key)
            .is_some_and(|field| field == TIME_SPENT_FIELD);
        if !ends_in_time_spent {
            return;
        }

        match parse_day(day_key) {
            Ok(day) => {
                self.max_day_seen = Some(self.max_day_seen.map_or(day, |seen| seen.max(day)));
            }
            Err(_) => {
                if self.bad_day.is_none() {
                    self.bad_day = Some(day_key.clone());
                }
            }
        }
    }

    fn verdict(&self) -> Verdict {
        if let Some(bad_day) = &self.bad_day {
            return Verdict::DropMalformed {
                field: format!("{TIME_SPENT_FIELD}.{bad_day}"),
            };
        }
        let Some(cutoff) = self.cutoff else {
            return Verdict::Retain;
        };
        // no observed day counts as stale when a cutoff is active
        match self.max_day_seen {
            Some(max_day) if max_day >= cutoff => Verdict::Retain,
            _ => Verdict::DropStale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(value: &str) -> NaiveDate {
        parse_day(value).expect("test day")
    }

    fn observe_days(filter: &mut InclusionFilter, days: &[&str]) {
        for day_key in days {
            filter.observe(
                &[Segment::key(TIME_SPENT_FIELD)],
                &TokenKind::Key(day_key.to_string()),
            );
        }
    }

    #[test]
    fn retains_everything_without_a_cutoff() {
        let mut filter = InclusionFilter::for_task(None);
        observe_days(&mut filter, &["2025-06-22"]);
        assert_eq!(filter.verdict(), Verdict::Retain);

        let empty = InclusionFilter::for_task(None);
        assert_eq!(empty.verdict(), Verdict::Retain);
    }

    #[test]
    fn cutoff_compares_against_the_maximum_observed_day() {
        let mut filter = InclusionFilter::for_task(Some(day("2025-06-23")));
        observe_days(&mut filter, &["2025-06-21", "2025-06-24", "2025-06-22"]);
        assert_eq!(filter.verdict(), Verdict::Retain);

        let mut stale = InclusionFilter::for_task(Some(day("2025-06-25")));
        observe_days(&mut stale, &["2025-06-21", "2025-06-24"]);
        assert_eq!(stale.verdict(), Verdict::DropStale);
    }

    #[test]
    fn no_observed_day_is_stale_when_filtering() {
        let filter = InclusionFilter::for_task(Some(day("2025-06-23")));
        assert_eq!(filter.verdict(), Verdict::DropStale);
    }

    #[test]
    fn malformed_day_key_fails_only_that_entity() {
        let mut filter = InclusionFilter::for_task(Some(day("2025-01-01")));
        observe_days(&mut filter, &["2025-06-22", "not-a-day"]);
        assert!(matches!(
            filter.verdict(),
            Verdict::DropMalformed { field } if field == "timeSpentOnDay.not-a-day"
        ));
    }

    #[test]
    fn malformed_day_key_drops_even_without_cutoff() {
        let mut filter = InclusionFilter::for_task(None);
        observe_days(&mut filter, &["junk"]);
        assert!(matches!(filter.verdict(), Verdict::DropMalformed { .. }));
    }

    #[test]
    fn unrelated_keys_are_ignored() {
        let mut filter = InclusionFilter::for_task(Some(day("2025-06-23")));
        filter.observe(&[], &TokenKind::Key("title".to_string()));
        filter.observe(
            &[Segment::key("attachments")],
            &TokenKind::Key("whatever".to_string()),
        );
        assert_eq!(filter.verdict(), Verdict::DropStale);
    }

    #[test]
    fn project_filter_always_retains() {
        let filter = InclusionFilter::for_project();
        assert_eq!(filter.verdict(), Verdict::Retain);
    }
}

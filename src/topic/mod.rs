//! Topic names and filters
//!
//! Validation and wildcard matching per the MQTT v3.1.1 topic rules, plus a
//! specificity ranking used to pick one handler when several filters match.

pub mod validation;

use std::cmp::Reverse;

pub use validation::{
    levels, topic_matches_filter, validate_topic_filter, validate_topic_name, Level,
};

/// Ordering key for topic filters; a greater value is more specific.
///
/// Filters without `#` outrank filters with it, then more literal levels win,
/// then fewer `+` levels. An exact filter is therefore always the most
/// specific match for the topic it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    bounded: bool,
    literal_levels: usize,
    single_wildcards: Reverse<usize>,
}

impl Specificity {
    pub fn of(filter: &str) -> Self {
        let mut bounded = true;
        let mut literal_levels = 0;
        let mut single_wildcards = 0;

        for level in levels(filter) {
            match level {
                Level::Literal(_) => literal_levels += 1,
                Level::SingleWildcard => single_wildcards += 1,
                Level::MultiWildcard => bounded = false,
            }
        }

        Self {
            bounded,
            literal_levels,
            single_wildcards: Reverse(single_wildcards),
        }
    }
}

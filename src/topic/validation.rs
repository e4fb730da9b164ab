//! Topic name and filter checks
//!
//! A client publishes to names and subscribes with filters. Both are UTF-8
//! strings of at most 65535 bytes without NUL; only filters may hold `+` or
//! `#`, and each wildcard must fill its whole level.

/// One `/`-separated level of a topic filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level<'a> {
    Literal(&'a str),
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

/// Split a filter into its levels
pub fn levels(filter: &str) -> impl Iterator<Item = Level<'_>> {
    filter.split('/').map(|level| match level {
        "+" => Level::SingleWildcard,
        "#" => Level::MultiWildcard,
        literal => Level::Literal(literal),
    })
}

/// Rules shared by names and filters; `what` names the caller in errors
fn check_encodable(topic: &str, what: Kind) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err(what.pick("topic name is empty", "topic filter is empty"));
    }
    if topic.len() > u16::MAX as usize {
        return Err(what.pick("topic name too long", "topic filter too long"));
    }
    if topic.contains('\0') {
        return Err(what.pick("topic name contains NUL", "topic filter contains NUL"));
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Kind {
    Name,
    Filter,
}

impl Kind {
    fn pick(self, name: &'static str, filter: &'static str) -> &'static str {
        match self {
            Kind::Name => name,
            Kind::Filter => filter,
        }
    }
}

/// Check a topic a message can be published to
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_encodable(topic, Kind::Name)?;
    if topic.contains(['+', '#']) {
        return Err("wildcards are not allowed in a topic name");
    }
    Ok(())
}

/// Check a filter that can be subscribed or unsubscribed
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_encodable(filter, Kind::Filter)?;

    let mut seen_multi = false;
    for level in levels(filter) {
        if seen_multi {
            return Err("'#' must be the last level");
        }
        match level {
            Level::MultiWildcard => seen_multi = true,
            Level::SingleWildcard => {}
            Level::Literal(text) if text.contains(['+', '#']) => {
                return Err("a wildcard must fill its whole level");
            }
            Level::Literal(_) => {}
        }
    }
    Ok(())
}

/// Whether a published `topic` is covered by a subscription `filter`
///
/// Names starting with `$` are never matched by a leading wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut names = topic.split('/');
    for level in levels(filter) {
        match (level, names.next()) {
            // Also matches the parent level itself: "a/#" covers "a"
            (Level::MultiWildcard, _) => return true,
            (Level::SingleWildcard, Some(_)) => {}
            (Level::Literal(expected), Some(name)) if expected == name => {}
            _ => return false,
        }
    }
    names.next().is_none()
}

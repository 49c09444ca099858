use tracing::debug;

/// Rule-based request filter.
///
/// Rules are case-insensitive substrings matched against the request target
/// (path + query). The first matching rule denies the request; an empty rule
/// set allows everything.
#[derive(Debug)]
pub struct RequestFilter {
    rules: Vec<String>,
}

impl RequestFilter {
    pub fn new(patterns: &[String]) -> Self {
        let rules: Vec<String> = patterns
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        debug!("Request filter loaded {} rules", rules.len());
        Self { rules }
    }

    /// Returns the first rule matching the target, if any.
    pub fn matched_rule(&self, target: &str) -> Option<&str> {
        if self.rules.is_empty() {
            return None;
        }

        let target = target.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| target.contains(rule.as_str()))
            .map(String::as_str)
    }

    pub fn allow(&self, target: &str) -> bool {
        self.matched_rule(target).is_none()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> RequestFilter {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        RequestFilter::new(&patterns)
    }

    #[test]
    fn substring_match_denies() {
        let f = filter(&["ads", "trackers"]);
        assert_eq!(f.matched_rule("/ads/banner"), Some("ads"));
        assert!(!f.allow("/ads/banner"));
        assert!(f.allow("/index.html"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let f = filter(&["ADS"]);
        assert!(!f.allow("/static/Ads/pixel.gif"));
    }

    #[test]
    fn first_match_wins() {
        let f = filter(&["trackers", "ads"]);
        assert_eq!(f.matched_rule("/trackers/ads"), Some("trackers"));
    }

    #[test]
    fn empty_rule_set_allows_everything() {
        let f = filter(&[]);
        assert!(f.allow("/anything/at/all"));
        assert_eq!(f.rule_count(), 0);
    }

    #[test]
    fn blank_patterns_are_dropped() {
        let f = filter(&["", "  ", "malware"]);
        assert_eq!(f.rule_count(), 1);
        assert!(f.allow("/clean"));
        assert!(!f.allow("/downloads/malware.exe"));
    }

    #[test]
    fn domain_patterns_match_query_targets() {
        let f = filter(&["tracker.example.com"]);
        assert!(!f.allow("/fetch?url=http://tracker.example.com/p"));
    }
}

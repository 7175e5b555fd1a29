use regex::Regex;

/// Predicate over job names used by the `runone`/`runafter` dependency checks.
pub trait JobMatcher {
    fn matches(&self, job_name: &str) -> bool;
}

impl<F> JobMatcher for F
where
    F: Fn(&str) -> bool,
{
    fn matches(&self, job_name: &str) -> bool {
        self(job_name)
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Literal,
}

/// Regex over job names. A pattern that fails to compile is matched as a
/// plain substring.
#[derive(Debug, Clone)]
pub struct JobPattern {
    source: String,
    matcher: Matcher,
}

impl JobPattern {
    pub fn new(source: &str) -> Self {
        let matcher = match Regex::new(source) {
            Ok(regex) => Matcher::Regex(regex),
            Err(e) => {
                tracing::warn!(pattern = source, error = %e, "Invalid job pattern, matching literally");
                Matcher::Literal
            }
        };
        Self {
            source: source.to_string(),
            matcher,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.matcher, Matcher::Literal)
    }
}

impl JobMatcher for JobPattern {
    fn matches(&self, job_name: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(regex) => regex.is_match(job_name),
            Matcher::Literal => job_name.contains(self.source.as_str()),
        }
    }
}

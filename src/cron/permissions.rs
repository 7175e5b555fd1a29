use regex::Regex;

use crate::cron::entry::JobKind;
use crate::error::Result;
use crate::scheduler::JobDescriptor;

/// Allow/disallow regexes over `"<type>.<job name>"`, e.g. `local.imdb.sync`.
/// Disallow wins over allow; with no allow pattern everything not
/// disallowed passes.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    allow: Option<Regex>,
    disallow: Option<Regex>,
}

impl JobFilter {
    pub fn new(allow: Option<&str>, disallow: Option<&str>) -> Result<Self> {
        Ok(Self {
            allow: allow.map(Regex::new).transpose()?,
            disallow: disallow.map(Regex::new).transpose()?,
        })
    }

    pub fn allows(&self, kind: JobKind, name: &str) -> bool {
        let key = format!("{}.{}", kind, name);
        if self.disallow.as_ref().is_some_and(|rx| rx.is_match(&key)) {
            tracing::debug!(job = %key, "Job disallowed");
            return false;
        }
        if self.allow.as_ref().is_some_and(|rx| !rx.is_match(&key)) {
            tracing::debug!(job = %key, "Job not allowed");
            return false;
        }
        true
    }

    /// Drop entries this host may not run. `None` if nothing is left.
    pub fn filter(&self, kind: JobKind, mut descriptor: JobDescriptor) -> Option<JobDescriptor> {
        descriptor.retain(|name| self.allows(kind, name));
        if descriptor.is_empty() {
            None
        } else {
            Some(descriptor)
        }
    }
}

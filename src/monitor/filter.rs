//! Staged and committed socket filters.
//!
//! Filter changes are staged locally and only take effect on `commit`, which
//! installs a BPF program on the socket and publishes the staged criteria as
//! the committed snapshot. The event pump re-checks every received device
//! against that snapshot, so hash collisions in the kernel filter and
//! kernel-framed datagrams (which the BPF program cannot inspect) are still
//! filtered correctly.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::device::Device;
use crate::error::{ConfigurationError, WatchError, WatchResult};

use super::bpf::FilterProgram;
use super::socket::EventSocket;

/// One filter criterion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCriterion {
    /// Match a subsystem, optionally narrowed to one device type.
    Subsystem {
        subsystem: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        devtype: Option<String>,
    },

    /// Match devices carrying a udev tag.
    Tag(String),
}

impl FilterCriterion {
    fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Subsystem { subsystem, devtype } => {
                check_argument("subsystem", subsystem)?;
                if let Some(devtype) = devtype {
                    check_argument("devtype", devtype)?;
                }
                Ok(())
            }
            Self::Tag(tag) => check_argument("tag", tag),
        }
    }
}

fn check_argument(field: &'static str, value: &str) -> Result<(), ConfigurationError> {
    if value.is_empty() {
        return Err(ConfigurationError::EmptyArgument { field });
    }
    if value.contains('\0') {
        return Err(ConfigurationError::InteriorNul { field });
    }
    Ok(())
}

/// Returns true if `device` passes `criteria`.
///
/// Subsystem criteria and tag criteria form two groups; each non-empty group
/// must have at least one matching entry.
#[must_use]
pub fn matches(criteria: &[FilterCriterion], device: &Device) -> bool {
    let mut any_subsystem = false;
    let mut subsystem_hit = false;
    let mut any_tag = false;
    let mut tag_hit = false;

    for c in criteria {
        match c {
            FilterCriterion::Subsystem { subsystem, devtype } => {
                any_subsystem = true;
                subsystem_hit |= device.subsystem() == Some(subsystem.as_str())
                    && devtype.as_deref().map_or(true, |t| device.devtype() == Some(t));
            }
            FilterCriterion::Tag(tag) => {
                any_tag = true;
                tag_hit |= device.has_tag(tag);
            }
        }
    }

    (!any_subsystem || subsystem_hit) && (!any_tag || tag_hit)
}

/// Read side of the committed snapshot, shared with the event pump.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommittedFilters {
    inner: Arc<RwLock<Arc<[FilterCriterion]>>>,
}

impl CommittedFilters {
    pub(crate) fn snapshot(&self) -> Arc<[FilterCriterion]> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn passes(&self, device: &Device) -> bool {
        matches(&self.snapshot(), device)
    }

    fn publish(&self, criteria: &[FilterCriterion]) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::from(criteria);
    }
}

/// Per-monitor filter state.
#[derive(Debug, Default)]
pub struct FilterSet {
    staged: Vec<FilterCriterion>,
    committed: CommittedFilters,
}

impl FilterSet {
    /// An empty set with nothing staged or committed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a subsystem (and optional device type) criterion.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` for an empty or NUL-containing argument.
    pub fn add_subsystem(&mut self, subsystem: &str, devtype: Option<&str>) -> Result<(), ConfigurationError> {
        self.stage(FilterCriterion::Subsystem {
            subsystem: subsystem.to_string(),
            devtype: devtype.map(str::to_string),
        })
    }

    /// Stage a tag criterion.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` for an empty or NUL-containing tag.
    pub fn add_tag(&mut self, tag: &str) -> Result<(), ConfigurationError> {
        self.stage(FilterCriterion::Tag(tag.to_string()))
    }

    fn stage(&mut self, criterion: FilterCriterion) -> Result<(), ConfigurationError> {
        criterion.validate()?;
        if !self.staged.contains(&criterion) {
            self.staged.push(criterion);
        }
        Ok(())
    }

    /// Stage removal of every criterion.
    pub fn clear(&mut self) {
        self.staged.clear();
    }

    /// Criteria staged for the next commit.
    #[must_use]
    pub fn staged(&self) -> &[FilterCriterion] {
        &self.staged
    }

    /// Snapshot of the committed criteria.
    #[must_use]
    pub fn committed(&self) -> Vec<FilterCriterion> {
        self.committed.snapshot().to_vec()
    }

    pub(crate) fn committed_handle(&self) -> CommittedFilters {
        self.committed.clone()
    }

    /// Install the staged criteria on `socket`.
    ///
    /// On failure nothing is rolled back locally: the staged set stays as it
    /// was and the committed snapshot keeps describing what the kernel has.
    ///
    /// # Errors
    ///
    /// `ConfigurationError::FilterTooLarge` before touching the socket, or
    /// `ConfigurationError::Kernel` if the socket rejects the program.
    pub fn commit(&mut self, socket: &dyn EventSocket) -> WatchResult<()> {
        let program = FilterProgram::compile(&self.staged)?;

        let op = if program.is_some() {
            "attach socket filter"
        } else {
            "detach socket filter"
        };
        socket
            .install_filter(program.as_ref())
            .map_err(|e| WatchError::kernel(op, e))?;

        self.committed.publish(&self.staged);
        tracing::debug!(
            criteria = self.staged.len(),
            instructions = program.as_ref().map_or(0, FilterProgram::len),
            "Committed monitor filter"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::device::UeventBuilder;

    fn device(subsystem: &str, devtype: Option<&str>, tags: &str) -> Device {
        let mut b = UeventBuilder::event("add", "/devices/virtual/x/y", subsystem).property("TAGS", tags);
        if let Some(t) = devtype {
            b = b.property("DEVTYPE", t);
        }
        Device::from_datagram(&b.encode_udev(), Path::new("/sys")).unwrap()
    }

    #[test]
    fn empty_criteria_match_everything() {
        assert!(matches(&[], &device("net", None, "")));
    }

    #[test]
    fn subsystem_and_devtype() {
        let criteria = [FilterCriterion::Subsystem {
            subsystem: "block".to_string(),
            devtype: Some("disk".to_string()),
        }];
        assert!(matches(&criteria, &device("block", Some("disk"), "")));
        assert!(!matches(&criteria, &device("block", Some("partition"), "")));
        assert!(!matches(&criteria, &device("net", None, "")));
    }

    #[test]
    fn groups_are_anded() {
        let criteria = [
            FilterCriterion::Subsystem {
                subsystem: "input".to_string(),
                devtype: None,
            },
            FilterCriterion::Tag("seat".to_string()),
        ];
        assert!(matches(&criteria, &device("input", None, ":seat:")));
        assert!(!matches(&criteria, &device("input", None, ":other:")));
        assert!(!matches(&criteria, &device("sound", None, ":seat:")));
    }

    #[test]
    fn rejects_invalid_arguments() {
        let mut set = FilterSet::new();
        assert!(matches!(
            set.add_subsystem("", None),
            Err(ConfigurationError::EmptyArgument { field: "subsystem" })
        ));
        assert!(matches!(
            set.add_subsystem("block", Some("")),
            Err(ConfigurationError::EmptyArgument { field: "devtype" })
        ));
        assert!(matches!(
            set.add_tag("a\0b"),
            Err(ConfigurationError::InteriorNul { field: "tag" })
        ));
        assert!(set.staged().is_empty());
    }

    #[test]
    fn staging_dedupes_and_does_not_commit() {
        let mut set = FilterSet::new();
        set.add_subsystem("net", None).unwrap();
        set.add_subsystem("net", None).unwrap();
        set.add_tag("systemd").unwrap();

        assert_eq!(set.staged().len(), 2);
        assert!(set.committed().is_empty());

        set.clear();
        assert!(set.staged().is_empty());
    }
}

//! Section-level comparison of snapshots.

use crate::event::ReloadKind;
use crate::snapshot::ConfigSnapshot;

/// Kinds whose sections differ between `previous` and `next`, in
/// [`ReloadKind::ALL`] order.
#[must_use]
pub fn changed_kinds(previous: &ConfigSnapshot, next: &ConfigSnapshot) -> Vec<ReloadKind> {
    ReloadKind::ALL
        .into_iter()
        .filter(|kind| match kind {
            ReloadKind::LdapConfig => previous.directory != next.directory,
            ReloadKind::AppConfig => {
                previous.lockout != next.lockout
                    || previous.runtime != next.runtime
                    || previous.metrics != next.metrics
            }
            ReloadKind::Logger => previous.logging != next.logging,
            ReloadKind::Script => previous.scripts != next.scripts,
            ReloadKind::Cache => previous.cache != next.cache,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use jans_script::{ScriptDescriptor, ScriptSource, ScriptType};

    use super::*;

    #[test]
    fn identical_snapshots_have_no_changes() {
        let a = ConfigSnapshot::default();
        assert!(changed_kinds(&a, &a.clone()).is_empty());
    }

    #[test]
    fn each_section_maps_to_its_kind() {
        let base = ConfigSnapshot::default();

        let mut next = base.clone();
        next.lockout.max_failures = 9;
        next.metrics.report_enabled = !next.metrics.report_enabled;
        assert_eq!(changed_kinds(&base, &next), [ReloadKind::AppConfig]);

        let mut next = base.clone();
        next.logging.level = "debug".to_string();
        next.cache.max_entries = 10;
        assert_eq!(changed_kinds(&base, &next), [ReloadKind::Logger, ReloadKind::Cache]);

        let mut next = base.clone();
        next.scripts.push(ScriptDescriptor::new(
            "basic",
            ScriptType::PersonAuthentication,
            ScriptSource::rhai("fn authenticate(ctx) { true }"),
        ));
        assert_eq!(changed_kinds(&base, &next), [ReloadKind::Script]);
    }
}

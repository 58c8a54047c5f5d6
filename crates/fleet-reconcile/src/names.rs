//! Machine name allocation and eviction ordering.
//!
//! Machine names follow `{cluster-name}-{n}`. Allocation is a pure
//! function of the currently known name set: the next name is
//! `max(n) + 1`, so numbering is monotonically increasing even after
//! deletions leave gaps, and a returned name never collides with an
//! existing one. Names whose suffix does not parse are skipped; they
//! neither participate nor error the call.

/// Numeric suffix of `name` if it has the form `{cluster_name}-{n}`.
fn suffix(cluster_name: &str, name: &str) -> Option<u64> {
    name.strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// The next collision-free machine name for a cluster.
///
/// Deterministic and side-effect free; callable concurrently as long as
/// the caller holds a fresh name set for the cluster.
pub fn next_machine_name(cluster_name: &str, existing: &[String]) -> String {
    let max_n = existing
        .iter()
        .filter_map(|name| suffix(cluster_name, name))
        .max()
        .unwrap_or(0);
    format!("{cluster_name}-{}", max_n + 1)
}

/// Order machines for removal on scale-down.
///
/// A hinted machine (if still present) goes first; the rest follow
/// newest-first (highest suffix first), keeping low-numbered "stable"
/// machines around longest. Names without a parseable suffix are evicted
/// last.
pub fn eviction_order(
    cluster_name: &str,
    existing: &[String],
    hint: Option<&str>,
) -> Vec<String> {
    let hinted = hint.filter(|h| existing.iter().any(|name| name == h));

    let mut rest: Vec<&String> = existing
        .iter()
        .filter(|name| Some(name.as_str()) != hinted)
        .collect();
    // Descending by suffix; None sorts below Some, landing last.
    rest.sort_by(|a, b| suffix(cluster_name, b).cmp(&suffix(cluster_name, a)));

    hinted
        .map(str::to_string)
        .into_iter()
        .chain(rest.into_iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_set_starts_at_one() {
        assert_eq!(next_machine_name("test", &[]), "test-1");
    }

    #[test]
    fn zero_suffix_yields_one() {
        assert_eq!(next_machine_name("test", &names(&["test-0"])), "test-1");
    }

    #[test]
    fn gaps_are_not_reused() {
        assert_eq!(
            next_machine_name("test", &names(&["test-1", "test-3"])),
            "test-4"
        );
    }

    #[test]
    fn unparseable_names_are_skipped() {
        assert_eq!(
            next_machine_name("test", &names(&["test-abc", "other-5", "test"])),
            "test-1"
        );
        assert_eq!(
            next_machine_name("test", &names(&["test-2", "test-x", "testy-9"])),
            "test-3"
        );
    }

    #[test]
    fn returned_name_never_in_input() {
        let existing = names(&["web-1", "web-2", "web-3", "web-10"]);
        let next = next_machine_name("web", &existing);
        assert!(!existing.contains(&next));
        assert_eq!(next, "web-11");
    }

    #[test]
    fn eviction_is_newest_first() {
        let order = eviction_order("web", &names(&["web-1", "web-3", "web-2"]), None);
        assert_eq!(order, names(&["web-3", "web-2", "web-1"]));
    }

    #[test]
    fn eviction_hint_goes_first() {
        let order = eviction_order(
            "web",
            &names(&["web-1", "web-2", "web-3"]),
            Some("web-1"),
        );
        assert_eq!(order, names(&["web-1", "web-3", "web-2"]));
    }

    #[test]
    fn eviction_ignores_stale_hint() {
        let order = eviction_order(
            "web",
            &names(&["web-1", "web-2"]),
            Some("web-9"),
        );
        assert_eq!(order, names(&["web-2", "web-1"]));
    }

    #[test]
    fn eviction_puts_unparseable_names_last() {
        let order = eviction_order("web", &names(&["web-x", "web-2", "web-5"]), None);
        assert_eq!(order, names(&["web-5", "web-2", "web-x"]));
    }
}

//! Initial role determination for a proxy.

use rucket_core::meta::ClusterMap;
use rucket_core::NodeDescriptor;
use tracing::{info, warn};

use crate::error::{BootstrapError, Result};

/// Outcome of [`determine_role`].
#[derive(Debug, Clone)]
pub struct RoleDecision {
    /// The primary this node should use, if one is known.
    pub primary_id: Option<String>,
    /// Whether this node starts as the forming primary.
    pub is_primary: bool,
    /// Whether `primary_id` comes from an accepted primary-ID override.
    pub forced: bool,
    /// The loaded map, possibly rewritten (primary override, self re-inserted).
    pub loaded: Option<ClusterMap>,
}

/// Decides whether a starting proxy is the primary.
///
/// `loaded` is the locally persisted map if it was read successfully;
/// `primary_id` and `is_primary` are the operator overrides. Rules, in order:
///
/// 1. Both overrides set, naming a node other than self: fatal.
/// 2. A primary-ID override that the loaded map knows as a proxy rewrites
///    the map's primary. An ID the map does not know is ignored.
/// 3. Without a loaded map, the node is primary iff the override names it, or
///    no ID override is given and `is_primary` is set.
/// 4. With a loaded map, the node is primary iff the map names it.
///
/// # Errors
///
/// Returns [`BootstrapError::ConflictingOverrides`] for rule 1.
pub fn determine_role(
    si: &NodeDescriptor,
    loaded: Option<ClusterMap>,
    primary_id: Option<&str>,
    is_primary: bool,
) -> Result<RoleDecision> {
    let primary_id = primary_id.filter(|id| !id.is_empty());

    if let Some(pid) = primary_id {
        if is_primary && pid != si.id() {
            return Err(BootstrapError::ConflictingOverrides {
                primary_id: pid.to_string(),
                self_id: si.id().to_string(),
            });
        }
    }

    let Some(mut map) = loaded else {
        let is_primary = match primary_id {
            Some(pid) => pid == si.id(),
            None => is_primary,
        };
        return Ok(RoleDecision {
            primary_id: primary_id.map(str::to_string),
            is_primary,
            forced: primary_id.is_some(),
            loaded: None,
        });
    };

    // Re-insert self before resolving the override: its URLs may have changed
    // since the map was persisted.
    map.add_node(si.clone());

    let mut forced = false;
    if let Some(pid) = primary_id {
        match map.get_proxy(pid).cloned() {
            Some(primary) => {
                info!(%map, primary = %pid, "Primary override found in loaded cluster map");
                map.primary = Some(primary);
                forced = true;
            }
            None => {
                warn!(%map, primary = %pid, "Ignoring primary override not found in loaded cluster map");
            }
        }
    }

    let resolved = map.primary_id().map(str::to_string);
    let is_primary = map.is_primary(si.id());
    Ok(RoleDecision { primary_id: resolved, is_primary, forced, loaded: Some(map) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(id: &str) -> NodeDescriptor {
        NodeDescriptor::proxy(id, format!("http://{id}:9080"), format!("http://{id}:8080"))
    }

    fn loaded_map(primary: &str, others: &[&str]) -> ClusterMap {
        let mut map = ClusterMap::with_primary(proxy(primary));
        for id in others {
            map.add_node(proxy(id));
        }
        map.version = 5;
        map
    }

    #[test]
    fn test_conflicting_overrides_fatal() {
        let err = determine_role(&proxy("p1"), None, Some("p2"), true).unwrap_err();
        assert!(matches!(err, BootstrapError::ConflictingOverrides { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_both_overrides_naming_self() {
        let decision = determine_role(&proxy("p1"), None, Some("p1"), true).unwrap();
        assert!(decision.is_primary);
        assert_eq!(decision.primary_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_no_loaded_map() {
        let si = proxy("p1");
        assert!(determine_role(&si, None, None, true).unwrap().is_primary);
        assert!(!determine_role(&si, None, None, false).unwrap().is_primary);
        assert!(!determine_role(&si, None, Some("p2"), false).unwrap().is_primary);
        assert!(determine_role(&si, None, Some(""), true).unwrap().is_primary);
    }

    #[test]
    fn test_loaded_map_decides() {
        let si = proxy("p2");
        let decision = determine_role(&si, Some(loaded_map("p1", &["p2"])), None, true).unwrap();
        assert!(!decision.is_primary);
        assert_eq!(decision.primary_id.as_deref(), Some("p1"));

        let decision = determine_role(&si, Some(loaded_map("p2", &["p1"])), None, false).unwrap();
        assert!(decision.is_primary);
    }

    #[test]
    fn test_override_rewrites_loaded_primary() {
        let si = proxy("p2");
        let decision =
            determine_role(&si, Some(loaded_map("p1", &["p2"])), Some("p2"), false).unwrap();
        assert!(decision.is_primary);
        assert!(decision.loaded.unwrap().is_primary("p2"));
    }

    #[test]
    fn test_override_unknown_to_loaded_map() {
        let si = proxy("p2");
        let decision =
            determine_role(&si, Some(loaded_map("p1", &["p2"])), Some("p9"), false).unwrap();
        assert!(!decision.is_primary);
        assert_eq!(decision.primary_id.as_deref(), Some("p1"));
        assert!(decision.loaded.unwrap().is_primary("p1"));

        let decision =
            determine_role(&proxy("p1"), Some(loaded_map("p1", &["p2"])), Some("p9"), false)
                .unwrap();
        assert!(decision.is_primary);
    }

    #[test]
    fn test_override_naming_self_missing_from_loaded_map() {
        let si = proxy("p3");
        let decision =
            determine_role(&si, Some(loaded_map("p1", &["p2"])), Some("p3"), false).unwrap();
        assert!(decision.is_primary);
        assert!(decision.forced);
        assert_eq!(decision.primary_id.as_deref(), Some("p3"));
        let map = decision.loaded.unwrap();
        assert!(map.is_primary("p3"));
        assert!(map.get_proxy("p3").is_some());
    }

    #[test]
    fn test_self_reinserted_with_new_urls() {
        let si = NodeDescriptor::proxy("p1", "http://new:9080", "http://new:8080");
        let decision = determine_role(&si, Some(loaded_map("p1", &[])), None, false).unwrap();
        let map = decision.loaded.unwrap();
        assert_eq!(map.get_proxy("p1").unwrap().control_url(), "http://new:9080");
        assert_eq!(map.primary.unwrap().control_url(), "http://new:9080");
    }

    #[test]
    fn test_deterministic() {
        let si = proxy("p1");
        let a = determine_role(&si, Some(loaded_map("p1", &["p2"])), Some("p2"), false).unwrap();
        let b = determine_role(&si, Some(loaded_map("p1", &["p2"])), Some("p2"), false).unwrap();
        assert_eq!(a.is_primary, b.is_primary);
        assert_eq!(a.primary_id, b.primary_id);
    }
}

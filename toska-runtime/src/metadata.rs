//! Attributes advertised to the registry alongside an instance.

use crate::options::RoutingAttributes;
use std::collections::HashMap;

pub const SCHEME_KEY: &str = "scheme";
pub const HEALTH_CHECK_ENDPOINT_KEY: &str = "health_check_endpoint";
pub const LB_STRATEGY_KEY: &str = "lb_strategy";
pub const WEIGHT_KEY: &str = "weight";

/// Keys the runtime always computes itself.
pub const RESERVED_KEYS: [&str; 4] = [
    SCHEME_KEY,
    HEALTH_CHECK_ENDPOINT_KEY,
    LB_STRATEGY_KEY,
    WEIGHT_KEY,
];

/// Merge user metadata with the routing attributes.
///
/// Reserved keys overwrite user entries of the same name; `weight` is only
/// emitted when it is positive.
///
/// A user-supplied `weight` entry is dropped too when the routing weight is
/// zero or negative, so the registry never sees a weight that routing did not
/// compute. Older SDKs passed such a user entry through unchanged.
pub fn build_metadata(
    user: &HashMap<String, String>,
    routing: &RoutingAttributes,
) -> HashMap<String, String> {
    let mut metadata = HashMap::with_capacity(user.len() + RESERVED_KEYS.len());
    metadata.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));

    metadata.insert(SCHEME_KEY.to_string(), routing.scheme.as_str().to_string());
    metadata.insert(
        HEALTH_CHECK_ENDPOINT_KEY.to_string(),
        routing.health_check_path.clone(),
    );
    metadata.insert(LB_STRATEGY_KEY.to_string(), routing.strategy.as_str().to_string());

    if routing.weight > 0 {
        metadata.insert(WEIGHT_KEY.to_string(), routing.weight.to_string());
    } else {
        metadata.remove(WEIGHT_KEY);
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{LoadBalancingStrategy, Scheme};

    fn routing(weight: i32) -> RoutingAttributes {
        RoutingAttributes {
            scheme: Scheme::Https,
            strategy: LoadBalancingStrategy::WeightedRoundRobin,
            weight,
            health_check_path: "/healthz".to_string(),
        }
    }

    #[test]
    fn test_reserved_keys_present() {
        let metadata = build_metadata(&HashMap::new(), &routing(3));

        assert_eq!(metadata.len(), 4);
        assert_eq!(metadata[SCHEME_KEY], "https");
        assert_eq!(metadata[HEALTH_CHECK_ENDPOINT_KEY], "/healthz");
        assert_eq!(metadata[LB_STRATEGY_KEY], "WeightedRoundRobin");
        assert_eq!(metadata[WEIGHT_KEY], "3");
    }

    #[test]
    fn test_user_entries_are_copied() {
        let user = HashMap::from([
            ("env".to_string(), "prod".to_string()),
            ("version".to_string(), "1.0.0".to_string()),
        ]);
        let metadata = build_metadata(&user, &routing(1));

        assert_eq!(metadata["env"], "prod");
        assert_eq!(metadata["version"], "1.0.0");
        assert_eq!(metadata.len(), 6);
    }

    #[test]
    fn test_reserved_keys_override_user_keys() {
        let user = HashMap::from([
            (SCHEME_KEY.to_string(), "ftp".to_string()),
            (LB_STRATEGY_KEY.to_string(), "Sticky".to_string()),
            (HEALTH_CHECK_ENDPOINT_KEY.to_string(), "/nope".to_string()),
            (WEIGHT_KEY.to_string(), "100".to_string()),
        ]);
        let metadata = build_metadata(&user, &routing(2));

        assert_eq!(metadata[SCHEME_KEY], "https");
        assert_eq!(metadata[LB_STRATEGY_KEY], "WeightedRoundRobin");
        assert_eq!(metadata[HEALTH_CHECK_ENDPOINT_KEY], "/healthz");
        assert_eq!(metadata[WEIGHT_KEY], "2");
    }

    #[test]
    fn test_non_positive_weight_is_omitted() {
        for weight in [0, -1, i32::MIN] {
            let user = HashMap::from([(WEIGHT_KEY.to_string(), "5".to_string())]);
            let metadata = build_metadata(&user, &routing(weight));

            assert!(!metadata.contains_key(WEIGHT_KEY), "weight {weight} leaked");
            assert_eq!(metadata.len(), 3);
        }
    }
}

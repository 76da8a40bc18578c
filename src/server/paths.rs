//! Structural path recovery
//!
//! The engine reports values, not where in the subject resource they came
//! from, while the lab UI wants a `Patient.name[0].given[1]` style path to
//! highlight. We recover paths by searching the resource JSON for a
//! structurally equal value. The matcher remembers every path it has handed
//! out, so duplicate values resolve to successive occurrences instead of the
//! same one twice.

use crate::server::models::PathSegment;
use serde_json::Value as JsonValue;

#[derive(Default)]
pub struct PathMatcher {
    claimed: Vec<Vec<PathSegment>>,
}

impl PathMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locate `target` inside `haystack`, skipping paths already handed out.
    /// A hit is recorded before it is returned.
    pub fn claim(&mut self, haystack: &JsonValue, target: &JsonValue) -> Option<Vec<PathSegment>> {
        let mut trail = Vec::new();
        let hit = self.search(haystack, target, &mut trail)?;
        self.claimed.push(hit.clone());
        Some(hit)
    }

    fn search(
        &self,
        node: &JsonValue,
        target: &JsonValue,
        trail: &mut Vec<PathSegment>,
    ) -> Option<Vec<PathSegment>> {
        if node == target && !self.claimed.contains(trail) {
            return Some(trail.clone());
        }

        match node {
            JsonValue::Object(map) => {
                for (key, child) in map {
                    trail.push(PathSegment::Property(key.clone()));
                    let hit = self.search(child, target, trail);
                    trail.pop();
                    if hit.is_some() {
                        return hit;
                    }
                }
                None
            }
            JsonValue::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    trail.push(PathSegment::Index(index));
                    let hit = self.search(child, target, trail);
                    trail.pop();
                    if hit.is_some() {
                        return hit;
                    }
                }
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::models::path_segments_to_string;
    use serde_json::json;

    #[test]
    fn repeated_values_claim_successive_occurrences() {
        let resource = json!({
            "resourceType": "Patient",
            "name": [
                { "given": ["Jim", "Jim"] }
            ]
        });
        let target = json!("Jim");

        let mut matcher = PathMatcher::new();
        let first = matcher.claim(&resource, &target).expect("first hit");
        assert_eq!(
            path_segments_to_string("Patient", &first),
            "Patient.name[0].given[0]"
        );

        let second = matcher.claim(&resource, &target).expect("second hit");
        assert_eq!(
            path_segments_to_string("Patient", &second),
            "Patient.name[0].given[1]"
        );

        assert!(matcher.claim(&resource, &target).is_none());
    }

    #[test]
    fn root_equality_yields_an_empty_path() {
        let resource = json!({ "resourceType": "Patient" });
        let mut matcher = PathMatcher::new();
        let hit = matcher.claim(&resource, &resource.clone()).expect("root hit");
        assert!(hit.is_empty());
    }
}

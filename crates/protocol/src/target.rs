//! Addressing: decides whether a task applies to a given worker.

use std::collections::HashSet;

use crate::FLEET_GROUP;

/// Pure matcher over a worker's identity.
///
/// Patterns: `agent:<id>` exact, broadcast tokens (`agent:all`, `fleet:all`,
/// `*`), `role:<name>`, `group:<name>`. Anything else fails closed.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    agent_id: String,
    roles: HashSet<String>,
    groups: HashSet<String>,
}

impl TargetMatcher {
    pub fn new<I, J>(agent_id: &str, roles: I, groups: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        let mut groups: HashSet<String> = groups.into_iter().collect();
        // Every worker belongs to the fleet-wide default group.
        groups.insert(FLEET_GROUP.to_string());

        Self {
            agent_id: agent_id.to_string(),
            roles: roles.into_iter().collect(),
            groups,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn matches(&self, target: &str) -> bool {
        if target.is_empty() {
            return false;
        }

        if let Some(id) = target.strip_prefix("agent:") {
            return id == self.agent_id || id == "all";
        }

        if target == "fleet:all" || target == "*" {
            return true;
        }

        if let Some(role) = target.strip_prefix("role:") {
            return self.roles.contains(role);
        }

        if let Some(group) = target.strip_prefix("group:") {
            return self.groups.contains(group);
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> TargetMatcher {
        TargetMatcher::new(
            "worker-1",
            vec!["seller".to_string()],
            vec!["extractors".to_string()],
        )
    }

    #[test]
    fn exact_agent_match() {
        let m = matcher();
        assert!(m.matches("agent:worker-1"));
        assert!(!m.matches("agent:worker-2"));
    }

    #[test]
    fn broadcast_tokens() {
        let m = matcher();
        assert!(m.matches("agent:all"));
        assert!(m.matches("fleet:all"));
        assert!(m.matches("*"));
    }

    #[test]
    fn role_scoped() {
        let m = matcher();
        assert!(m.matches("role:seller"));
        assert!(!m.matches("role:buyer"));
    }

    #[test]
    fn group_scoped_includes_default() {
        let m = matcher();
        assert!(m.matches("group:extractors"));
        assert!(m.matches("group:fleet"));
        assert!(!m.matches("group:other"));
    }

    #[test]
    fn fails_closed() {
        let m = matcher();
        assert!(!m.matches(""));
        assert!(!m.matches("worker-1"));
        assert!(!m.matches("everything"));
        assert!(!m.matches("role:"));
    }
}

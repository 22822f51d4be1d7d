use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use cv_core::types::{GroupMember, MemberStatus};

/// The locally held view of group members.
///
/// Lock discipline: one reader/writer lock, held only for the map operation
/// itself and never across an `.await`. Readers get copies, so callers can
/// never mutate the roster behind the membership manager's back.
#[derive(Debug, Default)]
pub struct Roster {
    members: RwLock<BTreeMap<String, GroupMember>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, GroupMember>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, GroupMember>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or refresh a member. Returns `true` if it was not known.
    pub(crate) fn upsert(&self, member: GroupMember) -> bool {
        self.write()
            .insert(member.agent_id.clone(), member)
            .is_none()
    }

    pub(crate) fn remove(&self, agent_id: &str) -> Option<GroupMember> {
        self.write().remove(agent_id)
    }

    pub(crate) fn clear(&self) {
        self.write().clear();
    }

    /// Flip `active` members last seen before `cutoff` to `stale`.
    pub(crate) fn mark_stale_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut flipped = Vec::new();
        for member in self.write().values_mut() {
            if member.status == MemberStatus::Active && member.last_seen < cutoff {
                member.status = MemberStatus::Stale;
                flipped.push(member.agent_id.clone());
            }
        }
        flipped
    }

    pub fn get(&self, agent_id: &str) -> Option<GroupMember> {
        self.read().get(agent_id).cloned()
    }

    /// All members ordered by agent id.
    pub fn snapshot(&self) -> Vec<GroupMember> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cv_core::types::AgentIdentity;

    fn member(id: &str, seen: DateTime<Utc>) -> GroupMember {
        GroupMember::from_identity(&AgentIdentity::new(id, id.to_uppercase()), seen)
    }

    #[test]
    fn upsert_reports_new_members_only() {
        let roster = Roster::new();
        assert!(roster.upsert(member("b1", Utc::now())));
        assert!(!roster.upsert(member("b1", Utc::now())));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let roster = Roster::new();
        roster.upsert(member("b1", Utc::now()));
        let mut view = roster.snapshot();
        view[0].agent_name = "changed".into();
        assert_eq!(roster.get("b1").unwrap().agent_name, "B1");
    }

    #[test]
    fn stale_marking_keeps_entries() {
        let roster = Roster::new();
        roster.upsert(member("old", Utc::now() - Duration::minutes(5)));
        roster.upsert(member("new", Utc::now()));
        let flipped = roster.mark_stale_before(Utc::now() - Duration::minutes(1));
        assert_eq!(flipped, vec!["old".to_string()]);
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.get("old").unwrap().status, MemberStatus::Stale);
        assert!(roster.mark_stale_before(Utc::now()).contains(&"new".to_string()));
    }
}

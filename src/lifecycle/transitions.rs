// Fixed transition graph for task status, filtered by role

use super::model::{Role, TaskStatus};

impl TaskStatus {
    /// States reachable from `self` in one step, regardless of who asks
    pub fn allowed_next(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[InProgress, Cancelled],
            InProgress => &[SubmittedForReview, Pending, Cancelled],
            SubmittedForReview => &[Completed, NeedsRevision, InProgress, Cancelled],
            NeedsRevision => &[InProgress, SubmittedForReview, Cancelled],
            Completed => &[],
            Cancelled => &[Pending],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }
}

impl Role {
    /// Target states this role may request at all
    pub fn requestable(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        if self.is_privileged() {
            &TaskStatus::ALL
        } else {
            &[Pending, InProgress, SubmittedForReview, Cancelled]
        }
    }
}

/// `to ∈ allowed(from) ∩ requestable(role)`
pub fn can_transition(from: TaskStatus, to: TaskStatus, role: Role) -> bool {
    from.allowed_next().contains(&to) && role.requestable().contains(&to)
}

/// The role-filtered successors of `from`
pub fn allowed_transitions(from: TaskStatus, role: Role) -> Vec<TaskStatus> {
    from.allowed_next()
        .iter()
        .copied()
        .filter(|to| role.requestable().contains(to))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = TaskStatus> {
        prop::sample::select(TaskStatus::ALL.to_vec())
    }

    fn role_strategy() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    #[test]
    fn test_members_cannot_approve_or_send_back() {
        assert!(!can_transition(TaskStatus::SubmittedForReview, TaskStatus::Completed, Role::Member));
        assert!(!can_transition(TaskStatus::SubmittedForReview, TaskStatus::NeedsRevision, Role::Member));
        assert!(can_transition(TaskStatus::SubmittedForReview, TaskStatus::Completed, Role::Manager));
        assert!(can_transition(TaskStatus::InProgress, TaskStatus::SubmittedForReview, Role::Member));
    }

    #[test]
    fn test_completed_is_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        for role in Role::ALL {
            assert!(allowed_transitions(TaskStatus::Completed, role).is_empty());
        }
    }

    proptest! {
        #[test]
        fn prop_no_self_loops(from in status_strategy(), role in role_strategy()) {
            prop_assert!(!can_transition(from, from, role));
        }

        #[test]
        fn prop_role_filter_only_narrows(from in status_strategy(), to in status_strategy(), role in role_strategy()) {
            if can_transition(from, to, role) {
                prop_assert!(from.allowed_next().contains(&to));
                prop_assert!(can_transition(from, to, Role::Admin));
            }
        }

        #[test]
        fn prop_allowed_transitions_agree_with_check(from in status_strategy(), role in role_strategy()) {
            for to in TaskStatus::ALL {
                prop_assert_eq!(allowed_transitions(from, role).contains(&to), can_transition(from, to, role));
            }
        }
    }
}

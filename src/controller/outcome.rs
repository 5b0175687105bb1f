//! Requeue signals shared by components, stages and the control loop

use std::time::Duration;

use kube::runtime::controller::Action;

/// Result of a unit of work that may still be in flight
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do this cycle
    #[default]
    Done,
    /// Work is in flight; check again after the delay
    RequeueAfter(Duration),
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done)
    }

    /// Combine two outcomes; the shortest requeue wins
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Done, other) => other,
            (this, Outcome::Done) => this,
            (Outcome::RequeueAfter(a), Outcome::RequeueAfter(b)) => Outcome::RequeueAfter(a.min(b)),
        }
    }

    pub fn into_action(self) -> Action {
        match self {
            Outcome::Done => Action::await_change(),
            Outcome::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_shortest_requeue() {
        let merged = Outcome::Done
            .merge(Outcome::RequeueAfter(Duration::from_secs(5)))
            .merge(Outcome::Done)
            .merge(Outcome::RequeueAfter(Duration::from_secs(3)));
        assert_eq!(merged, Outcome::RequeueAfter(Duration::from_secs(3)));
    }

    #[test]
    fn test_merge_of_done_is_done() {
        assert!(Outcome::Done.merge(Outcome::Done).is_done());
    }
}

use super::types::State;

/// Lease extensions keep a task in its current in-flight state, so
/// `Claimed -> Claimed` and `Running -> Running` are allowed. The only way
/// back to `Pending` is a lease-expiry requeue.
pub fn valid_state_transition(src: &State, dst: &State) -> bool {
    match src {
        State::Pending => matches!(dst, State::Claimed),
        State::Claimed => matches!(
            dst,
            State::Claimed | State::Running | State::Pending | State::Failed
        ),
        State::Running => matches!(
            dst,
            State::Running | State::Done | State::Failed | State::Pending
        ),
        State::Done | State::Failed => false,
    }
}

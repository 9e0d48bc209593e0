use std::collections::VecDeque;

/// Result of asking the gate whether a request may go out.
#[derive(Debug, PartialEq, Eq)]
pub enum Ticket<W> {
    /// Send now, tagged with the current refresh generation.
    Send { generation: u64, waiter: W },
    /// A refresh is running; the waiter was parked at the back of the queue.
    Queued,
}

/// Result of reporting a 401 to the gate.
#[derive(Debug, PartialEq, Eq)]
pub enum Unauthorized<W> {
    /// First 401 of this generation: the caller runs the refresh, then
    /// replays its own request followed by everything `settle` returns.
    Lead(W),
    /// A refresh already completed after this request was sent; resend it.
    Retry(W),
    /// Parked until the running refresh settles.
    Queued,
}

#[derive(Debug)]
enum GateState<W> {
    Idle,
    Refreshing { queue: VecDeque<W> },
}

/// Single-flight token refresh with a FIFO queue of parked requests.
///
/// `W` is whatever the caller needs to resume a parked request, typically a
/// request description plus a channel for its result.
#[derive(Debug)]
pub struct RefreshGate<W> {
    state: GateState<W>,
    generation: u64,
}

impl<W> Default for RefreshGate<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> RefreshGate<W> {
    pub fn new() -> Self {
        Self {
            state: GateState::Idle,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.state, GateState::Refreshing { .. })
    }

    pub fn queued_len(&self) -> usize {
        match &self.state {
            GateState::Idle => 0,
            GateState::Refreshing { queue } => queue.len(),
        }
    }

    pub fn admit(&mut self, waiter: W) -> Ticket<W> {
        match &mut self.state {
            GateState::Idle => Ticket::Send {
                generation: self.generation,
                waiter,
            },
            GateState::Refreshing { queue } => {
                queue.push_back(waiter);
                Ticket::Queued
            }
        }
    }

    pub fn on_unauthorized(&mut self, sent_generation: u64, waiter: W) -> Unauthorized<W> {
        match &mut self.state {
            GateState::Refreshing { queue } => {
                queue.push_back(waiter);
                Unauthorized::Queued
            }
            GateState::Idle if sent_generation < self.generation => Unauthorized::Retry(waiter),
            GateState::Idle => {
                self.state = GateState::Refreshing {
                    queue: VecDeque::new(),
                };
                Unauthorized::Lead(waiter)
            }
        }
    }

    /// Ends the running refresh and hands back the parked waiters in arrival
    /// order. A successful refresh opens a new generation.
    pub fn settle(&mut self, succeeded: bool) -> VecDeque<W> {
        let previous = std::mem::replace(&mut self.state, GateState::Idle);
        if succeeded {
            self.generation += 1;
        }
        match previous {
            GateState::Idle => VecDeque::new(),
            GateState::Refreshing { queue } => queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_gate_lets_requests_through() {
        let mut gate = RefreshGate::new();
        assert_eq!(
            gate.admit("a"),
            Ticket::Send {
                generation: 0,
                waiter: "a"
            }
        );
        assert!(!gate.is_refreshing());
    }

    #[test]
    fn first_unauthorized_leads_and_the_rest_queue_in_order() {
        let mut gate = RefreshGate::new();
        assert_eq!(gate.on_unauthorized(0, 1), Unauthorized::Lead(1));
        assert!(gate.is_refreshing());

        assert_eq!(gate.on_unauthorized(0, 2), Unauthorized::Queued);
        assert_eq!(gate.admit(3), Ticket::Queued);
        assert_eq!(gate.admit(4), Ticket::Queued);
        assert_eq!(gate.on_unauthorized(0, 5), Unauthorized::Queued);
        assert_eq!(gate.queued_len(), 4);

        let replay: Vec<_> = gate.settle(true).into_iter().collect();
        assert_eq!(replay, vec![2, 3, 4, 5]);
        assert_eq!(gate.generation(), 1);
        assert!(!gate.is_refreshing());
    }

    #[test]
    fn stale_unauthorized_retries_without_refresh() {
        let mut gate = RefreshGate::new();
        gate.on_unauthorized(0, "lead");
        gate.settle(true);

        assert_eq!(gate.on_unauthorized(0, "late"), Unauthorized::Retry("late"));
        assert!(!gate.is_refreshing());
        assert_eq!(gate.on_unauthorized(1, "fresh"), Unauthorized::Lead("fresh"));
    }

    #[test]
    fn failed_refresh_keeps_generation_and_drains_queue() {
        let mut gate = RefreshGate::new();
        gate.on_unauthorized(0, 'a');
        gate.admit('b');
        let drained = gate.settle(false);
        assert_eq!(drained, VecDeque::from(vec!['b']));
        assert_eq!(gate.generation(), 0);
        assert_eq!(gate.queued_len(), 0);
    }
}

use std::collections::VecDeque;

use bytes::Bytes;

use super::StateMachine;

/// Lifecycle of a single topic subscription as seen by its receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Subscribing,
    Subscribed,
    Receiving,
    Closed,
}

pub enum SubscriptionInput {
    /// The subscribe command was written to the connection.
    SubscribeIssued,
    /// The broker confirmed a subscribe or unsubscribe; `count` is the resulting topic count.
    Acknowledged { count: usize },
    /// A payload published on the topic.
    Message(Bytes),
    /// Reply to a liveness ping.
    Pong,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubscriptionOutput {
    /// The subscription is live. Emitted at most once.
    Subscribed,
    /// Hand a payload to the consumer.
    Deliver(Bytes),
    /// The broker confirmed the unsubscribe; the receive loop must stop.
    Finished,
}

/// Pure core of a subscription's receive loop.
///
/// The broker reports subscriber-count transitions rather than explicit "subscribed" and
/// "unsubscribed" replies: a count reaching one means the topic is live and a count back at zero
/// means the unsubscribe went through.
#[derive(Debug)]
pub struct SubscriptionMachine {
    state: SubscriptionState,
    signalled: bool,
    pending: VecDeque<SubscriptionOutput>,
}

impl SubscriptionMachine {
    pub fn new() -> Self {
        Self {
            state: SubscriptionState::Created,
            signalled: false,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SubscriptionState::Closed
    }

    fn subscribe_issued(&mut self) {
        if self.state == SubscriptionState::Created {
            self.state = SubscriptionState::Subscribing;
        }
    }

    fn acknowledged(&mut self, count: usize) {
        match (self.state, count) {
            (SubscriptionState::Closed, _) => {}
            (_, 0) => {
                self.state = SubscriptionState::Closed;
                self.pending.push_back(SubscriptionOutput::Finished);
            }
            (SubscriptionState::Created | SubscriptionState::Subscribing, _) => {
                self.state = SubscriptionState::Subscribed;
                if !self.signalled {
                    self.signalled = true;
                    self.pending.push_back(SubscriptionOutput::Subscribed);
                }
            }
            _ => {}
        }
    }

    fn message(&mut self, payload: Bytes) {
        match self.state {
            SubscriptionState::Subscribed | SubscriptionState::Receiving => {
                self.state = SubscriptionState::Receiving;
                self.pending.push_back(SubscriptionOutput::Deliver(payload));
            }
            // Nothing can legitimately arrive before the acknowledgement or after the close
            _ => {}
        }
    }
}

impl Default for SubscriptionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for SubscriptionMachine {
    type Input = SubscriptionInput;
    type Output = SubscriptionOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            SubscriptionInput::SubscribeIssued => self.subscribe_issued(),
            SubscriptionInput::Acknowledged { count } => self.acknowledged(count),
            SubscriptionInput::Message(payload) => self.message(payload),
            SubscriptionInput::Pong => {}
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(machine: &mut SubscriptionMachine) -> Vec<SubscriptionOutput> {
        std::iter::from_fn(|| machine.poll_output()).collect()
    }

    #[test]
    fn test_full_lifecycle() {
        let mut machine = SubscriptionMachine::new();
        assert_eq!(machine.state(), SubscriptionState::Created);

        machine.process_input(SubscriptionInput::SubscribeIssued);
        assert_eq!(machine.state(), SubscriptionState::Subscribing);
        assert!(drain(&mut machine).is_empty());

        machine.process_input(SubscriptionInput::Acknowledged { count: 1 });
        assert_eq!(machine.state(), SubscriptionState::Subscribed);
        assert_eq!(drain(&mut machine), vec![SubscriptionOutput::Subscribed]);

        machine.process_input(SubscriptionInput::Message(Bytes::from_static(b"a")));
        machine.process_input(SubscriptionInput::Pong);
        machine.process_input(SubscriptionInput::Message(Bytes::from_static(b"b")));
        assert_eq!(machine.state(), SubscriptionState::Receiving);
        assert_eq!(
            drain(&mut machine),
            vec![
                SubscriptionOutput::Deliver(Bytes::from_static(b"a")),
                SubscriptionOutput::Deliver(Bytes::from_static(b"b")),
            ]
        );

        machine.process_input(SubscriptionInput::Acknowledged { count: 0 });
        assert!(machine.is_closed());
        assert_eq!(drain(&mut machine), vec![SubscriptionOutput::Finished]);
    }

    #[test]
    fn test_subscribed_signal_fires_once() {
        let mut machine = SubscriptionMachine::new();
        machine.process_input(SubscriptionInput::SubscribeIssued);
        machine.process_input(SubscriptionInput::Acknowledged { count: 1 });
        machine.process_input(SubscriptionInput::Acknowledged { count: 1 });

        assert_eq!(drain(&mut machine), vec![SubscriptionOutput::Subscribed]);
    }

    #[test]
    fn test_message_before_acknowledgement_ignored() {
        let mut machine = SubscriptionMachine::new();
        machine.process_input(SubscriptionInput::SubscribeIssued);
        machine.process_input(SubscriptionInput::Message(Bytes::from_static(b"early")));

        assert!(drain(&mut machine).is_empty());
        assert_eq!(machine.state(), SubscriptionState::Subscribing);
    }

    #[test]
    fn test_nothing_after_close() {
        let mut machine = SubscriptionMachine::new();
        machine.process_input(SubscriptionInput::SubscribeIssued);
        machine.process_input(SubscriptionInput::Acknowledged { count: 1 });
        machine.process_input(SubscriptionInput::Acknowledged { count: 0 });
        let _ = drain(&mut machine);

        machine.process_input(SubscriptionInput::Message(Bytes::from_static(b"late")));
        machine.process_input(SubscriptionInput::Acknowledged { count: 0 });
        machine.process_input(SubscriptionInput::Acknowledged { count: 1 });

        assert!(drain(&mut machine).is_empty());
        assert!(machine.is_closed());
    }

    #[test]
    fn test_unsubscribe_before_acknowledgement_closes() {
        let mut machine = SubscriptionMachine::new();
        machine.process_input(SubscriptionInput::SubscribeIssued);
        machine.process_input(SubscriptionInput::Acknowledged { count: 0 });

        assert_eq!(drain(&mut machine), vec![SubscriptionOutput::Finished]);
    }
}

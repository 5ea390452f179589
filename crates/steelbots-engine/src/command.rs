//! Bounded control command bus between external callers and the scheduler.

use crossfire::{MRx, MTx, TryRecvError, mpmc};
use steelbots_core::ControlCommand;
use tracing::debug;

pub type CommandSender = MTx<ControlCommand>;
pub type CommandReceiver = MRx<ControlCommand>;

/// Create the control bus. Senders are cheap to clone and safe to use from
/// any thread; commands take effect at the next turn boundary.
pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    mpmc::bounded_blocking(capacity)
}

/// Drain every queued command without blocking.
pub fn drain_pending_commands(receiver: &CommandReceiver) -> Vec<ControlCommand> {
    let mut drained = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(command) => {
                debug!(?command, "control command received");
                drained.push(command);
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        }
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_commands_in_order() {
        let (sender, receiver) = create_command_bus(4);
        sender.try_send(ControlCommand::Pause).expect("send");
        sender.try_send(ControlCommand::SingleStep).expect("send");
        sender.try_send(ControlCommand::Resume).expect("send");
        assert_eq!(
            drain_pending_commands(&receiver),
            vec![
                ControlCommand::Pause,
                ControlCommand::SingleStep,
                ControlCommand::Resume,
            ]
        );
        assert!(drain_pending_commands(&receiver).is_empty());
    }
}

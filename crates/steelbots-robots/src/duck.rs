//! The classic stationary target.

use steelbots_engine::{Peer, Robot, RobotError};

/// Does nothing, forever. Useful as a baseline opponent and for tests that
/// need a robot with no behavior of its own.
pub struct SittingDuck;

impl Robot for SittingDuck {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        loop {
            peer.do_nothing(self)?;
        }
    }
}

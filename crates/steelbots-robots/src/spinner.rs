//! Junior-tier circler: drives short arcs and fires whenever the gun is
//! cool.

use steelbots_engine::{Peer, Robot, RobotError};

pub struct Spinner {
    fire_power: f64,
}

impl Default for Spinner {
    fn default() -> Self {
        Self { fire_power: 1.0 }
    }
}

impl Robot for Spinner {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        loop {
            peer.drive(self, 24.0, 0.3)?;
            if peer.gun_heat() <= 0.0 {
                let fire_power = self.fire_power;
                peer.fire(self, fire_power)?;
            }
        }
    }
}

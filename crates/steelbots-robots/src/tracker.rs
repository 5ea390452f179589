//! Advanced-tier hunter built on the deferred command surface.

use std::f64::consts::FRAC_PI_4;

use steelbots_core::{Event, EventKind, FnCondition};
use steelbots_engine::{Peer, Robot, RobotError};

use crate::normal_relative;

/// Sweeps its radar continuously, swings the gun onto scanned targets, and
/// retreats once a low-energy condition fires.
#[derive(Default)]
pub struct Tracker {
    retreating: bool,
}

impl Tracker {
    const LOW_ENERGY: &'static str = "low_energy";
}

impl Robot for Tracker {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        peer.add_custom_event(Box::new(FnCondition::new(
            Self::LOW_ENERGY,
            85,
            |status| status.energy < 25.0,
        )))?;
        loop {
            peer.set_turn_radar(FRAC_PI_4)?;
            peer.execute(self)?;
        }
    }

    fn on_event(&mut self, event: &Event, peer: &mut Peer) -> Result<(), RobotError> {
        match &event.kind {
            EventKind::ScannedRobot {
                bearing, distance, ..
            } => {
                let absolute = peer.heading() + bearing;
                let gun_turn = normal_relative(absolute - peer.gun_heading());
                peer.set_turn_gun(gun_turn)?;
                if peer.gun_heat() <= 0.0 && gun_turn.abs() < 0.2 {
                    let power = if *distance < 200.0 { 3.0 } else { 1.5 };
                    peer.set_fire(power)?;
                }
                if !self.retreating {
                    // Close in on the contact.
                    peer.set_move(distance * 0.5)?;
                    peer.set_turn_body(normal_relative(*bearing))?;
                }
                Ok(())
            }
            EventKind::Custom { name } if name == Self::LOW_ENERGY => {
                self.retreating = true;
                peer.remove_custom_event(Self::LOW_ENERGY)?;
                peer.set_move(-200.0)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

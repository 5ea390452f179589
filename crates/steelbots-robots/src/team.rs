//! Team-tier pair: a scout that reports contacts and a gunner that shoots
//! along reported bearings.

use std::f64::consts::FRAC_PI_4;

use steelbots_core::{Event, EventKind};
use steelbots_engine::{Peer, Robot, RobotError};

use crate::normal_relative;

/// Sweeps its radar and broadcasts the absolute bearing of every contact to
/// its teammates.
pub struct TeamScout;

impl Robot for TeamScout {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        loop {
            peer.set_turn_radar(FRAC_PI_4)?;
            peer.execute(self)?;
        }
    }

    fn on_event(&mut self, event: &Event, peer: &mut Peer) -> Result<(), RobotError> {
        if let EventKind::ScannedRobot { bearing, .. } = event.kind {
            let absolute = normal_relative(peer.heading() + bearing);
            peer.broadcast(&absolute.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Holds position and fires along bearings reported by the scout.
#[derive(Default)]
pub struct TeamGunner {
    contacts: u32,
}

impl Robot for TeamGunner {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        loop {
            peer.execute(self)?;
        }
    }

    fn on_event(&mut self, event: &Event, peer: &mut Peer) -> Result<(), RobotError> {
        if let EventKind::Message { payload, .. } = &event.kind {
            let Ok(bytes) = <[u8; 8]>::try_from(payload.as_slice()) else {
                return Ok(());
            };
            let absolute = f64::from_le_bytes(bytes);
            self.contacts += 1;
            let gun_turn = normal_relative(absolute - peer.gun_heading());
            peer.set_turn_gun(gun_turn)?;
            if peer.gun_heat() <= 0.0 && gun_turn.abs() < 0.3 {
                // Alternate light and heavy shells as contacts accumulate.
                let power = if self.contacts % 3 == 0 { 3.0 } else { 1.5 };
                peer.set_fire(power)?;
            }
        }
        Ok(())
    }
}

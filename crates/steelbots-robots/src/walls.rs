//! Standard-tier perimeter patroller.

use std::f64::consts::FRAC_PI_2;

use steelbots_core::{Event, EventKind};
use steelbots_engine::{Peer, Robot, RobotError};

/// Runs straight legs and turns a quarter circle at every wall, taking a
/// snap shot after each corner.
pub struct WallCrawler;

impl Robot for WallCrawler {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        loop {
            peer.ahead(self, 160.0)?;
            peer.turn_body(self, FRAC_PI_2)?;
            if peer.gun_heat() <= 0.0 {
                peer.fire(self, 2.0)?;
            }
        }
    }

    fn on_event(&mut self, event: &Event, peer: &mut Peer) -> Result<(), RobotError> {
        match event.kind {
            // A wall stop already zeroed the move order; peel away so the
            // next leg does not grind the same wall again.
            EventKind::HitWall { .. } => peer.turn_body(self, FRAC_PI_2),
            EventKind::HitRobot { bearing, .. } => {
                if bearing.abs() < FRAC_PI_2 {
                    peer.back(self, 50.0)
                } else {
                    peer.ahead(self, 50.0)
                }
            }
            _ => Ok(()),
        }
    }
}

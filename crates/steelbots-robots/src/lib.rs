//! Sample hosted robot programs for the Steelbots arena.
//!
//! Each module holds one program; together they exercise every peer
//! capability tier, from the junior combined-drive primitive up to team
//! messaging.

use std::f64::consts::{PI, TAU};

use steelbots_engine::{Capability, RobotSpec};

pub mod duck;
pub mod spinner;
pub mod team;
pub mod tracker;
pub mod walls;

pub use duck::SittingDuck;
pub use spinner::Spinner;
pub use team::{TeamGunner, TeamScout};
pub use tracker::Tracker;
pub use walls::WallCrawler;

/// Wrap an angle into `(-pi, pi]`.
pub(crate) fn normal_relative(mut angle: f64) -> f64 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle <= -PI {
        angle += TAU;
    }
    while angle > PI {
        angle -= TAU;
    }
    angle
}

/// Build a roster entry by catalog name.
#[must_use]
pub fn spec(name: &str) -> Option<RobotSpec> {
    Some(match name {
        "duck" => RobotSpec::new("duck", Capability::Junior, || Box::new(SittingDuck)),
        "spinner" => RobotSpec::new("spinner", Capability::Junior, || Box::<Spinner>::default()),
        "walls" => RobotSpec::new("walls", Capability::Standard, || Box::new(WallCrawler)),
        "tracker" => RobotSpec::new("tracker", Capability::Advanced, || Box::<Tracker>::default()),
        "scout" => {
            RobotSpec::new("scout", Capability::Team, || Box::new(TeamScout)).with_team("recon")
        }
        "gunner" => RobotSpec::new("gunner", Capability::Team, || Box::<TeamGunner>::default())
            .with_team("recon"),
        _ => return None,
    })
}

/// Names accepted by [`spec`].
#[must_use]
pub const fn catalog() -> &'static [&'static str] {
    &["duck", "spinner", "walls", "tracker", "scout", "gunner"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_resolve() {
        for name in catalog() {
            let spec = spec(name).expect("catalog entry");
            assert_eq!(spec.name, *name);
        }
        assert!(spec("no_such_robot").is_none());
    }

    #[test]
    fn relative_angles_wrap() {
        assert!((normal_relative(TAU + 0.25) - 0.25).abs() < 1e-12);
        assert!((normal_relative(-TAU - 0.25) + 0.25).abs() < 1e-12);
        assert_eq!(normal_relative(PI), PI);
    }
}

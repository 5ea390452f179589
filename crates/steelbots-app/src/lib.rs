//! Application shell for the Steelbots CLI: the control facade used by the
//! binary and by external surfaces.

pub mod control;

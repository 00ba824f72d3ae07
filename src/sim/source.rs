//! Simulated signal source.

use super::scene::{Role, Scene};

/// Simulated signal source.
///
/// A simulated source writes the state set through the instrument façade into
/// the [`Scene`] shared with the simulated ROACH.
#[derive(Debug, Clone)]
pub struct SimSource {
    scene: Scene,
    role: Role,
    freq_mult: f64,
}

impl SimSource {
    /// Creates a simulated source with a role in the scene.
    ///
    /// The frequency seen by the receiver is the device frequency multiplied
    /// by `freq_mult`.
    pub fn new(scene: Scene, role: Role, freq_mult: f64) -> SimSource {
        SimSource {
            scene,
            role,
            freq_mult,
        }
    }

    /// Role of the source.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Sets the device frequency in MHz.
    pub fn set_frequency(&self, mhz: f64) {
        let freq = mhz * self.freq_mult;
        self.scene.update(self.role, |s| s.freq = freq);
    }

    /// Sets the power in dBm.
    pub fn set_power(&self, dbm: f64) {
        self.scene.update(self.role, |s| s.power = dbm);
    }

    /// Turns the output on or off.
    pub fn set_output(&self, on: bool) {
        self.scene.update(self.role, |s| s.on = on);
    }
}

//! Simulated analog scene.
//!
//! This module contains [`Scene`], the state shared between the simulated
//! signal sources and the simulated ROACH. The sources write their frequency,
//! power and output state into the scene, and the ROACH reads it when it
//! computes the signals seen by its ADCs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Full scale of the simulated ADCs in counts.
///
/// A 0 dBm tone has this amplitude at the ADC inputs.
pub const FULL_SCALE: f64 = 128.0;

/// Role of a source in the scene.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    /// RF tone source.
    Rf,
    /// LO source with its index in the LO list.
    Lo(usize),
    /// Auxiliary source.
    Test,
}

/// State of a simulated source.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SourceState {
    /// Frequency at the receiver input in MHz.
    pub freq: f64,
    /// Power in dBm.
    pub power: f64,
    /// Output enabled.
    pub on: bool,
}

/// Sideband of a tone after downconversion.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Sideband {
    /// Upper sideband, or no downconversion.
    Upper,
    /// Lower sideband.
    Lower,
}

/// A tone at the ADC inputs.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Tone {
    /// Source producing the tone.
    pub role: Role,
    /// Baseband frequency in MHz.
    pub freq: f64,
    /// Amplitude in ADC counts.
    pub amplitude: f64,
    /// Sideband the tone comes from.
    pub sideband: Sideband,
}

/// Simulated analog scene.
///
/// The scene can be cloned cheaply. All the clones refer to the same state.
#[derive(Debug, Clone, Default)]
pub struct Scene(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    sources: HashMap<Role, SourceState>,
    num_los: usize,
    generation: u64,
}

impl Scene {
    /// Creates a scene with `num_los` LO sources.
    ///
    /// All the sources start switched off.
    pub fn new(num_los: usize) -> Scene {
        Scene(Arc::new(Mutex::new(State {
            sources: HashMap::new(),
            num_los,
            generation: 0,
        })))
    }

    /// Returns the state of a source, if it has been set.
    pub fn source(&self, role: Role) -> Option<SourceState> {
        self.0.lock().unwrap().sources.get(&role).copied()
    }

    /// Modifies the state of a source.
    pub fn update(&self, role: Role, f: impl FnOnce(&mut SourceState)) {
        let mut state = self.0.lock().unwrap();
        let source = state.sources.entry(role).or_insert(SourceState {
            freq: 0.0,
            power: -100.0,
            on: false,
        });
        f(source);
        state.generation += 1;
    }

    /// Counter that changes every time the scene changes.
    pub fn generation(&self) -> u64 {
        self.0.lock().unwrap().generation
    }

    /// Returns the tones present at the ADC inputs.
    ///
    /// The RF and auxiliary tones are mixed with the sum of the LO
    /// frequencies. A tone above the LOs lands in the upper sideband and a
    /// tone below them in the lower sideband. If any LO is off nothing reaches
    /// the ADCs. Tones outside `[0, bw)` are filtered out.
    pub fn tones(&self, bw: f64) -> Vec<Tone> {
        let state = self.0.lock().unwrap();
        let mut lo_sum = 0.0;
        for j in 0..state.num_los {
            match state.sources.get(&Role::Lo(j)) {
                Some(lo) if lo.on => lo_sum += lo.freq,
                _ => return Vec::new(),
            }
        }
        [Role::Rf, Role::Test]
            .into_iter()
            .filter_map(|role| {
                let source = state.sources.get(&role)?;
                if !source.on {
                    return None;
                }
                let freq = source.freq - lo_sum;
                let sideband = if state.num_los == 0 || freq >= 0.0 {
                    Sideband::Upper
                } else {
                    Sideband::Lower
                };
                let freq = freq.abs();
                (freq < bw).then_some(Tone {
                    role,
                    freq,
                    amplitude: FULL_SCALE * 10f64.powf(source.power / 20.0),
                    sideband,
                })
            })
            .collect()
    }
}

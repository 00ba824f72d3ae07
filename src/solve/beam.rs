//! Beam steering.
//!
//! The array elements lie at positions `p` (in metres). A plane wave arriving
//! from azimuth `az` and elevation `el` has the wavenumber vector `k = 2π/λ *
//! (cos(el) sin(az), sin(el), cos(el) cos(az))`, so that it reaches element
//! `i` with phase `-k·p_i`. Steering the beam towards that direction uses the
//! conjugates of the phasors `exp(-j k·p_i)`.

use num_complex::Complex64;
use roachcal_json::ArrayInfo;
use std::f64::consts::PI;

/// Wavelength in metres for a propagation speed in m/s and a frequency in
/// MHz.
pub fn wavelength(speed: f64, freq: f64) -> f64 {
    speed / (freq * 1e6)
}

/// Unit vector pointing towards azimuth `az` and elevation `el` (degrees).
pub fn direction(az: f64, el: f64) -> [f64; 3] {
    let (az, el) = (az.to_radians(), el.to_radians());
    [el.cos() * az.sin(), el.sin(), el.cos() * az.cos()]
}

/// Wavenumber vector of a plane wave from azimuth `az` and elevation `el`
/// (degrees).
pub fn wavenumber(az: f64, el: f64, wavelength: f64) -> [f64; 3] {
    direction(az, el).map(|u| 2.0 * PI / wavelength * u)
}

/// Dot product.
pub fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Element positions in metres, in row-major order.
pub fn element_positions(array: &ArrayInfo) -> Vec<[f64; 3]> {
    array
        .el_pos
        .iter()
        .flatten()
        .map(|p| p.map(|x| x * array.el_sep))
        .collect()
}

/// Phasors `exp(-j k·p)` of the elements for a plane wave from azimuth `az`
/// and elevation `el` (degrees).
pub fn steering_phasors(positions: &[[f64; 3]], az: f64, el: f64, wavelength: f64) -> Vec<Complex64> {
    let k = wavenumber(az, el, wavelength);
    positions
        .iter()
        .map(|p| Complex64::from_polar(1.0, -dot(&k, p)))
        .collect()
}

/// Phasor bank address of an element.
///
/// With one address register the address is the element index. With two
/// address registers it is the `[row, column]` of the element in `el_pos`.
pub fn element_address(array: &ArrayInfo, index: usize, num_regs: usize) -> Option<Vec<u32>> {
    match num_regs {
        1 => Some(vec![u32::try_from(index).ok()?]),
        2 => {
            let mut first = 0;
            for (row, elements) in array.el_pos.iter().enumerate() {
                if index < first + elements.len() {
                    return Some(vec![row as u32, (index - first) as u32]);
                }
                first += elements.len();
            }
            None
        }
        _ => None,
    }
}

/// Angles of a scan range `[start, stop, step]` (stop inclusive).
pub fn scan_angles(range: [f64; 3]) -> Vec<f64> {
    let [start, stop, step] = range;
    if !(step > 0.0) || stop < start {
        return vec![start];
    }
    // tolerate rounding in the number of steps
    let n = ((stop - start) / step + 1e-9).floor() as usize;
    (0..=n).map(|j| start + j as f64 * step).collect()
}

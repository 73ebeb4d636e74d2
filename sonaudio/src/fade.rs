//! Fondus à puissance constante
//!
//! Tous les fondus du moteur (boucle de piste, entrées/sorties du mode
//! presence, transitions de thème) utilisent la même loi :
//! `A × cos(πt/2W) + B × sin(πt/2W)`, qui conserve l'énergie RMS quand A et
//! B sont décorrélés.

use std::f32::consts::FRAC_PI_2;

/// Gains `(sortant, entrant)` à l'offset `t` d'une fenêtre de `window` frames.
///
/// `t = 0` donne `(1, 0)` ; `t = window` donne `(0, 1)`.
#[inline]
pub fn equal_power_gains(t: u64, window: u64) -> (f32, f32) {
    if window == 0 {
        return (0.0, 1.0);
    }
    let x = (t.min(window) as f32 / window as f32) * FRAC_PI_2;
    (x.cos(), x.sin())
}

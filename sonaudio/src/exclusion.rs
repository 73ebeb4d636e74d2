//! Coordination des pistes exclusives
//!
//! Une instance par [`crate::ThemeMixer`]. Garantit qu'au plus une piste
//! exclusive est audible à tout instant, avec un temps mort après chaque
//! lecture et un plancher d'activation après le chargement du thème.
//!
//! Le « maintenant » du coordinateur est l'horloge à frames du mixeur,
//! jamais le temps mur.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::FrameClock;

/// Identifiant d'un player au sein d'un mixeur.
pub type PlayerId = usize;

#[derive(Debug, Default)]
struct ExclusionState {
    active: Option<PlayerId>,
    /// Fin prévue de la lecture en cours (informative, pour diagnostics)
    play_end_frame: u64,
    cooldown_until: u64,
}

/// Exclusion mutuelle des pistes exclusives d'un thème.
#[derive(Debug)]
pub struct ExclusionCoordinator {
    clock: Arc<FrameClock>,
    min_gap_frames: u64,
    initial_delay_frames: u64,
    state: Mutex<ExclusionState>,
}

impl ExclusionCoordinator {
    pub fn new(clock: Arc<FrameClock>, min_gap_s: f64, initial_delay_s: f64) -> Self {
        let min_gap_frames = clock.secs_to_frames(min_gap_s);
        let initial_delay_frames = clock.secs_to_frames(initial_delay_s);
        Self {
            clock,
            min_gap_frames,
            initial_delay_frames,
            state: Mutex::new(ExclusionState::default()),
        }
    }

    /// Demande le droit de commencer une lecture audible.
    ///
    /// Accordé si aucune autre piste exclusive n'est en cours, que le temps
    /// mort est écoulé et que le plancher initial est passé. En cas d'accord,
    /// le player est enregistré jusqu'à son `finish_playing`.
    pub fn try_start_playing(&self, player: PlayerId, expected_frames: u64) -> bool {
        let now = self.clock.frames();
        let mut state = self.state.lock().unwrap();

        if now < self.initial_delay_frames {
            return false;
        }
        if state.active.is_some() {
            return false;
        }
        if now < state.cooldown_until {
            return false;
        }

        state.active = Some(player);
        state.play_end_frame = now.saturating_add(expected_frames);
        debug!(player, now, expected_frames, "Exclusive play granted");
        true
    }

    /// Signale la fin de la lecture et arme le temps mort.
    pub fn finish_playing(&self, player: PlayerId) {
        let now = self.clock.frames();
        let mut state = self.state.lock().unwrap();
        if state.active == Some(player) {
            state.active = None;
            state.cooldown_until = now.saturating_add(self.min_gap_frames);
            debug!(
                player,
                now,
                expected_end = state.play_end_frame,
                cooldown_until = state.cooldown_until,
                "Exclusive play finished"
            );
        }
    }

    /// Vrai si une lecture est en cours ou si le temps mort n'est pas écoulé.
    pub fn is_blocked(&self) -> bool {
        let now = self.clock.frames();
        let state = self.state.lock().unwrap();
        state.active.is_some() || now < state.cooldown_until || now < self.initial_delay_frames
    }

    /// Player exclusif actuellement audible, le cas échéant.
    pub fn active_player(&self) -> Option<PlayerId> {
        self.state.lock().unwrap().active
    }
}

//! RecordingPlayer : machine à états de lecture d'une piste
//!
//! Chaque fichier source d'un thème est piloté par un player qui produit, à
//! la demande du mixeur, sa contribution aux `n` prochaines frames. Quatre
//! comportements coexistent sur la même base de temps :
//!
//! - `continuous` : boucle permanente, enveloppe épinglée à 1, avec raccord
//!   seamless ou fondu de boucle à puissance constante selon la piste ;
//! - `sparse` : lectures ponctuelles intégrales séparées d'intervalles
//!   pseudo-aléatoires dérivés du cadran `presence` ;
//! - `presence` : disponibilité continue modulée par des fondus lents entre
//!   périodes actives et inactives dont le rapport cyclique vaut `presence` ;
//! - piste muette : zéros exacts, aucun décodage.
//!
//! Un échec de décodage désactive la piste pour la durée du thème : le
//! player journalise une fois, libère une éventuelle exclusivité et n'émet
//! plus que du silence. L'erreur ne remonte jamais au mixeur.

use std::path::PathBuf;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::decoder::DecoderFactory;
use crate::frame::lerp;
use crate::{
    equal_power_gains, resolve_playback_mode, Decoder, EngineError, ExclusionCoordinator, Frame,
    FrameClock, PlaybackMode, PlayerId, ThemeTuning, TrackSettings, SILENT_FRAME,
};

/// Intervalle de base entre deux tentatives d'activation refusées (secondes).
const EXCLUSIVE_RECHECK_S: f64 = 5.0;
/// Gigue ajoutée à l'intervalle de re-tentative (secondes).
const EXCLUSIVE_RECHECK_JITTER_S: f64 = 2.0;
/// Durée supposée d'une lecture dont le conteneur ne donne pas la longueur.
const FALLBACK_EXPECTED_PLAY_S: f64 = 30.0;

/// État courant de la machine de lecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayState {
    /// Lecture continue en régime permanent
    Steady,
    /// Fondu de boucle en cours (`t` frames dans une fenêtre de `window`)
    LoopCrossfade { t: u64, window: u64 },
    /// Sparse : silence jusqu'à la prochaine activation programmée
    SparseWaiting { resume_at: u64 },
    /// Sparse : lecture intégrale du fichier en cours
    SparsePlaying,
    /// Presence : période inactive (enveloppe 0, décodage en pause)
    PresenceInactive { until: u64 },
    /// Presence : fondu d'entrée
    PresenceFadeIn { t: u64 },
    /// Presence : plateau actif (enveloppe 1)
    PresenceActive { until: u64 },
    /// Presence : fondu de sortie
    PresenceFadeOut { t: u64 },
    /// Piste désactivée (échec de décodage) : silence définitif
    Silenced,
}

/// Player d'une piste au sein d'un [`crate::ThemeMixer`].
pub struct RecordingPlayer {
    label: String,
    path: PathBuf,
    settings: TrackSettings,
    mode: PlaybackMode,
    tuning: ThemeTuning,
    clock: Arc<FrameClock>,
    coordinator: Arc<ExclusionCoordinator>,
    factory: Arc<dyn DecoderFactory>,
    player_id: PlayerId,
    rng: StdRng,

    primary: Option<Box<dyn Decoder>>,
    /// Second décodeur pré-armé pour le fondu de boucle
    arm: Option<Box<dyn Decoder>>,
    /// Durée du fichier en frames canoniques, si connue
    duration: Option<u64>,

    state: PlayState,
    /// Frames produites depuis le début du thème (curseur local)
    pos: u64,
    /// Frames consommées depuis le début du décodeur principal
    file_pos: u64,
    last_envelope: f32,
    failure: Option<String>,

    scratch: Vec<Frame>,
    scratch_arm: Vec<Frame>,
}

impl RecordingPlayer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        player_id: PlayerId,
        path: PathBuf,
        settings: TrackSettings,
        tuning: ThemeTuning,
        factory: Arc<dyn DecoderFactory>,
        clock: Arc<FrameClock>,
        coordinator: Arc<ExclusionCoordinator>,
        seed: u64,
    ) -> Result<Self, EngineError> {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let rng = StdRng::seed_from_u64(seed);

        // Une piste muette ne décode rien du tout.
        if settings.muted {
            return Ok(Self {
                label,
                path,
                settings,
                mode: PlaybackMode::Continuous,
                tuning,
                clock,
                coordinator,
                factory,
                player_id,
                rng,
                primary: None,
                arm: None,
                duration: None,
                state: PlayState::Steady,
                pos: 0,
                file_pos: 0,
                last_envelope: 0.0,
                failure: None,
                scratch: Vec::new(),
                scratch_arm: Vec::new(),
            });
        }

        let primary = factory.open(&path)?;
        let duration = primary.info().duration_frames;
        let duration_s = primary.info().duration_seconds();
        let mode = resolve_playback_mode(settings.playback_mode, duration_s, &tuning);

        let mut player = Self {
            label,
            path,
            settings,
            mode,
            tuning,
            clock,
            coordinator,
            factory,
            player_id,
            rng,
            primary: Some(primary),
            arm: None,
            duration,
            state: PlayState::Steady,
            pos: 0,
            file_pos: 0,
            last_envelope: 0.0,
            failure: None,
            scratch: Vec::new(),
            scratch_arm: Vec::new(),
        };

        player.state = match mode {
            PlaybackMode::Continuous => PlayState::Steady,
            PlaybackMode::Sparse => {
                // Une piste sparse ne garde pas de décodeur ouvert entre
                // deux lectures.
                player.primary = None;
                let mean = player.sparse_mean_frames();
                let fraction = (player.rng.gen::<f64>() * mean as f64) as u64;
                let resume_at = if player.settings.exclusive {
                    fraction.max(player.clock.secs_to_frames(player.tuning.sparse_startup_delay_s))
                } else {
                    fraction
                };
                PlayState::SparseWaiting { resume_at }
            }
            PlaybackMode::Presence => {
                let duty = player.settings.presence.clamp(0.0, 1.0) as f64;
                if duty <= 0.0 {
                    PlayState::PresenceInactive { until: u64::MAX }
                } else if duty >= 1.0 {
                    PlayState::PresenceInactive { until: 0 }
                } else {
                    let inactive = player.presence_inactive_frames();
                    let offset = (player.rng.gen::<f64>() * inactive as f64) as u64;
                    PlayState::PresenceInactive { until: offset }
                }
            }
            PlaybackMode::Auto => unreachable!("mode resolved at construction"),
        };

        debug!(
            track = %player.label,
            mode = ?player.mode,
            duration_frames = ?player.duration,
            exclusive = player.settings.exclusive,
            "Recording player ready"
        );
        Ok(player)
    }

    /// Ajoute la contribution de cette piste dans `acc` pour les
    /// `acc.len()` prochaines frames, puis avance le curseur local.
    ///
    /// Retourne l'enveloppe de la dernière frame produite ; le mixeur s'en
    /// sert pour le comptage des pistes actives.
    pub(crate) fn mix_into(&mut self, acc: &mut [Frame]) -> f32 {
        let n = acc.len();
        if self.settings.muted || self.settings.volume <= 0.0 {
            self.pos += n as u64;
            self.last_envelope = 0.0;
            return 0.0;
        }
        if self.state == PlayState::Silenced {
            self.pos += n as u64;
            self.last_envelope = 0.0;
            return 0.0;
        }

        let mut offset = 0;
        while offset < n {
            if self.state == PlayState::Silenced {
                break;
            }
            offset += self.advance_segment(acc, offset);
        }
        self.pos += n as u64;
        self.last_envelope
    }

    /// Traite un segment homogène de l'état courant et retourne le nombre de
    /// frames consommées (0 si seule une transition d'état a eu lieu).
    fn advance_segment(&mut self, acc: &mut [Frame], offset: usize) -> usize {
        let n_left = acc.len() - offset;
        let now = self.pos + offset as u64;
        let volume = self.settings.volume;

        match self.state {
            PlayState::Steady => {
                if !self.settings.seamless_loop {
                    if let Some(duration) = self.duration {
                        let window = self.loop_window(duration);
                        if window > 0 {
                            let fade_start = duration - window;
                            if self.file_pos >= fade_start {
                                match self.factory.open(&self.path) {
                                    Ok(arm) => {
                                        trace!(track = %self.label, "Arming loop crossfade");
                                        self.arm = Some(arm);
                                        self.state = PlayState::LoopCrossfade { t: 0, window };
                                    }
                                    Err(e) => self.fail(e),
                                }
                                return 0;
                            }
                            let take = n_left.min((fade_start - self.file_pos) as usize);
                            return self.mix_steady(acc, offset, take, volume, 1.0);
                        }
                    }
                }
                self.mix_steady(acc, offset, n_left, volume, 1.0)
            }

            PlayState::LoopCrossfade { t, window } => {
                let take = n_left.min(window.saturating_sub(t) as usize);
                if take == 0 {
                    self.promote_arm(window);
                    return 0;
                }

                // Queue du fichier sortant : une fin prématurée laisse du
                // silence, le fondu la masque.
                let got_out = match self.fill_scratch(take, false) {
                    Ok(got) => got,
                    Err(e) => {
                        self.fail(e);
                        return 0;
                    }
                };
                for frame in self.scratch[got_out..take].iter_mut() {
                    *frame = SILENT_FRAME;
                }

                let got_in = match self.fill_arm(take) {
                    Ok(got) => got,
                    Err(e) => {
                        self.fail(e);
                        return 0;
                    }
                };
                for frame in self.scratch_arm[got_in..take].iter_mut() {
                    *frame = SILENT_FRAME;
                }

                for j in 0..take {
                    let (gain_out, gain_in) = equal_power_gains(t + j as u64, window);
                    let p = self.scratch[j];
                    let s = self.scratch_arm[j];
                    acc[offset + j][0] += (p[0] * gain_out + s[0] * gain_in) * volume;
                    acc[offset + j][1] += (p[1] * gain_out + s[1] * gain_in) * volume;
                }
                self.last_envelope = 1.0;

                let t = t + take as u64;
                if t >= window {
                    self.promote_arm(window);
                } else {
                    self.state = PlayState::LoopCrossfade { t, window };
                }
                take
            }

            PlayState::SparseWaiting { resume_at } => {
                if now < resume_at {
                    let take = n_left.min((resume_at - now) as usize);
                    self.last_envelope = 0.0;
                    return take;
                }

                if self.settings.exclusive
                    && !self
                        .coordinator
                        .try_start_playing(self.player_id, self.expected_play_frames())
                {
                    let retry = now + self.recheck_frames();
                    trace!(track = %self.label, retry, "Exclusive activation denied");
                    self.state = PlayState::SparseWaiting { resume_at: retry };
                    return 0;
                }

                match self.factory.open(&self.path) {
                    Ok(decoder) => {
                        self.primary = Some(decoder);
                        self.file_pos = 0;
                        self.state = PlayState::SparsePlaying;
                    }
                    Err(e) => {
                        if self.settings.exclusive {
                            self.coordinator.finish_playing(self.player_id);
                        }
                        self.fail(e);
                    }
                }
                0
            }

            PlayState::SparsePlaying => {
                let take = n_left;
                let got = match self.fill_scratch(take, false) {
                    Ok(got) => got,
                    Err(e) => {
                        if self.settings.exclusive {
                            self.coordinator.finish_playing(self.player_id);
                        }
                        self.fail(e);
                        return 0;
                    }
                };
                for j in 0..got {
                    acc[offset + j][0] += self.scratch[j][0] * volume;
                    acc[offset + j][1] += self.scratch[j][1] * volume;
                }
                if got > 0 {
                    self.last_envelope = 1.0;
                }

                if got < take {
                    // Fin du fichier : fermer, échantillonner le prochain
                    // intervalle et se réarmer.
                    if self.settings.exclusive {
                        self.coordinator.finish_playing(self.player_id);
                    }
                    self.primary = None;
                    let interval = self.sample_sparse_interval();
                    let resume_at = now + got as u64 + interval;
                    debug!(track = %self.label, resume_at, "Sparse play complete");
                    self.state = PlayState::SparseWaiting { resume_at };
                    self.last_envelope = 0.0;
                }
                got
            }

            PlayState::PresenceInactive { until } => {
                if until == u64::MAX {
                    self.last_envelope = 0.0;
                    return n_left;
                }
                if now < until {
                    let take = n_left.min((until - now) as usize);
                    self.last_envelope = 0.0;
                    return take;
                }

                if self.settings.exclusive
                    && !self
                        .coordinator
                        .try_start_playing(self.player_id, self.expected_presence_frames())
                {
                    self.state = PlayState::PresenceInactive {
                        until: now + self.recheck_frames(),
                    };
                    return 0;
                }
                self.state = PlayState::PresenceFadeIn { t: 0 };
                0
            }

            PlayState::PresenceFadeIn { t } => {
                let fade = self.presence_fade_frames();
                if t >= fade {
                    self.state = PlayState::PresenceActive {
                        until: self.presence_active_until(now),
                    };
                    return 0;
                }
                let take = n_left.min((fade - t) as usize);
                let got = match self.fill_scratch(take, true) {
                    Ok(got) => got,
                    Err(e) => {
                        self.release_exclusive();
                        self.fail(e);
                        return 0;
                    }
                };
                for j in 0..got {
                    let (_, envelope) = equal_power_gains(t + j as u64, fade);
                    acc[offset + j][0] += self.scratch[j][0] * volume * envelope;
                    acc[offset + j][1] += self.scratch[j][1] * volume * envelope;
                    self.last_envelope = envelope;
                }
                let t = t + got as u64;
                if t >= fade {
                    self.state = PlayState::PresenceActive {
                        until: self.presence_active_until(now + got as u64),
                    };
                } else {
                    self.state = PlayState::PresenceFadeIn { t };
                }
                got.max(1).min(take)
            }

            PlayState::PresenceActive { until } => {
                let take = if until == u64::MAX {
                    n_left
                } else if now < until {
                    n_left.min((until - now) as usize)
                } else {
                    self.state = PlayState::PresenceFadeOut { t: 0 };
                    return 0;
                };
                let got = match self.fill_scratch(take, true) {
                    Ok(got) => got,
                    Err(e) => {
                        self.release_exclusive();
                        self.fail(e);
                        return 0;
                    }
                };
                for j in 0..got {
                    acc[offset + j][0] += self.scratch[j][0] * volume;
                    acc[offset + j][1] += self.scratch[j][1] * volume;
                }
                if got > 0 {
                    self.last_envelope = 1.0;
                }
                got.max(1).min(take)
            }

            PlayState::PresenceFadeOut { t } => {
                let fade = self.presence_fade_frames();
                if t >= fade {
                    self.release_exclusive();
                    self.state = PlayState::PresenceInactive {
                        until: now + self.presence_inactive_frames(),
                    };
                    self.last_envelope = 0.0;
                    return 0;
                }
                let take = n_left.min((fade - t) as usize);
                let got = match self.fill_scratch(take, true) {
                    Ok(got) => got,
                    Err(e) => {
                        self.release_exclusive();
                        self.fail(e);
                        return 0;
                    }
                };
                for j in 0..got {
                    let (envelope, _) = equal_power_gains(t + j as u64, fade);
                    acc[offset + j][0] += self.scratch[j][0] * volume * envelope;
                    acc[offset + j][1] += self.scratch[j][1] * volume * envelope;
                    self.last_envelope = envelope;
                }
                let t = t + got as u64;
                if t >= fade {
                    self.release_exclusive();
                    self.state = PlayState::PresenceInactive {
                        until: now + got as u64 + self.presence_inactive_frames(),
                    };
                    self.last_envelope = 0.0;
                } else {
                    self.state = PlayState::PresenceFadeOut { t };
                }
                got.max(1).min(take)
            }

            PlayState::Silenced => n_left,
        }
    }

    /// Lecture en régime permanent, avec rebouclage seamless sur EOF.
    fn mix_steady(
        &mut self,
        acc: &mut [Frame],
        offset: usize,
        take: usize,
        volume: f32,
        envelope: f32,
    ) -> usize {
        if take == 0 {
            return 0;
        }
        let got = match self.fill_scratch(take, true) {
            Ok(got) => got,
            Err(e) => {
                self.fail(e);
                return 0;
            }
        };
        for j in 0..got {
            acc[offset + j][0] += self.scratch[j][0] * volume * envelope;
            acc[offset + j][1] += self.scratch[j][1] * volume * envelope;
        }
        if got > 0 {
            self.last_envelope = envelope;
        }
        got.max(1).min(take)
    }

    /// Remplit `scratch[..take]` depuis le décodeur principal.
    ///
    /// Si `looped` est vrai, un EOF déclenche un `rewind` immédiat : aucune
    /// frame silencieuse n'est insérée entre deux boucles. Sinon le nombre de
    /// frames réellement lues est retourné tel quel.
    fn fill_scratch(&mut self, take: usize, looped: bool) -> Result<usize, EngineError> {
        if self.scratch.len() < take {
            self.scratch.resize(take, SILENT_FRAME);
        }
        let primary = match self.primary.as_mut() {
            Some(primary) => primary,
            None => return Ok(0),
        };

        let mut filled = 0;
        let mut consecutive_eof = 0;
        while filled < take {
            let read = primary.read(&mut self.scratch[filled..take])?;
            if read == 0 {
                if !looped {
                    break;
                }
                consecutive_eof += 1;
                if consecutive_eof > 1 {
                    return Err(EngineError::decode_failure(
                        self.path.display().to_string(),
                        "decoder yields no frames",
                    ));
                }
                primary.rewind()?;
                self.file_pos = 0;
                continue;
            }
            consecutive_eof = 0;
            filled += read;
            self.file_pos += read as u64;
        }
        Ok(filled)
    }

    /// Remplit `scratch_arm[..take]` depuis le décodeur de fondu.
    fn fill_arm(&mut self, take: usize) -> Result<usize, EngineError> {
        if self.scratch_arm.len() < take {
            self.scratch_arm.resize(take, SILENT_FRAME);
        }
        let arm = match self.arm.as_mut() {
            Some(arm) => arm,
            None => return Ok(0),
        };
        let mut filled = 0;
        while filled < take {
            let read = arm.read(&mut self.scratch_arm[filled..take])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }

    /// Fin de fenêtre de fondu : le bras devient le décodeur principal.
    fn promote_arm(&mut self, window: u64) {
        self.primary = self.arm.take();
        self.file_pos = window;
        self.state = PlayState::Steady;
    }

    fn release_exclusive(&mut self) {
        if self.settings.exclusive && self.coordinator.active_player() == Some(self.player_id) {
            self.coordinator.finish_playing(self.player_id);
        }
    }

    /// Désactive la piste pour la durée du thème. Journalise une seule fois.
    fn fail(&mut self, error: EngineError) {
        if self.failure.is_none() {
            warn!(track = %self.label, %error, "Track disabled for this theme session");
            self.failure = Some(error.to_string());
        }
        self.release_exclusive();
        self.primary = None;
        self.arm = None;
        self.state = PlayState::Silenced;
        self.last_envelope = 0.0;
    }

    // ── Ordonnancement ────────────────────────────────────────────────────

    /// Fenêtre de fondu de boucle, bornée à la moitié du fichier.
    fn loop_window(&self, duration: u64) -> u64 {
        self.clock
            .secs_to_frames(self.tuning.loop_crossfade_s)
            .min(duration / 2)
    }

    /// Intervalle moyen sparse dérivé du cadran presence.
    fn sparse_mean_frames(&self) -> u64 {
        let mean_s = lerp(
            self.tuning.sparse_max_interval_s,
            self.tuning.sparse_min_interval_s,
            self.settings.presence as f64,
        );
        self.clock.secs_to_frames(mean_s)
    }

    /// Tire le prochain intervalle : uniforme sur moyenne ± variance.
    fn sample_sparse_interval(&mut self) -> u64 {
        let mean = self.sparse_mean_frames() as f64;
        let variance = self.tuning.sparse_variance.clamp(0.0, 1.0);
        let factor = 1.0 + self.rng.gen_range(-variance..=variance);
        ((mean * factor).round() as u64).max(1)
    }

    fn recheck_frames(&mut self) -> u64 {
        let jitter = self.rng.gen_range(0.0..EXCLUSIVE_RECHECK_JITTER_S);
        self.clock.secs_to_frames(EXCLUSIVE_RECHECK_S + jitter)
    }

    fn expected_play_frames(&self) -> u64 {
        self.duration
            .unwrap_or_else(|| self.clock.secs_to_frames(FALLBACK_EXPECTED_PLAY_S))
    }

    fn presence_fade_frames(&self) -> u64 {
        let period = self.clock.secs_to_frames(self.tuning.presence_period_s);
        self.clock
            .secs_to_frames(self.tuning.presence_fade_s)
            .min(period / 2)
    }

    /// Plateau actif : part `presence` de la période, fondu déduit.
    fn presence_plateau_frames(&self) -> u64 {
        let period = self.clock.secs_to_frames(self.tuning.presence_period_s);
        let duty = self.settings.presence.clamp(0.0, 1.0) as f64;
        ((period as f64 * duty) as u64).saturating_sub(self.presence_fade_frames())
    }

    fn presence_inactive_frames(&self) -> u64 {
        let period = self.clock.secs_to_frames(self.tuning.presence_period_s);
        let duty = self.settings.presence.clamp(0.0, 1.0) as f64;
        ((period as f64 * (1.0 - duty)) as u64).saturating_sub(self.presence_fade_frames())
    }

    fn presence_active_until(&self, from: u64) -> u64 {
        if self.settings.presence >= 1.0 {
            u64::MAX
        } else {
            from + self.presence_plateau_frames()
        }
    }

    fn expected_presence_frames(&self) -> u64 {
        self.presence_plateau_frames() + 2 * self.presence_fade_frames()
    }

    // ── Accesseurs ────────────────────────────────────────────────────────

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn settings(&self) -> &TrackSettings {
        &self.settings
    }

    /// Enveloppe de la dernière frame produite, dans [0, 1].
    pub fn last_envelope(&self) -> f32 {
        self.last_envelope
    }

    pub fn is_disabled(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Decoder, DecoderFactory, DecoderInfo};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Décodeur synthétique : `len` frames de valeur constante.
    struct ConstDecoder {
        info: DecoderInfo,
        value: f32,
        len: u64,
        pos: u64,
        fail_after: Option<u64>,
    }

    impl Decoder for ConstDecoder {
        fn info(&self) -> &DecoderInfo {
            &self.info
        }

        fn read(&mut self, out: &mut [Frame]) -> Result<usize, EngineError> {
            let limit = self.fail_after.unwrap_or(u64::MAX).min(self.len);
            if self.pos >= limit && self.pos < self.len {
                return Err(EngineError::decode_failure("synthetic", "forced failure"));
            }
            let remaining = (limit.saturating_sub(self.pos)).min(out.len() as u64) as usize;
            for frame in out[..remaining].iter_mut() {
                *frame = [self.value, self.value];
            }
            self.pos += remaining as u64;
            Ok(remaining)
        }

        fn rewind(&mut self) -> Result<(), EngineError> {
            self.pos = 0;
            Ok(())
        }
    }

    struct ConstFactory {
        value: f32,
        len: u64,
        fail_open: bool,
        fail_after: Option<u64>,
        opened: AtomicUsize,
    }

    impl ConstFactory {
        fn new(value: f32, len: u64) -> Self {
            Self {
                value,
                len,
                fail_open: false,
                fail_after: None,
                opened: AtomicUsize::new(0),
            }
        }
    }

    impl DecoderFactory for ConstFactory {
        fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, EngineError> {
            if self.fail_open {
                return Err(EngineError::decode_failure(path.display().to_string(), "cannot open"));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ConstDecoder {
                info: DecoderInfo {
                    sample_rate: 48_000,
                    source_sample_rate: 48_000,
                    channels: 2,
                    duration_frames: Some(self.len),
                },
                value: self.value,
                len: self.len,
                pos: 0,
                fail_after: self.fail_after,
            }))
        }
    }

    fn build_player(
        settings: TrackSettings,
        tuning: ThemeTuning,
        factory: Arc<ConstFactory>,
        initial_delay_s: f64,
    ) -> (RecordingPlayer, Arc<FrameClock>, Arc<ExclusionCoordinator>) {
        let clock = Arc::new(FrameClock::new(48_000));
        let coordinator = Arc::new(ExclusionCoordinator::new(
            Arc::clone(&clock),
            tuning.min_gap_after_exclusive_s,
            initial_delay_s,
        ));
        let player = RecordingPlayer::new(
            0,
            PathBuf::from("synthetic.flac"),
            settings,
            tuning,
            factory,
            Arc::clone(&clock),
            Arc::clone(&coordinator),
            42,
        )
        .unwrap();
        (player, clock, coordinator)
    }

    fn pull(player: &mut RecordingPlayer, clock: &FrameClock, n: usize) -> Vec<Frame> {
        let mut acc = vec![SILENT_FRAME; n];
        player.mix_into(&mut acc);
        clock.advance(n as u64);
        acc
    }

    #[test]
    fn test_continuous_seamless_has_no_gap() {
        let factory = Arc::new(ConstFactory::new(0.5, 100));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Continuous,
            seamless_loop: true,
            ..Default::default()
        };
        let (mut player, clock, _) =
            build_player(settings, ThemeTuning::default(), factory, 0.0);

        // 10 boucles complètes : aucune frame nulle
        let out = pull(&mut player, &clock, 1000);
        for (i, frame) in out.iter().enumerate() {
            assert!((frame[0] - 0.5).abs() < 1e-6, "gap at frame {}", i);
        }
        assert_eq!(player.last_envelope(), 1.0);
    }

    #[test]
    fn test_continuous_crossfade_is_equal_power() {
        // Fichier de 2 s, fondu de boucle de 0.5 s sur une valeur constante :
        // pendant la fenêtre, sortie = c·(cos θ + sin θ).
        let len = 96_000u64;
        let factory = Arc::new(ConstFactory::new(0.25, len));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Continuous,
            seamless_loop: false,
            ..Default::default()
        };
        let tuning = ThemeTuning {
            loop_crossfade_s: 0.5,
            ..Default::default()
        };
        let (mut player, clock, _) = build_player(settings, tuning, Arc::clone(&factory), 0.0);

        let window = 24_000u64;
        let fade_start = (len - window) as usize;
        let out = pull(&mut player, &clock, len as usize);

        // Avant le fondu : valeur nominale
        assert!((out[fade_start - 1][0] - 0.25).abs() < 1e-5);
        // Au milieu du fondu : c·(cos 45° + sin 45°) = c·√2
        let mid = fade_start + window as usize / 2;
        let expected = 0.25 * std::f32::consts::SQRT_2;
        assert!(
            (out[mid][0] - expected).abs() < 1e-3,
            "mid-fade {} vs {}",
            out[mid][0],
            expected
        );
        // Deux décodeurs ouverts en tout : primaire + bras
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);

        // Après promotion, le flux repart sans discontinuité
        let out = pull(&mut player, &clock, 4800);
        assert!((out[0][0] - 0.25).abs() < 1e-5);
        assert!((out[4799][0] - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_sparse_plays_then_waits() {
        let len = 480u64; // 10 ms
        let factory = Arc::new(ConstFactory::new(1.0, len));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Sparse,
            presence: 1.0,
            ..Default::default()
        };
        let tuning = ThemeTuning {
            sparse_min_interval_s: 0.05,
            sparse_max_interval_s: 0.5,
            sparse_variance: 0.0,
            ..Default::default()
        };
        let (mut player, clock, _) = build_player(settings, tuning, factory, 0.0);

        // Simuler 5 s : on doit observer plusieurs lectures séparées de
        // silence
        let mut audible_frames = 0u64;
        let mut activations = 0u32;
        let mut was_audible = false;
        for _ in 0..500 {
            let out = pull(&mut player, &clock, 480);
            let audible = out.iter().any(|f| f[0].abs() > 1e-6);
            audible_frames += out.iter().filter(|f| f[0].abs() > 1e-6).count() as u64;
            if audible && !was_audible {
                activations += 1;
            }
            was_audible = audible;
        }
        assert!(activations >= 2, "activations: {}", activations);
        // Les lectures sont intégrales : le volume audible total est un
        // multiple de la longueur du fichier, à une lecture en cours près.
        assert!(audible_frames >= len * activations as u64 - len);
    }

    #[test]
    fn test_sparse_closes_decoder_between_plays() {
        let factory = Arc::new(ConstFactory::new(1.0, 480));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Sparse,
            presence: 1.0,
            ..Default::default()
        };
        let tuning = ThemeTuning {
            sparse_min_interval_s: 0.05,
            sparse_max_interval_s: 0.05,
            sparse_variance: 0.0,
            ..Default::default()
        };
        let (mut player, clock, _) = build_player(settings, tuning, Arc::clone(&factory), 0.0);

        for _ in 0..300 {
            pull(&mut player, &clock, 480);
        }
        // Classement + une ouverture par lecture
        assert!(factory.opened.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_auto_mode_classifies_short_file_as_sparse() {
        // 5 s < seuil court de 10 s
        let factory = Arc::new(ConstFactory::new(1.0, 5 * 48_000));
        let settings = TrackSettings::default();
        let (player, _, _) = build_player(settings, ThemeTuning::default(), factory, 0.0);
        assert_eq!(player.mode(), PlaybackMode::Sparse);
    }

    #[test]
    fn test_auto_mode_classifies_long_file_as_continuous() {
        let factory = Arc::new(ConstFactory::new(1.0, 120 * 48_000));
        let settings = TrackSettings::default();
        let (player, _, _) = build_player(settings, ThemeTuning::default(), factory, 0.0);
        assert_eq!(player.mode(), PlaybackMode::Continuous);
    }

    #[test]
    fn test_muted_track_produces_exact_zeros() {
        let factory = Arc::new(ConstFactory::new(1.0, 48_000));
        let settings = TrackSettings {
            muted: true,
            ..Default::default()
        };
        let (mut player, clock, _) =
            build_player(settings, ThemeTuning::default(), Arc::clone(&factory), 0.0);

        let out = pull(&mut player, &clock, 4800);
        assert!(out.iter().all(|f| f[0] == 0.0 && f[1] == 0.0));
        // Aucun décodage
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_failure_silences_track_once() {
        let mut factory = ConstFactory::new(1.0, 48_000);
        factory.fail_after = Some(1000);
        let factory = Arc::new(factory);
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Continuous,
            seamless_loop: true,
            ..Default::default()
        };
        let (mut player, clock, _) =
            build_player(settings, ThemeTuning::default(), factory, 0.0);

        let _ = pull(&mut player, &clock, 4800);
        assert!(player.is_disabled());
        let reason = player.failure().unwrap().to_string();

        // Les tirages suivants restent silencieux, sans nouvelle erreur
        let out = pull(&mut player, &clock, 4800);
        assert!(out.iter().all(|f| f[0] == 0.0));
        assert_eq!(player.failure().unwrap(), reason);
        assert_eq!(player.last_envelope(), 0.0);
    }

    #[test]
    fn test_presence_duty_cycle_modulates_envelope() {
        let factory = Arc::new(ConstFactory::new(1.0, 48_000));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Presence,
            presence: 0.5,
            ..Default::default()
        };
        let tuning = ThemeTuning {
            presence_period_s: 2.0,
            presence_fade_s: 0.25,
            ..Default::default()
        };
        let (mut player, clock, _) = build_player(settings, tuning, factory, 0.0);

        // Sur 10 périodes, environ la moitié des frames est audible
        let total = 20 * 48_000usize;
        let mut audible = 0u64;
        for _ in 0..(total / 4800) {
            let out = pull(&mut player, &clock, 4800);
            audible += out.iter().filter(|f| f[0].abs() > 1e-6).count() as u64;
        }
        let ratio = audible as f64 / total as f64;
        assert!(
            (0.3..=0.7).contains(&ratio),
            "audible ratio {} out of expected band",
            ratio
        );
    }

    #[test]
    fn test_presence_zero_is_never_audible() {
        let factory = Arc::new(ConstFactory::new(1.0, 48_000));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Presence,
            presence: 0.0,
            ..Default::default()
        };
        let (mut player, clock, _) =
            build_player(settings, ThemeTuning::default(), factory, 0.0);

        for _ in 0..100 {
            let out = pull(&mut player, &clock, 4800);
            assert!(out.iter().all(|f| f[0] == 0.0));
        }
    }

    #[test]
    fn test_exclusive_sparse_respects_initial_floor() {
        let factory = Arc::new(ConstFactory::new(1.0, 480));
        let settings = TrackSettings {
            playback_mode: PlaybackMode::Sparse,
            presence: 1.0,
            exclusive: true,
            ..Default::default()
        };
        let tuning = ThemeTuning {
            sparse_min_interval_s: 0.01,
            sparse_max_interval_s: 0.01,
            sparse_variance: 0.0,
            sparse_startup_delay_s: 0.0,
            ..Default::default()
        };
        // Plancher initial d'une seconde
        let (mut player, clock, _) = build_player(settings, tuning, factory, 1.0);

        // Première seconde : jamais audible
        for _ in 0..100 {
            let out = pull(&mut player, &clock, 480);
            assert!(out.iter().all(|f| f[0] == 0.0));
        }
        // Ensuite, une activation finit par être accordée
        let mut heard = false;
        for _ in 0..2000 {
            let out = pull(&mut player, &clock, 480);
            if out.iter().any(|f| f[0].abs() > 1e-6) {
                heard = true;
                break;
            }
        }
        assert!(heard);
    }
}

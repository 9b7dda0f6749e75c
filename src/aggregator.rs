//! The 1 Hz aggregation engine.
//!
//! Every second: snapshot the active users, fold their windows into
//! state ratios and event densities, walk the priority ladder top-down,
//! and emit at most one effect. The effect row is persisted before the
//! broadcast so the record survives send failures. A panic inside the
//! computation is caught at the tick boundary; an overrunning tick is
//! logged and the missed ticks are skipped, never queued.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::clock::now_ms;
use crate::db::{Database, EffectRecord};
use crate::hub::Hub;
use crate::messages::{EffectDebug, EffectType, EventDensity, RatioState, ServerFrame};
use crate::store::{ActiveSnapshot, ReactionStore, WINDOW_SIZE};

pub const TICK_INTERVAL_MS: u64 = 1000;
/// Fixed display duration for every ladder-chosen effect.
pub const EFFECT_DURATION_MS: i64 = 2000;

/// One ladder verdict: the chosen effect, its clamped intensity, and the
/// numbers that justified it.
#[derive(Debug, Clone)]
pub struct Decision {
    pub effect_type: EffectType,
    pub intensity: f64,
    pub debug: EffectDebug,
}

pub struct Aggregator {
    store: Arc<ReactionStore>,
    hub: Arc<Hub>,
    db: Database,
}

impl Aggregator {
    pub fn new(store: Arc<ReactionStore>, hub: Arc<Hub>, db: Database) -> Self {
        Self { store, hub, db }
    }

    /// Tick loop. Runs until the shutdown watch flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_millis(TICK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("aggregator started ({TICK_INTERVAL_MS} ms tick)");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!("aggregator stopped");
                    return;
                }
            }
        }
    }

    async fn tick(&self) {
        let t = now_ms();
        let active = self.store.snapshot_active(t);
        if active.is_empty() {
            debug!("aggregation tick: no active users");
            return;
        }

        let decision = match panic::catch_unwind(AssertUnwindSafe(|| decide(&active))) {
            Ok(decision) => decision,
            Err(_) => {
                error!("aggregation tick panicked; skipping this tick");
                return;
            }
        };
        let Some(decision) = decision else {
            debug!(
                "aggregation tick: {} active users, no threshold met",
                active.len()
            );
            return;
        };

        let record = EffectRecord {
            timestamp: t,
            effect_type: decision.effect_type,
            intensity: decision.intensity,
            duration_ms: EFFECT_DURATION_MS,
            session_id: None,
            video_time: None,
            active_users: Some(decision.debug.active_users as i64),
        };
        if let Err(e) = self.db.log_effect(&record).await {
            error!("persisting effect failed: {e}");
        }

        self.hub.broadcast(&ServerFrame::Effect {
            effect_type: decision.effect_type,
            intensity: decision.intensity,
            duration_ms: EFFECT_DURATION_MS,
            timestamp: t,
            debug: Some(decision.debug),
        });
        info!(
            "effect {} intensity {:.2} ({} active users)",
            decision.effect_type.name(),
            decision.intensity,
            decision.debug.active_users
        );

        let elapsed = now_ms() - t;
        if elapsed > TICK_INTERVAL_MS as i64 {
            warn!("aggregation tick overran its budget: {elapsed} ms");
        }
    }
}

/// Fraction of active users who held each state in at least one sample of
/// their window. One missed frame does not flip a user's state off.
pub fn state_ratios(active: &ActiveSnapshot) -> RatioState {
    let users = active.len() as f64;
    let mut ratio = RatioState::default();
    if active.is_empty() {
        return ratio;
    }
    for samples in active.values() {
        let mut held = (false, false, false, false);
        for sample in samples {
            held.0 |= sample.states.is_smiling;
            held.1 |= sample.states.is_surprised;
            held.2 |= sample.states.is_concentrating;
            held.3 |= sample.states.is_hand_up;
        }
        ratio.is_smiling += f64::from(held.0 as u8);
        ratio.is_surprised += f64::from(held.1 as u8);
        ratio.is_concentrating += f64::from(held.2 as u8);
        ratio.is_hand_up += f64::from(held.3 as u8);
    }
    ratio.is_smiling /= users;
    ratio.is_surprised /= users;
    ratio.is_concentrating /= users;
    ratio.is_hand_up /= users;
    ratio
}

/// Events per user per second. The divisor is always `|A| * W`, so a user
/// with a partial window contributes proportionally less.
pub fn event_densities(active: &ActiveSnapshot) -> EventDensity {
    let mut density = EventDensity::default();
    if active.is_empty() {
        return density;
    }
    for samples in active.values() {
        for sample in samples {
            density.nod += f64::from(sample.events.nod);
            density.shake_head += f64::from(sample.events.shake_head);
            density.sway_vertical += f64::from(sample.events.sway_vertical);
            density.sway_horizontal += f64::from(sample.events.sway_horizontal);
            density.cheer += f64::from(sample.events.cheer);
            density.clap += f64::from(sample.events.clap);
        }
    }
    let divisor = (active.len() * WINDOW_SIZE) as f64;
    density.nod /= divisor;
    density.shake_head /= divisor;
    density.sway_vertical /= divisor;
    density.sway_horizontal /= divisor;
    density.cheer /= divisor;
    density.clap /= divisor;
    density
}

/// Walk the priority ladder top-down and return the first effect whose
/// predicate holds. Thresholds compare with `>=`; the intensity is
/// clamped to [0, 1] after its formula.
pub fn decide(active: &ActiveSnapshot) -> Option<Decision> {
    if active.is_empty() {
        return None;
    }
    let ratio = state_ratios(active);
    let density = event_densities(active);

    let picked = if ratio.is_hand_up >= 0.30 {
        Some((EffectType::Cheer, ratio.is_hand_up))
    } else if ratio.is_surprised >= 0.30 {
        Some((EffectType::Excitement, ratio.is_surprised))
    } else if density.clap >= 0.15 {
        Some((EffectType::ClappingIcons, density.clap / 0.8))
    } else if density.sway_vertical >= 0.20 {
        Some((EffectType::Bounce, density.sway_vertical))
    } else if density.shake_head >= 0.20 {
        Some((EffectType::Shimmer, density.shake_head))
    } else if density.sway_horizontal >= 0.20 {
        Some((EffectType::Groove, density.sway_horizontal))
    } else if density.cheer >= 0.15 {
        Some((EffectType::Wave, density.cheer / 0.8))
    } else if density.nod >= 0.30 {
        Some((EffectType::Wave, density.nod / 0.5))
    } else if ratio.is_smiling >= 0.35 {
        Some((EffectType::Sparkle, ratio.is_smiling))
    } else if ratio.is_concentrating >= 0.40 {
        Some((EffectType::Focus, ratio.is_concentrating))
    } else {
        None
    };

    picked.map(|(effect_type, raw_intensity)| Decision {
        effect_type,
        intensity: raw_intensity.clamp(0.0, 1.0),
        debug: EffectDebug {
            active_users: active.len(),
            ratio_state: ratio,
            density_event: density,
        },
    })
}

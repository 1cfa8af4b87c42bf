//! The `schedule_wave` graph node.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::events::topic;
use crate::graph::{MissionContext, MissionNode, NodeName};
use crate::metrics::name as metric;
use crate::mission::model::MissionStatus;
use crate::mission::{MissionPatch, MissionState};

use super::{Oscillation, OscillationDetector, next_wave};

/// Computes the next wave and guards against scheduling oscillation.
///
/// The oscillation window is in-memory only: it restarts empty after a
/// checkpoint resume, which merely delays detection by one window.
pub struct ScheduleWaveNode {
    detector: Mutex<Option<OscillationDetector>>,
}

impl ScheduleWaveNode {
    pub fn new() -> Self {
        Self {
            detector: Mutex::new(None),
        }
    }
}

impl Default for ScheduleWaveNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MissionNode for ScheduleWaveNode {
    fn name(&self) -> NodeName {
        NodeName::ScheduleWave
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let wave = next_wave(
            &state.tasks,
            &state.completed_task_ids,
            state.execution_strategy,
            ctx.config.dispatch.max_parallel,
        );

        let mut patch = MissionPatch {
            status: Some(MissionStatus::Executing),
            ..MissionPatch::default()
        };

        if wave.is_empty() {
            tracing::info!(
                mission_id = %state.mission_id,
                wave_count = state.wave_count,
                "no ready tasks, converging"
            );
            patch.wave_task_ids = Some(Vec::new());
            // Converge owns the terminal status; EXECUTING stays in place
            // so a FAILED mission is not overwritten here.
            if state.status == MissionStatus::Failed {
                patch.status = None;
            }
            return Ok(patch);
        }

        let wave_count = state.wave_count + 1;
        let oscillation = {
            let mut guard = self.detector.lock().unwrap_or_else(|e| e.into_inner());
            let detector = guard.get_or_insert_with(|| {
                OscillationDetector::new(
                    ctx.config.dispatch.oscillation_window,
                    ctx.config.dispatch.oscillation_threshold,
                )
            });
            detector.observe(&wave, wave_count)
        };

        match oscillation {
            Oscillation::Detected => {
                tracing::warn!(
                    mission_id = %state.mission_id,
                    wave = ?wave,
                    wave_count = wave_count,
                    "oscillation detected, forcing convergence"
                );
                ctx.metrics
                    .incr_counter(metric::OSCILLATION_DETECTED_TOTAL, &[]);
                ctx.events.publish(
                    topic::OSCILLATION_DETECTED,
                    &state.mission_id,
                    None,
                    serde_json::json!({ "wave": wave, "wave_count": wave_count }),
                );

                patch.wave_task_ids = Some(Vec::new());
                patch.errors.push(format!(
                    "oscillation_detected: wave {:?} repeated without progress after {} waves",
                    wave, wave_count
                ));
                return Ok(patch);
            }
            Oscillation::Repeating => {
                let cooldown = ctx.config.dispatch.wave_cooldown_seconds;
                if cooldown > 0 {
                    tracing::info!(
                        mission_id = %state.mission_id,
                        cooldown_seconds = cooldown,
                        "repeating wave, cooling down before dispatch"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(cooldown)) => {}
                        _ = ctx.cancel.cancelled() => {}
                    }
                }
            }
            Oscillation::None => {}
        }

        tracing::info!(
            mission_id = %state.mission_id,
            wave = ?wave,
            wave_count = wave_count,
            "wave scheduled"
        );
        ctx.events.publish(
            topic::WAVE_SCHEDULED,
            &state.mission_id,
            None,
            serde_json::json!({ "wave": wave, "wave_count": wave_count }),
        );

        patch.wave_task_ids = Some(wave);
        patch.wave_count = Some(wave_count);
        Ok(patch)
    }
}

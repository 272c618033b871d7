//! Pair pipeline scheduler: fixed-step logical updates plus display-rate
//! visual updates.
//!
//! The logical pipeline advances on an accumulator until logical time
//! catches up with visual time. When the hardware cannot keep up, the
//! advance loop is clamped by `max_logical_advance_time_ns` and visual
//! time snaps back to logical time, trading smoothness for survival.

use crate::{SchedulerInterface, WorldScheduler};
use kiln_base::{intern, InternedString};
use lazy_static::lazy_static;
use std::time::Instant;

pub const LOGICAL_PIPELINE_NAME: &str = "logical_update";
pub const VISUAL_PIPELINE_NAME: &str = "visual_update";

#[derive(Clone, Copy, Debug)]
pub struct PairPipelineSettings {
    pub logical_time_step_ns: u64,
    pub max_logical_advance_time_ns: u64,
}

impl Default for PairPipelineSettings {
    fn default() -> PairPipelineSettings {
        PairPipelineSettings {
            // 60 logical updates per second.
            logical_time_step_ns: 16_666_667,
            max_logical_advance_time_ns: 50_000_000,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TimeState {
    pub logical_time_ns: u64,
    pub logical_delta_ns: u64,
    pub visual_time_ns: u64,
    pub visual_delta_ns: u64,
    pub visual_unscaled_delta_ns: u64,
    pub scale: f32,
}

impl Default for TimeState {
    fn default() -> TimeState {
        TimeState {
            logical_time_ns: 0,
            logical_delta_ns: 0,
            visual_time_ns: 0,
            visual_delta_ns: 0,
            visual_unscaled_delta_ns: 0,
            scale: 1.0,
        }
    }
}

lazy_static! {
    static ref CLOCK_EPOCH: Instant = Instant::now();
}

fn monotonic_ns() -> u64 {
    CLOCK_EPOCH.elapsed().as_nanos() as u64
}

pub struct PairPipelineScheduler {
    settings: PairPipelineSettings,
    time: TimeState,
    last_update_time_ns: Option<u64>,
    logical_pipeline: InternedString,
    visual_pipeline: InternedString,
    clock: Box<dyn Fn() -> u64 + Send>,
}

impl PairPipelineScheduler {
    pub fn new(settings: PairPipelineSettings) -> PairPipelineScheduler {
        PairPipelineScheduler::with_clock(settings, monotonic_ns)
    }

    /// Injectable clock, for tests and replay.
    pub fn with_clock(
        settings: PairPipelineSettings,
        clock: impl Fn() -> u64 + Send + 'static,
    ) -> PairPipelineScheduler {
        PairPipelineScheduler {
            settings,
            time: TimeState::default(),
            last_update_time_ns: None,
            logical_pipeline: intern(LOGICAL_PIPELINE_NAME),
            visual_pipeline: intern(VISUAL_PIPELINE_NAME),
            clock: Box::new(clock),
        }
    }

    pub fn time(&self) -> TimeState {
        self.time
    }

    pub fn set_time_scale(&mut self, scale: f32) {
        self.time.scale = scale;
    }
}

impl WorldScheduler for PairPipelineScheduler {
    fn execute(&mut self, interface: &dyn SchedulerInterface) {
        let current = (self.clock)();
        // First update is intentionally zero.
        let delta_ns = match self.last_update_time_ns {
            Some(last) => current.saturating_sub(last),
            None => 0,
        };
        self.last_update_time_ns = Some(current);

        let scaled_delta_ns = (delta_ns as f32 * self.time.scale) as u64;
        self.time.visual_time_ns += scaled_delta_ns;
        self.time.visual_delta_ns = scaled_delta_ns;
        self.time.visual_unscaled_delta_ns = delta_ns;

        // Advance logical time until it is ahead of visual time.
        let advance_begin_ns = (self.clock)();
        let advance_begin_logical_ns = self.time.logical_time_ns;
        loop {
            let advance_time_spent = (self.clock)().saturating_sub(advance_begin_ns);
            if advance_time_spent > self.settings.max_logical_advance_time_ns {
                // Unable to advance on time; snap visual time back instead
                // of spiralling.
                self.time.visual_time_ns = self.time.logical_time_ns;
                self.time.visual_delta_ns =
                    self.time.logical_time_ns - advance_begin_logical_ns;
                break;
            }

            if self.time.logical_time_ns <= self.time.visual_time_ns {
                self.time.logical_time_ns += self.settings.logical_time_step_ns;
                self.time.logical_delta_ns = self.settings.logical_time_step_ns;
                interface.run_pipeline(self.logical_pipeline);
            } else {
                break;
            }
        }

        interface.run_pipeline(self.visual_pipeline);
        interface.update_all_children();
    }
}

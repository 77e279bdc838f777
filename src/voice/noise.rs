//! Input noise cancellation
//!
//! A light-weight suppressor applied to room input before VAD: a one-pole
//! high-pass removes rumble and DC offset, then an adaptive gate attenuates
//! samples close to the tracked noise floor.

const HIGH_PASS_CUTOFF_HZ: f32 = 80.0;
const GATE_RATIO: f32 = 1.5;
const GATE_ATTENUATION: f32 = 0.1;
const FLOOR_ATTACK: f32 = 0.001;
const FLOOR_RELEASE: f32 = 0.05;
const MIN_FLOOR: f32 = 1e-4;

#[derive(Debug, Clone)]
pub struct NoiseSuppressor {
    alpha: f32,
    prev_input: f32,
    prev_output: f32,
    /// Tracked magnitude of the background
    floor: f32,
}

impl NoiseSuppressor {
    pub fn new(sample_rate: u32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * HIGH_PASS_CUTOFF_HZ);
        let dt = 1.0 / sample_rate.max(1) as f32;
        Self {
            alpha: rc / (rc + dt),
            prev_input: 0.0,
            prev_output: 0.0,
            floor: MIN_FLOOR,
        }
    }

    /// Filter `samples` in place
    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let filtered = self.alpha * (self.prev_output + *sample - self.prev_input);
            self.prev_input = *sample;
            self.prev_output = filtered;

            let magnitude = filtered.abs();
            // Floor rises slowly and falls quickly, so speech does not drag it up
            let rate = if magnitude > self.floor { FLOOR_ATTACK } else { FLOOR_RELEASE };
            self.floor = (self.floor + (magnitude - self.floor) * rate).max(MIN_FLOOR);

            *sample = if magnitude < self.floor * GATE_RATIO {
                filtered * GATE_ATTENUATION
            } else {
                filtered
            };
        }
    }

    pub fn reset(&mut self) {
        self.prev_input = 0.0;
        self.prev_output = 0.0;
        self.floor = MIN_FLOOR;
    }
}

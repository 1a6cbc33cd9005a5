//! Demo source that generates a synthetic drive cycle
//!
//! Simulates a rear-wheel-drive car with a six-speed gearbox, driven through
//! repeating cycles: a launch or a pull to the rev limiter, upshifts through
//! every gear, a long clutch-in coast and braking back down. Produces
//! physically consistent samples at 60Hz without requiring an actual game:
//! with the clutch engaged, engine RPM always matches the wheel speed through
//! the selected gear.

use anyhow::Result;
use gst_core::{adapter::SampleSource, model::*, units::*};
use std::f32::consts::TAU;
use tracing::debug;

// =============================================================================
// Car definition
// =============================================================================

/// Seconds per sample
const TICK: f32 = 1.0 / 60.0;

/// Engine revolutions per wheel revolution, first gear first
pub const GEAR_RATIOS: [f32; 6] = [14.0, 10.0, 7.6, 6.0, 4.9, 4.1];

pub const REV_LIMIT: f32 = 7500.0;
pub const CAR_ORDINAL: i32 = 3318;

const TYRE_RADIUS: f32 = 0.33;
const MASS: f32 = 1300.0;
const DRIVELINE_EFFICIENCY: f32 = 0.9;
const IDLE_RPM: f32 = 900.0;
const ENGINE_MAX_RPM: f32 = 8000.0;
const UPSHIFT_RPM: f32 = 7000.0;

/// Crank torque in Nm, peaking at 4500 RPM
fn engine_torque(rpm: f32) -> f32 {
    let x = (rpm - 4500.0) / 3000.0;
    (420.0 - 150.0 * x * x).max(100.0)
}

/// Rolling resistance plus aero drag, in m/s^2
fn drag(speed: f32) -> f32 {
    0.15 + 0.00065 * speed * speed
}

fn gear_ratio(gear: i8) -> f32 {
    GEAR_RATIOS[(gear.clamp(1, GEAR_RATIOS.len() as i8) - 1) as usize]
}

fn rpm_at(speed: f32, gear: i8) -> f32 {
    speed / TYRE_RADIUS * gear_ratio(gear) * 60.0 / TAU
}

fn speed_at(rpm: f32, gear: i8) -> f32 {
    rpm * TAU / 60.0 / gear_ratio(gear) * TYRE_RADIUS
}

fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

// =============================================================================
// Driver behaviour
// =============================================================================

/// RPM the simulated driver upshifts at
const DRIVER_SHIFT_RPM: f32 = 6800.0;

/// RPM in top gear where the driver lifts and coasts
const COAST_RPM: f32 = 6000.0;

/// RPM a pull starts from
const PULL_START_RPM: f32 = 3000.0;

/// Highest RPM the driver downshifts into while braking
const DOWNSHIFT_RPM: f32 = 4500.0;

const LIMITER_DIP: f32 = 60.0;
const LIMITER_SAMPLES: u32 = 30;
const LIFT_SAMPLES: u32 = 3;
const CLUTCH_SAMPLES: u32 = 3;
const COAST_SAMPLES: u32 = 480;
const BRAKE_RAMP_SAMPLES: u32 = 20;
const BRAKE_PRESSURE: f32 = 0.8;
const BRAKE_DECEL: f32 = 9.0;

/// How a cycle starts
#[derive(Debug, Clone, Copy, PartialEq)]
enum CycleStart {
    /// From walking pace in first gear
    Launch,
    /// From low RPM in this gear, held against the limiter
    Pull(i8),
}

const CYCLES: [CycleStart; 3] = [CycleStart::Launch, CycleStart::Pull(3), CycleStart::Pull(4)];

impl CycleStart {
    fn gear(self) -> i8 {
        match self {
            CycleStart::Launch => 1,
            CycleStart::Pull(gear) => gear,
        }
    }

    fn speed(self) -> f32 {
        match self {
            CycleStart::Launch => 4.0,
            CycleStart::Pull(gear) => speed_at(PULL_START_RPM, gear),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Full throttle, upshifting at the driver's shift point
    Accelerate,
    Limiter { step: u32 },
    /// Lift, clutch in, next gear
    Shift { step: u32 },
    /// Clutch in, no pedals
    Coast { step: u32 },
    Brake { step: u32 },
}

/// Pedal and gearbox state for one sample
struct Controls {
    throttle: f32,
    brake: f32,
    clutch: f32,
    in_gear: bool,
}

impl Controls {
    fn driving(throttle: f32) -> Self {
        Self {
            throttle,
            brake: 0.0,
            clutch: 0.0,
            in_gear: true,
        }
    }
}

// =============================================================================
// DemoAdapter
// =============================================================================

pub struct DemoAdapter {
    active: bool,
    sample_count: u64,
    cycle: usize,
    phase: Phase,
    pull_gear: Option<i8>,
    gear: i8,
    speed: f32,
    rpm: f32,
}

impl DemoAdapter {
    pub fn new() -> Self {
        let mut adapter = Self {
            active: false,
            sample_count: 0,
            cycle: 0,
            phase: Phase::Accelerate,
            pull_gear: None,
            gear: 1,
            speed: 0.0,
            rpm: IDLE_RPM,
        };
        adapter.begin_cycle(0);
        adapter
    }

    fn begin_cycle(&mut self, cycle: usize) {
        let start = CYCLES[cycle % CYCLES.len()];
        self.cycle = cycle % CYCLES.len();
        self.phase = Phase::Accelerate;
        self.pull_gear = match start {
            CycleStart::Launch => None,
            CycleStart::Pull(gear) => Some(gear),
        };
        self.gear = start.gear();
        self.speed = start.speed();
        self.rpm = rpm_at(self.speed, self.gear);
        debug!("Demo cycle {:?} in gear {}", start, self.gear);
    }

    /// Acceleration from the engine at `throttle` in the current gear
    fn drive_accel(&self, throttle: f32) -> f32 {
        throttle * engine_torque(self.rpm) * gear_ratio(self.gear) * DRIVELINE_EFFICIENCY
            / (TYRE_RADIUS * MASS)
    }

    /// Advance the simulation by one sample
    fn step(&mut self) -> Controls {
        match self.phase {
            Phase::Accelerate => {
                self.speed += (self.drive_accel(1.0) - drag(self.speed)) * TICK;
                self.rpm = rpm_at(self.speed, self.gear);

                let top_gear = self.gear as usize == GEAR_RATIOS.len();
                if self.pull_gear == Some(self.gear) {
                    if self.rpm >= REV_LIMIT {
                        self.rpm = REV_LIMIT;
                        self.speed = speed_at(REV_LIMIT, self.gear);
                        self.phase = Phase::Limiter { step: 0 };
                    }
                } else if top_gear && self.rpm >= COAST_RPM {
                    self.phase = Phase::Coast { step: 0 };
                } else if !top_gear && self.rpm >= DRIVER_SHIFT_RPM {
                    self.phase = Phase::Shift { step: 0 };
                }
                Controls::driving(1.0)
            }

            Phase::Limiter { step } => {
                self.rpm = if step % 2 == 0 {
                    REV_LIMIT - LIMITER_DIP
                } else {
                    REV_LIMIT
                };
                self.speed = speed_at(self.rpm, self.gear);

                if step + 1 >= LIMITER_SAMPLES {
                    self.pull_gear = None;
                    self.phase = Phase::Shift { step: 0 };
                } else {
                    self.phase = Phase::Limiter { step: step + 1 };
                }
                Controls::driving(1.0)
            }

            Phase::Shift { step } if step < LIFT_SAMPLES => {
                self.speed += (self.drive_accel(0.3) - drag(self.speed)) * TICK;
                self.rpm = rpm_at(self.speed, self.gear);
                self.phase = Phase::Shift { step: step + 1 };
                Controls::driving(0.3)
            }

            Phase::Shift { step } if step < LIFT_SAMPLES + CLUTCH_SAMPLES => {
                self.speed -= drag(self.speed) * TICK;
                let target = rpm_at(self.speed, self.gear + 1);
                self.rpm = lerp(self.rpm, target, 0.4);
                self.phase = Phase::Shift { step: step + 1 };
                Controls {
                    throttle: 0.3,
                    brake: 0.0,
                    clutch: 1.0,
                    in_gear: false,
                }
            }

            Phase::Shift { .. } => {
                self.gear += 1;
                self.rpm = rpm_at(self.speed, self.gear);
                self.speed += (self.drive_accel(0.6) - drag(self.speed)) * TICK;
                self.rpm = rpm_at(self.speed, self.gear);
                self.phase = Phase::Accelerate;
                Controls::driving(0.6)
            }

            Phase::Coast { step } => {
                self.speed -= drag(self.speed) * TICK;
                self.rpm = (self.rpm * 0.98).max(IDLE_RPM);
                self.phase = if step + 1 >= COAST_SAMPLES {
                    Phase::Brake { step: 0 }
                } else {
                    Phase::Coast { step: step + 1 }
                };
                Controls {
                    throttle: 0.0,
                    brake: 0.0,
                    clutch: 1.0,
                    in_gear: true,
                }
            }

            Phase::Brake { step } => {
                let next = CYCLES[(self.cycle + 1) % CYCLES.len()];
                let brake = BRAKE_PRESSURE * smoothstep(step as f32 / BRAKE_RAMP_SAMPLES as f32);

                self.speed = (self.speed - (brake * BRAKE_DECEL + drag(self.speed)) * TICK).max(0.0);
                if self.gear > next.gear() && rpm_at(self.speed, self.gear - 1) <= DOWNSHIFT_RPM {
                    self.gear -= 1;
                }
                self.rpm = rpm_at(self.speed, self.gear);

                if self.gear == next.gear() && self.speed <= next.speed() {
                    self.begin_cycle(self.cycle + 1);
                } else {
                    self.phase = Phase::Brake { step: step + 1 };
                }
                Controls {
                    throttle: 0.0,
                    brake,
                    clutch: 0.0,
                    in_gear: true,
                }
            }
        }
    }

    fn generate_sample(&mut self) -> Sample {
        // Gear and RPM as they were when the controls applied
        let controls = self.step();
        let sample = Sample {
            index: self.sample_count,
            car_ordinal: CAR_ORDINAL,
            rpm: Rpm(self.rpm),
            upshift_rpm: Rpm(UPSHIFT_RPM),
            engine_max_rpm: Rpm(ENGINE_MAX_RPM),
            boost: 0.0,
            torque: None,
            power: None,
            gear: self.gear,
            in_gear: controls.in_gear,
            drivetrain: Drivetrain::Rwd,
            gear_count: Some(GEAR_RATIOS.len() as u8),
            speed: MetersPerSecond(self.speed),
            wheel_speeds: WheelSpeeds::uniform(RadiansPerSecond(self.speed / TYRE_RADIUS)),
            throttle: Percentage::new(controls.throttle),
            brake: Percentage::new(controls.brake),
            clutch: Percentage::new(controls.clutch),
            handbrake: false,
            on_track: true,
            loading: false,
            paused: false,
        };
        self.sample_count += 1;
        sample
    }
}

impl Default for DemoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for DemoAdapter {
    fn name(&self) -> &str {
        "Demo"
    }

    fn start(&mut self) -> Result<()> {
        *self = Self::new();
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.active = false;
        Ok(())
    }

    fn read_sample(&mut self) -> Result<Option<Sample>> {
        if !self.active {
            return Ok(None);
        }

        Ok(Some(self.generate_sample()))
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

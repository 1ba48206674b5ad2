//! Physical signal timing derived from the configured PWM pulse width.

/// Integer pulse counts for the signal elements, fixed once the pulse width is
/// chosen.
///
/// Every derived count, multiplied by the pulse width, falls inside the
/// window the standard permits for that element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalTiming {
    pulse_width: f32,
    one_bit_length: u32,
    zero_bit_length: u32,
    railcom_delay_length: u32,
    railcom_length: u32,
    railcom_count: u32,
}

/// The requested pulse width cannot produce a conforming signal.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("pulse width {pulse_width}µs cannot satisfy the {element} window")]
pub struct IncompatiblePulseWidth {
    pub pulse_width: f32,
    pub element: &'static str,
}

// Timing windows in microseconds.
const ONE_BIT_WINDOW: (f32, f32, f32) = (58.0, 55.0, 61.0);
const ZERO_BIT_WINDOW: (f32, f32, f32) = (100.0, 95.0, 6000.0);
const RAILCOM_DELAY_WINDOW: (f32, f32, f32) = (26.0, 26.0, 32.0);
const RAILCOM_MIN: f32 = 454.0;
const RAILCOM_MAX: f32 = 488.0;

impl SignalTiming {
    pub fn new(pulse_width: f32) -> Result<Self, IncompatiblePulseWidth> {
        assert!(pulse_width > 0.0);

        let one_bit_length = pulse_count(pulse_width, ONE_BIT_WINDOW)
            .ok_or(IncompatiblePulseWidth { pulse_width, element: "one bit" })?;
        let zero_bit_length = pulse_count(pulse_width, ZERO_BIT_WINDOW)
            .ok_or(IncompatiblePulseWidth { pulse_width, element: "zero bit" })?;
        let railcom_delay_length = pulse_count(pulse_width, RAILCOM_DELAY_WINDOW)
            .ok_or(IncompatiblePulseWidth { pulse_width, element: "cutout delay" })?;

        // The cutout is carved out of whole one bits where possible; when no
        // multiple of the one-bit period fits the window, the final one bit is
        // cut short and the count rounds up to cover it.
        let bit_length = 2 * one_bit_length;
        let mut railcom_count = (RAILCOM_MIN / (bit_length as f32 * pulse_width)).ceil() as u32;
        let mut railcom_length = railcom_count * bit_length;
        if railcom_length as f32 * pulse_width > RAILCOM_MAX {
            railcom_length = (RAILCOM_MIN / pulse_width).ceil() as u32;
            railcom_count = (railcom_length + bit_length - 1) / bit_length;
            if railcom_length as f32 * pulse_width > RAILCOM_MAX {
                return Err(IncompatiblePulseWidth { pulse_width, element: "cutout" });
            }
        }

        Ok(SignalTiming {
            pulse_width,
            one_bit_length,
            zero_bit_length,
            railcom_delay_length,
            railcom_length,
            railcom_count,
        })
    }

    /// Duration of one physical bit in microseconds.
    pub fn pulse_width(&self) -> f32 {
        self.pulse_width
    }

    /// Pulses in each half of a logical one bit.
    pub fn one_bit_length(&self) -> u32 {
        self.one_bit_length
    }

    /// Pulses in each half of a logical zero bit.
    pub fn zero_bit_length(&self) -> u32 {
        self.zero_bit_length
    }

    /// Pulses between the packet end bit and the start of the cutout.
    pub fn railcom_delay_length(&self) -> u32 {
        self.railcom_delay_length
    }

    /// Total pulses the cutout spans.
    pub fn railcom_length(&self) -> u32 {
        self.railcom_length
    }

    /// Whole one bits consumed by the cutout.
    pub fn railcom_count(&self) -> u32 {
        self.railcom_count
    }
}

/// Smallest pulse count whose duration lands inside `(target, min, max)`,
/// preferring the count nearest the target.
fn pulse_count(pulse_width: f32, (target, min, max): (f32, f32, f32)) -> Option<u32> {
    let mut count = (target / pulse_width).round() as u32;
    if count == 0 || (count as f32) * pulse_width < min {
        count = (min / pulse_width).ceil() as u32;
    }

    if (count as f32) * pulse_width <= max {
        Some(count)
    } else {
        None
    }
}

//! Shimmer3 GSR+ raw-to-conductance conversion.
//!
//! The GSR register packs a 2-bit range selector (bits 14-15) with the ADC reading.
//! Only the low 12 bits of the reading are used; the unit's front end switches
//! between four feedback resistors, one per range:
//!
//! - voltage (V) = magnitude * 3.0 / 4095
//! - resistance (kΩ) = feedback / ((voltage / 0.5) - 1)
//! - conductance (µS) = 1000 / resistance
//!
//! Range 3 has a hardware floor: readings below 683 are raised to 683.
//! Readings at or below the 0.5 V reference have no physical meaning; they are
//! reported as [`CalibrationDomainError`] instead of a negative or infinite value.

use crate::drivers::CalibrationDomainError;

/// Feedback resistor per range (kΩ).
pub const FEEDBACK_RESISTANCE_KOHMS: [f64; 4] = [40.2, 287.0, 1000.0, 3300.0];

/// ADC reference voltage.
pub const ADC_REFERENCE_VOLTS: f64 = 3.0;

/// Full-scale count of the 12-bit ADC.
pub const ADC_FULL_SCALE: f64 = 4095.0;

/// Reference voltage of the GSR amplifier.
pub const GSR_REFERENCE_VOLTS: f64 = 0.5;

/// Lowest usable magnitude on range 3.
pub const RANGE3_MAGNITUDE_FLOOR: u16 = 683;
const MAGNITUDE_MASK: u16 = 0x0FFF;

/// Decoded GSR register, after the range-3 floor has been applied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GsrReading {
    pub range: u8,
    pub magnitude: u16,
    pub voltage: f64,
}

impl GsrReading {
    pub fn decode(raw_gsr: u16) -> Self {
        let range = ((raw_gsr >> 14) & 0x03) as u8;
        let mut magnitude = raw_gsr & MAGNITUDE_MASK;
        if range == 3 && magnitude < RANGE3_MAGNITUDE_FLOOR {
            magnitude = RANGE3_MAGNITUDE_FLOOR;
        }
        let voltage = f64::from(magnitude) * ADC_REFERENCE_VOLTS / ADC_FULL_SCALE;
        Self {
            range,
            magnitude,
            voltage,
        }
    }

    fn denominator(&self) -> f64 {
        (self.voltage / GSR_REFERENCE_VOLTS) - 1.0
    }

    fn formula(&self) -> f64 {
        let feedback = FEEDBACK_RESISTANCE_KOHMS[usize::from(self.range)];
        let resistance = feedback / self.denominator();
        1000.0 / resistance
    }
}

/// Converts a packed GSR register into skin conductance (µS).
pub fn conductance(raw_gsr: u16) -> Result<f64, CalibrationDomainError> {
    let reading = GsrReading::decode(raw_gsr);
    if reading.denominator() <= 0.0 {
        return Err(CalibrationDomainError {
            range: reading.range,
            magnitude: reading.magnitude,
            voltage: reading.voltage,
            unguarded: reading.formula(),
        });
    }
    Ok(reading.formula())
}

/// The bare formula with no domain guard. Negative or infinite at or below 0.5 V.
pub fn conductance_unchecked(raw_gsr: u16) -> f64 {
    GsrReading::decode(raw_gsr).formula()
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng;

    fn closed_form(range: u8, magnitude: u16) -> f64 {
        let voltage = magnitude as f64 * 3.0 / 4095.0;
        let resistance = FEEDBACK_RESISTANCE_KOHMS[range as usize] / ((voltage / 0.5) - 1.0);
        1000.0 / resistance
    }

    #[test]
    fn range3_floor_is_applied() {
        for magnitude in 0..RANGE3_MAGNITUDE_FLOOR {
            let reading = GsrReading::decode(0xC000 | magnitude);
            assert_eq!(reading.range, 3);
            assert_eq!(reading.magnitude, RANGE3_MAGNITUDE_FLOOR);
        }
        assert_eq!(GsrReading::decode(0xC000 | 700).magnitude, 700);
        // other ranges are not clamped
        assert_eq!(GsrReading::decode(0x8000 | 100).magnitude, 100);
    }

    #[test]
    fn magnitude_uses_low_twelve_bits() {
        let reading = GsrReading::decode(0x3ABC);
        assert_eq!(reading.range, 0);
        assert_eq!(reading.magnitude, 0x0ABC);
    }

    #[test]
    fn clamped_range3_golden_value() {
        let expected = closed_form(3, 683);
        let value = conductance(0xC000).unwrap();
        assert!((value - expected).abs() < 1e-12);
        // 683 counts sits just above the 0.5 V reference
        assert!(value > 0.0 && value < 0.001);
        assert!((value - 2.22e-4).abs() < 1e-7);
    }

    #[test]
    fn zero_reading_is_a_domain_error() {
        let err = conductance(0x0000).unwrap_err();
        assert_eq!(err.range, 0);
        assert_eq!(err.magnitude, 0);
        assert_eq!(err.voltage, 0.0);
        // feedback / -1 => resistance -40.2, conductance 1000 / -40.2
        assert!(err.unguarded < 0.0);
        assert!((err.unguarded - 1000.0 / -40.2).abs() < 1e-9);
        assert_eq!(conductance_unchecked(0x0000), err.unguarded);
    }

    #[test]
    fn reference_voltage_point_is_a_domain_error() {
        // voltage exactly 0.5 V is unreachable with integer counts; 682 is the last count below it
        assert!(conductance(682).is_err());
        assert!(conductance(683).is_ok());
    }

    #[test]
    fn matches_closed_form_for_random_registers() {
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let raw: u16 = rng.gen();
            let range = ((raw >> 14) & 0x03) as u8;
            let mut magnitude = raw & 0x0FFF;
            if range == 3 && magnitude < 683 {
                magnitude = 683;
            }
            let expected = closed_form(range, magnitude);
            match conductance(raw) {
                Ok(value) => assert!((value - expected).abs() <= 1e-9 * expected.abs().max(1.0)),
                Err(err) => {
                    assert!(magnitude as f64 * 3.0 / 4095.0 <= 0.5);
                    assert_eq!(err.magnitude, magnitude);
                }
            }
        }
    }
}

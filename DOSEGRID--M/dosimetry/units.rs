//! Unit categories and best-unit formatting for report values.
//!
//! Internal base units: energy in MeV, mass in kg, dose in Gy.

use std::fmt;

/// Joules per MeV.
pub const JOULE_PER_MEV: f64 = 1.602_176_634e-13;

/// Quantity kinds printed in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCategory {
    /// Particle and deposited energy, base MeV.
    Energy,
    /// Volume mass, base kg.
    Mass,
    /// Absorbed dose, base Gy.
    Dose,
}

/// A named unit with its value expressed in the category's base unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    /// Printed symbol.
    pub symbol: &'static str,
    /// Size of one unit in base units.
    pub value: f64,
}

const ENERGY_UNITS: &[Unit] = &[
    Unit { symbol: "eV", value: 1.0e-6 },
    Unit { symbol: "keV", value: 1.0e-3 },
    Unit { symbol: "MeV", value: 1.0 },
    Unit { symbol: "GeV", value: 1.0e3 },
    Unit { symbol: "TeV", value: 1.0e6 },
    Unit { symbol: "PeV", value: 1.0e9 },
];

const MASS_UNITS: &[Unit] = &[
    Unit { symbol: "mg", value: 1.0e-6 },
    Unit { symbol: "g", value: 1.0e-3 },
    Unit { symbol: "kg", value: 1.0 },
];

const DOSE_UNITS: &[Unit] = &[
    Unit { symbol: "picoGy", value: 1.0e-12 },
    Unit { symbol: "nanoGy", value: 1.0e-9 },
    Unit { symbol: "microGy", value: 1.0e-6 },
    Unit { symbol: "milliGy", value: 1.0e-3 },
    Unit { symbol: "Gy", value: 1.0 },
];

impl UnitCategory {
    /// Units registered for the category.
    #[must_use]
    pub const fn units(self) -> &'static [Unit] {
        match self {
            Self::Energy => ENERGY_UNITS,
            Self::Mass => MASS_UNITS,
            Self::Dose => DOSE_UNITS,
        }
    }

    fn symbol_width(self) -> usize {
        self.units()
            .iter()
            .map(|unit| unit.symbol.len())
            .max()
            .unwrap_or(0)
    }

    /// Picks the unit giving the smallest ratio >= 1, else the largest ratio < 1.
    #[must_use]
    pub fn best_unit(self, value: f64) -> Unit {
        let units = self.units();
        let magnitude = value.abs();
        let smallest = units
            .iter()
            .copied()
            .min_by(|a, b| a.value.total_cmp(&b.value))
            .unwrap_or(units[0]);
        if !magnitude.is_finite() || magnitude <= f64::MIN_POSITIVE {
            return smallest;
        }
        let above = units
            .iter()
            .filter(|unit| magnitude / unit.value >= 1.0)
            .min_by(|a, b| (magnitude / a.value).total_cmp(&(magnitude / b.value)));
        let below = units
            .iter()
            .filter(|unit| magnitude / unit.value < 1.0)
            .max_by(|a, b| (magnitude / a.value).total_cmp(&(magnitude / b.value)));
        above.or(below).copied().unwrap_or(smallest)
    }
}

/// Value paired with its category, displayed in the best unit.
#[derive(Debug, Clone, Copy)]
pub struct BestUnit {
    value: f64,
    category: UnitCategory,
}

impl BestUnit {
    /// Wraps a value in base units.
    #[must_use]
    pub const fn new(value: f64, category: UnitCategory) -> Self {
        Self { value, category }
    }
}

impl fmt::Display for BestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = self.category.best_unit(self.value);
        write!(
            f,
            "{} {:<width$}",
            format_general(self.value / unit.value),
            unit.symbol,
            width = self.category.symbol_width()
        )
    }
}

/// Formats with six significant digits, switching to exponent form outside `[1e-4, 1e6)`.
#[must_use]
pub fn format_general(value: f64) -> String {
    const PRECISION: i32 = 6;
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }
    let scientific = format!("{value:.5e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{sign}{:02}",
            trim_fraction(mantissa),
            exponent.unsigned_abs()
        )
    } else {
        let decimals = usize::try_from(PRECISION - 1 - exponent).unwrap_or(0);
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Converts summed deposits in MeV over a mass in kg to Gy.
#[must_use]
pub fn dose_gray(energy_mev: f64, mass_kg: f64) -> f64 {
    energy_mev * JOULE_PER_MEV / mass_kg
}

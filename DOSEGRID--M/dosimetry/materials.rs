use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Bulk material used by a placed volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// NIST-style name, e.g. `G4_Pb`.
    pub name: String,
    /// Density in g/cm³.
    pub density_g_cm3: f64,
    /// Photon mass attenuation coefficient at 1 MeV, in cm²/g.
    pub mass_attenuation_cm2_g: f64,
}

impl Material {
    /// Linear attenuation coefficient in 1/cm.
    #[must_use]
    pub fn linear_attenuation_per_cm(&self) -> f64 {
        self.mass_attenuation_cm2_g * self.density_g_cm3
    }
}

/// Lookup table of known materials, in registration order.
#[derive(Debug, Clone)]
pub struct MaterialTable {
    materials: IndexMap<String, Material>,
}

impl MaterialTable {
    /// Table with the NIST materials the grid can be built from.
    ///
    /// Attenuation coefficients are the NIST 1 MeV values for every material,
    /// whatever the configured beam energy.
    #[must_use]
    pub fn nist() -> Self {
        let entries = [
            ("G4_AIR", 0.001_204_79, 0.063_58),
            ("G4_WATER", 1.0, 0.070_72),
            ("G4_Al", 2.699, 0.061_46),
            ("G4_Si", 2.33, 0.063_61),
            ("G4_Fe", 7.874, 0.059_95),
            ("G4_Cu", 8.96, 0.058_89),
            ("G4_W", 19.3, 0.066_18),
            ("G4_Pb", 11.35, 0.071_02),
            ("G4_BONE_COMPACT_ICRU", 1.85, 0.065_63),
        ];
        let materials = entries
            .into_iter()
            .map(|(name, density, attenuation)| {
                (
                    name.to_string(),
                    Material {
                        name: name.to_string(),
                        density_g_cm3: density,
                        mass_attenuation_cm2_g: attenuation,
                    },
                )
            })
            .collect();
        Self { materials }
    }

    /// Finds a material by full name (`G4_Pb`) or short name (`Pb`, `AIR`).
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Material> {
        let name = name.trim();
        self.materials
            .get(name)
            .or_else(|| self.materials.get(&format!("G4_{name}")))
    }

    /// Known material names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.materials.keys().map(String::as_str)
    }
}

impl Default for MaterialTable {
    fn default() -> Self {
        Self::nist()
    }
}

//! Survey description: inducing field plus receiver geometry.

use crate::error::{InversionError, InversionResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Measured field component at each receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Total magnetic intensity anomaly (projection on the inducing direction).
    Tmi,
    Bx,
    By,
    Bz,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Tmi => "tmi",
            Component::Bx => "bx",
            Component::By => "by",
            Component::Bz => "bz",
        };
        f.write_str(name)
    }
}

/// Earth's inducing field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceField {
    pub strength_nt: f64,
    pub inclination_deg: f64,
    pub declination_deg: f64,
}

impl SourceField {
    /// Unit vector (east, north, up) along the inducing field.
    ///
    /// Positive inclination points below the horizon.
    pub fn direction(&self) -> [f64; 3] {
        let inc = self.inclination_deg.to_radians();
        let dec = self.declination_deg.to_radians();
        [inc.cos() * dec.sin(), inc.cos() * dec.cos(), -inc.sin()]
    }
}

#[derive(Debug, Clone)]
pub struct Survey {
    source: SourceField,
    locations: Array2<f64>,
    components: Vec<Component>,
}

impl Survey {
    /// Build an immutable survey.
    ///
    /// Fails when the receiver set is empty, locations are not N x 3 or not
    /// finite, no component is requested, or the field parameters are invalid.
    pub fn new(
        source: SourceField,
        locations: Array2<f64>,
        components: Vec<Component>,
    ) -> InversionResult<Self> {
        if locations.nrows() == 0 {
            return Err(InversionError::config("survey has no receivers"));
        }
        if locations.ncols() != 3 {
            return Err(InversionError::config(format!(
                "receiver locations must have 3 columns, got {}",
                locations.ncols()
            )));
        }
        if locations.iter().any(|v| !v.is_finite()) {
            return Err(InversionError::config("receiver locations must be finite"));
        }
        if components.is_empty() {
            return Err(InversionError::config("survey requests no components"));
        }
        for (i, c) in components.iter().enumerate() {
            if components[i + 1..].contains(c) {
                return Err(InversionError::config(format!("component {} requested twice", c)));
            }
        }
        if !(source.strength_nt.is_finite() && source.strength_nt > 0.0) {
            return Err(InversionError::config("survey.strength_nt must be positive"));
        }
        if !(-90.0..=90.0).contains(&source.inclination_deg) {
            return Err(InversionError::config("survey.inclination_deg must be in [-90, 90]"));
        }
        if !(-360.0..=360.0).contains(&source.declination_deg) {
            return Err(InversionError::config("survey.declination_deg must be in [-360, 360]"));
        }

        info!(
            receivers = locations.nrows(),
            components = components.len(),
            strength_nt = source.strength_nt,
            inclination = source.inclination_deg,
            declination = source.declination_deg,
            "survey assembled"
        );

        Ok(Self {
            source,
            locations,
            components,
        })
    }

    pub fn source(&self) -> &SourceField {
        &self.source
    }

    pub fn locations(&self) -> &Array2<f64> {
        &self.locations
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn n_receivers(&self) -> usize {
        self.locations.nrows()
    }

    /// Number of data: receivers x components, ordered receiver-major.
    pub fn n_data(&self) -> usize {
        self.locations.nrows() * self.components.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn vertical_field() -> SourceField {
        SourceField {
            strength_nt: 50_000.0,
            inclination_deg: 90.0,
            declination_deg: 0.0,
        }
    }

    #[test]
    fn test_vertical_field_points_down() {
        let d = vertical_field().direction();
        assert_relative_eq!(d[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(d[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(d[2], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_horizontal_north_field() {
        let src = SourceField {
            strength_nt: 1.0,
            inclination_deg: 0.0,
            declination_deg: 0.0,
        };
        let d = src.direction();
        assert_relative_eq!(d[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_receivers_rejected() {
        let locs = Array2::zeros((0, 3));
        let err = Survey::new(vertical_field(), locs, vec![Component::Tmi]).unwrap_err();
        assert!(matches!(err, InversionError::Configuration(_)));
    }

    #[test]
    fn test_n_data_counts_components() {
        let locs = array![[0.0, 0.0, 1.0], [1.0, 0.0, 1.0]];
        let survey =
            Survey::new(vertical_field(), locs, vec![Component::Tmi, Component::Bz]).unwrap();
        assert_eq!(survey.n_receivers(), 2);
        assert_eq!(survey.n_data(), 4);
    }

    #[test]
    fn test_duplicate_component_rejected() {
        let locs = array![[0.0, 0.0, 1.0]];
        assert!(Survey::new(vertical_field(), locs, vec![Component::Tmi, Component::Tmi]).is_err());
    }

    #[test]
    fn test_component_names_round_trip_through_toml() {
        #[derive(Deserialize)]
        struct Wrap {
            c: Vec<Component>,
        }
        let w: Wrap = toml::from_str("c = [\"tmi\", \"bz\"]").unwrap();
        assert_eq!(w.c, vec![Component::Tmi, Component::Bz]);
        assert_eq!(Component::Bz.to_string(), "bz");
    }
}

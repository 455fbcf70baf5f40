//! Parameter bundle consumed by the driver.

use serde::Deserialize;

use crate::constants::DEFAULT_SINK_CRITERION;

/// Parameters controlling tree construction, neighbourhood resolution
/// and the physics visitors.
///
/// The bundle is deserialised from whatever front end the application
/// uses; parsing is not the core's concern. The viscosity, CFL and
/// multipole fields are carried for the physics visitors and are not
/// evaluated by the core itself.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimParams {
    /// Number of particles a leaf holds before it is refined. The
    /// capacity can be exceeded at the maximum tree depth when particles
    /// quantise to the same cell.
    pub leaf_capacity: usize,
    /// The maximum depth of the tree. Clamped to the deepest level the
    /// key width admits for the chosen dimension.
    pub max_tree_depth: usize,
    /// Subtree-count criterion below which a branch is scheduled as one
    /// unit of neighbourhood work.
    pub sink_criterion: u64,
    /// Courant factor for the time integrator.
    pub cfl_factor: f64,
    /// Smoothing-kernel eta of the physics visitors.
    pub sph_smoothing_eta: f64,
    /// Artificial viscosity alpha.
    pub sph_viscosity_alpha: f64,
    /// Artificial viscosity beta.
    pub sph_viscosity_beta: f64,
    /// Artificial viscosity epsilon regulariser.
    pub sph_viscosity_epsilon: f64,
    /// Periodicity of the x dimension.
    pub periodic_x: bool,
    /// Periodicity of the y dimension.
    pub periodic_y: bool,
    /// Periodicity of the z dimension.
    pub periodic_z: bool,
    /// Whether self gravity is computed by the visitors.
    pub gravity_enabled: bool,
    /// Multipole acceptance angle for gravity visitors.
    pub macangle: f64,
    /// Mass criterion at which gravity visitors stop descending.
    pub max_mass_cell: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            leaf_capacity: 32,
            max_tree_depth: 20,
            sink_criterion: DEFAULT_SINK_CRITERION,
            cfl_factor: 0.25,
            sph_smoothing_eta: 1.2,
            sph_viscosity_alpha: 1.0,
            sph_viscosity_beta: 2.0,
            sph_viscosity_epsilon: 0.01,
            periodic_x: false,
            periodic_y: false,
            periodic_z: false,
            gravity_enabled: false,
            macangle: 0.5,
            max_mass_cell: 1.0e-40,
        }
    }
}

impl SimParams {
    /// Periodicity flags for the first `D` dimensions.
    pub fn periodic<const D: usize>(&self) -> [bool; D] {
        let flags = [self.periodic_x, self.periodic_y, self.periodic_z];
        std::array::from_fn(|d| flags[d])
    }

    /// Return true if any of the first `D` dimensions is periodic.
    pub fn any_periodic<const D: usize>(&self) -> bool {
        self.periodic::<D>().iter().any(|&p| p)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = SimParams::default();
        assert_eq!(params.leaf_capacity, 32);
        assert!(!params.any_periodic::<3>());
    }

    #[test]
    fn test_periodic_flags_truncate_to_dimension() {
        let params = SimParams {
            periodic_y: true,
            ..Default::default()
        };
        assert_eq!(params.periodic::<2>(), [false, true]);
        assert!(params.any_periodic::<2>());
        assert!(!params.any_periodic::<1>());
    }
}

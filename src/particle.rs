//! Particle data model.

use std::mem::offset_of;

use mpi::datatype::{UncommittedDatatypeRef, UncommittedUserDatatype, UserDatatype};
use mpi::traits::Equivalence;

use crate::morton::MortonKey;

/// Where a particle lives relative to the current worker.
///
/// `Local`, `Shared` and `Exclusive` particles are owned by this worker.
/// `Ghost` entries mirror a particle owned by another worker and are kept
/// up to date by the ghost refresh. `NonLocal` marks entries whose state
/// is not resident here at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Locality {
    /// Owned by this worker.
    #[default]
    Local = 0,
    /// Owned here and visible to at least one other worker.
    Shared = 1,
    /// Owned here and invisible to every other worker.
    Exclusive = 2,
    /// Mirror of a particle owned by another worker.
    Ghost = 3,
    /// Not resident on this worker.
    NonLocal = 4,
}

unsafe impl Equivalence for Locality {
    type Out = <u8 as Equivalence>::Out;

    fn equivalent_datatype() -> Self::Out {
        u8::equivalent_datatype()
    }
}

/// A point mass carrying SPH state.
///
/// The struct is `Copy` and travels between workers as a single MPI
/// datatype, so every field is plain data. `key` is only meaningful after
/// the particle has been keyed against the current domain range.
#[derive(Clone, Copy, Debug)]
pub struct Particle<const D: usize> {
    /// Stable global id.
    pub id: u64,
    /// Morton key derived from position and domain range.
    pub key: MortonKey<D>,
    /// Position.
    pub position: [f64; D],
    /// Velocity.
    pub velocity: [f64; D],
    /// Velocity at the half step, for leapfrog style integrators.
    pub velocity_half: [f64; D],
    /// Acceleration, written by physics visitors.
    pub acceleration: [f64; D],
    /// Mass.
    pub mass: f64,
    /// Density.
    pub density: f64,
    /// Pressure.
    pub pressure: f64,
    /// Specific internal energy.
    pub internal_energy: f64,
    /// Time derivative of the internal energy, written by physics visitors.
    pub dudt: f64,
    /// Smoothing length defining the particle's neighbourhood.
    pub smoothing_length: f64,
    /// Rank of the owning worker.
    pub owner: i32,
    /// Locality tag relative to the current worker.
    pub locality: Locality,
    /// Non-zero for periodic mirror copies, which are cleaned before the
    /// next rebuild.
    pub mirror: u8,
}

impl<const D: usize> Default for Particle<D> {
    fn default() -> Self {
        Self {
            id: 0,
            key: MortonKey::root(),
            position: [0.0; D],
            velocity: [0.0; D],
            velocity_half: [0.0; D],
            acceleration: [0.0; D],
            mass: 0.0,
            density: 0.0,
            pressure: 0.0,
            internal_energy: 0.0,
            dudt: 0.0,
            smoothing_length: 0.0,
            owner: 0,
            locality: Locality::NonLocal,
            mirror: 0,
        }
    }
}

impl<const D: usize> Particle<D> {
    /// Create a locally owned particle from initial-condition state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        position: [f64; D],
        velocity: [f64; D],
        mass: f64,
        density: f64,
        internal_energy: f64,
        smoothing_length: f64,
        pressure: f64,
    ) -> Self {
        Self {
            id,
            position,
            velocity,
            mass,
            density,
            internal_energy,
            smoothing_length,
            pressure,
            locality: Locality::Local,
            ..Default::default()
        }
    }

    /// Return true if the particle is owned by this worker.
    pub fn is_local(&self) -> bool {
        matches!(
            self.locality,
            Locality::Local | Locality::Shared | Locality::Exclusive
        )
    }

    /// Return true if the particle is owned here and is not a periodic
    /// mirror. Only these particles contribute to conserved quantities.
    pub fn is_owned(&self) -> bool {
        self.is_local() && self.mirror == 0
    }
}

// The MPI datatype has to be spelled out by hand because the derive macro
// does not handle const generic structs.
unsafe impl<const D: usize> Equivalence for Particle<D> {
    type Out = UserDatatype;

    #[allow(clippy::useless_conversion)]
    fn equivalent_datatype() -> Self::Out {
        let d = D as mpi::Count;
        UserDatatype::structured::<UncommittedDatatypeRef>(
            &[1; 15],
            &[
                (offset_of!(Particle<D>, id) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, key) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, position) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, velocity) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, velocity_half) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(Particle<D>, acceleration) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(Particle<D>, mass) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, density) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, pressure) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, internal_energy) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(Particle<D>, dudt) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, smoothing_length) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(Particle<D>, owner) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, locality) as i64).try_into().unwrap(),
                (offset_of!(Particle<D>, mirror) as i64).try_into().unwrap(),
            ],
            &[
                u64::equivalent_datatype().into(),
                MortonKey::<D>::equivalent_datatype().into(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                i32::equivalent_datatype().into(),
                Locality::equivalent_datatype().into(),
                u8::equivalent_datatype().into(),
            ],
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_locality_tags() {
        let mut particle = Particle::<2>::new(
            7,
            [0.1, 0.2],
            [0.0, 0.0],
            1.0,
            1.0,
            2.5,
            0.05,
            1.4,
        );
        assert!(particle.is_local());
        assert!(particle.is_owned());

        particle.mirror = 1;
        assert!(particle.is_local());
        assert!(!particle.is_owned());

        particle.mirror = 0;
        particle.locality = Locality::Ghost;
        assert!(!particle.is_local());
        assert!(!particle.is_owned());
    }

    #[test]
    fn test_default_is_inert() {
        let particle = Particle::<3>::default();
        assert_eq!(particle.locality, Locality::NonLocal);
        assert_eq!(particle.mass, 0.0);
        assert_eq!(particle.key, MortonKey::root());
    }
}

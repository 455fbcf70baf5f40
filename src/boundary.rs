//! Periodic boundary mirrors.
//!
//! Mirroring happens before keying and planning: particles within a band
//! of a periodic face are copied to the opposite face and tagged, which
//! makes the rest of the pipeline oblivious to periodicity. Tagged copies
//! are cleaned at the start of the next rebuild.

use crate::geometry::DomainBox;
use crate::particle::Particle;

/// Remove the mirror copies produced by the previous
/// [`generate_mirrors`] call.
pub fn clean_mirrors<const D: usize>(particles: &mut Vec<Particle<D>>) {
    particles.retain(|particle| particle.mirror == 0);
}

/// Emit mirrored copies of every particle within `band` of a periodic
/// face, shifted to the opposite face.
///
/// Dimensions are processed in order and each pass scans mirrors produced
/// by earlier passes, so particles near an edge or corner of the domain
/// get images across every periodic combination. Mirrors keep the id of
/// their source particle and are tagged for cleanup.
pub fn generate_mirrors<const D: usize>(
    particles: &mut Vec<Particle<D>>,
    domain: &DomainBox<D>,
    band: f64,
    periodic: &[bool; D],
) {
    for d in 0..D {
        if !periodic[d] {
            continue;
        }

        let lo = domain.min()[d];
        let hi = domain.max()[d];
        let extent = domain.extent()[d];

        let scanned = particles.len();
        for index in 0..scanned {
            let particle = particles[index];

            if particle.position[d] <= lo + band {
                let mut mirror = particle;
                mirror.position[d] += extent;
                mirror.mirror = 1;
                particles.push(mirror);
            }
            if particle.position[d] >= hi - band {
                let mut mirror = particle;
                mirror.position[d] -= extent;
                mirror.mirror = 1;
                particles.push(mirror);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn particle_at<const D: usize>(id: u64, position: [f64; D]) -> Particle<D> {
        Particle::new(id, position, [0.0; D], 1.0, 1.0, 1.0, 0.05, 1.0)
    }

    #[test]
    fn test_mirror_near_upper_face() {
        let domain = DomainBox::new([0.0], [1.0]);
        let mut particles = vec![particle_at(0, [0.98]), particle_at(1, [0.5])];

        generate_mirrors(&mut particles, &domain, 0.1, &[true]);

        assert_eq!(particles.len(), 3);
        let mirror = &particles[2];
        assert_eq!(mirror.id, 0);
        assert_eq!(mirror.mirror, 1);
        assert!((mirror.position[0] - (-0.02)).abs() < 1e-14);
    }

    #[test]
    fn test_non_periodic_dimension_is_ignored() {
        let domain = DomainBox::new([0.0], [1.0]);
        let mut particles = vec![particle_at(0, [0.01])];
        generate_mirrors(&mut particles, &domain, 0.1, &[false]);
        assert_eq!(particles.len(), 1);
    }

    #[test]
    fn test_corner_particle_gets_three_images() {
        let domain = DomainBox::new([0.0, 0.0], [1.0, 1.0]);
        let mut particles = vec![particle_at(7, [0.02, 0.03])];

        generate_mirrors(&mut particles, &domain, 0.1, &[true, true]);

        // One image across x, one across y, one across the corner.
        assert_eq!(particles.len(), 4);
        let mut positions: Vec<[f64; 2]> =
            particles[1..].iter().map(|p| p.position).collect();
        positions.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((positions[0][0] - 0.02).abs() < 1e-14 && (positions[0][1] - 1.03).abs() < 1e-14);
        assert!((positions[1][0] - 1.02).abs() < 1e-14 && (positions[1][1] - 0.03).abs() < 1e-14);
        assert!((positions[2][0] - 1.02).abs() < 1e-14 && (positions[2][1] - 1.03).abs() < 1e-14);
        assert!(particles[1..].iter().all(|p| p.mirror == 1 && p.id == 7));
    }

    #[test]
    fn test_clean_removes_exactly_the_mirrors() {
        let domain = DomainBox::new([0.0], [1.0]);
        let mut particles = vec![
            particle_at(0, [0.01]),
            particle_at(1, [0.5]),
            particle_at(2, [0.99]),
        ];
        generate_mirrors(&mut particles, &domain, 0.05, &[true]);
        assert!(particles.len() > 3);

        clean_mirrors(&mut particles);
        assert_eq!(particles.len(), 3);
        assert!(particles.iter().all(|p| p.mirror == 0));
    }

    #[test]
    fn test_mirror_visibility_across_the_seam() {
        // A particle just below the upper face must produce an image next
        // to a particle just above the lower face.
        let domain = DomainBox::new([0.0], [1.0]);
        let eps = 1e-3;
        let h = 0.05;
        let mut particles = vec![particle_at(0, [1.0 - eps]), particle_at(1, [eps])];

        generate_mirrors(&mut particles, &domain, 2.5 * h, &[true]);

        let image_of_upper = particles
            .iter()
            .find(|p| p.mirror == 1 && p.id == 0)
            .unwrap();
        let distance = (image_of_upper.position[0] - eps).abs();
        assert!(distance <= 2.0 * eps + 1e-12);
        assert!(distance < h);
    }
}

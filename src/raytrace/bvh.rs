//! Binned SAH bounding volume hierarchy over mesh faces.
//!
//! Nodes are stored flat. A leaf references `tri_count > 0` entries of the face order starting
//! at `tri_begin_or_first_child`; an inner node has `tri_count == 0` and its children at
//! `first_child` and `first_child + 1`.

use crate::core::math::interpolation::barycentric_from_uv;
use crate::raytrace::ray::{Aabb, Hit, Ray, intersect_triangle};
use nalgebra::Point3;

const NUM_BINS: usize = 8;
const MAX_DEPTH: usize = 64;
const MAX_LEAF_TRIS: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct BvhNode {
    pub aabb: Aabb,
    pub tri_begin_or_first_child: u32,
    pub tri_count: u32,
}

#[derive(Debug, Clone)]
pub struct Bvh {
    pub nodes: Vec<BvhNode>,
    /// Face indices in leaf order.
    pub order: Vec<u32>,
    triangles: Vec<[Point3<f32>; 3]>,
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    tri_count: u32,
}

impl Default for Bin {
    fn default() -> Self {
        Self {
            bounds: Aabb::neutral(),
            tri_count: 0,
        }
    }
}

struct Split {
    axis: usize,
    pos: f32,
    cost: f32,
}

/// Surface area heuristic cost of a node.
fn node_cost(bounds: &Aabb, tri_count: u32) -> f32 {
    bounds.half_area() * tri_count as f32
}

impl Bvh {
    pub fn build(triangles: &[[Point3<f32>; 3]]) -> Self {
        let tri_count = triangles.len() as u32;
        let centroids: Vec<Point3<f32>> = triangles
            .iter()
            .map(|[a, b, c]| Point3::from((a.coords + b.coords + c.coords) / 3.0))
            .collect();
        let tri_bounds: Vec<Aabb> = triangles.iter().map(Aabb::from_triangle).collect();

        let mut bvh = Self {
            nodes: Vec::with_capacity((2 * triangles.len()).max(1)),
            order: (0..tri_count).collect(),
            triangles: triangles.to_vec(),
        };
        let root_bounds = bvh.range_bounds(&tri_bounds, 0, tri_count);
        bvh.nodes.push(BvhNode {
            aabb: root_bounds,
            tri_begin_or_first_child: 0,
            tri_count,
        });

        // Depth-first splitting with an explicit stack.
        let mut stack = vec![(0usize, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            let Some(split) = bvh.choose_split(node, &centroids, &tri_bounds) else {
                continue;
            };

            let begin = bvh.nodes[node].tri_begin_or_first_child;
            let count = bvh.nodes[node].tri_count;
            let end = begin + count;

            // Partition the face order so each child's faces are contiguous.
            let mut left_end = begin;
            for i in begin..end {
                let face = bvh.order[i as usize] as usize;
                if centroids[face][split.axis] <= split.pos {
                    bvh.order.swap(i as usize, left_end as usize);
                    left_end += 1;
                }
            }
            let left_count = left_end - begin;
            let right_count = count - left_count;
            if left_count == 0 || right_count == 0 {
                continue;
            }

            let left = bvh.nodes.len();
            let left_bounds = bvh.range_bounds(&tri_bounds, begin, left_count);
            let right_bounds = bvh.range_bounds(&tri_bounds, left_end, right_count);
            bvh.nodes.push(BvhNode {
                aabb: left_bounds,
                tri_begin_or_first_child: begin,
                tri_count: left_count,
            });
            bvh.nodes.push(BvhNode {
                aabb: right_bounds,
                tri_begin_or_first_child: left_end,
                tri_count: right_count,
            });

            // The current node is not a leaf anymore.
            bvh.nodes[node].tri_begin_or_first_child = left as u32;
            bvh.nodes[node].tri_count = 0;

            if depth < MAX_DEPTH {
                stack.push((left, depth + 1));
                stack.push((left + 1, depth + 1));
            }
        }
        bvh
    }

    fn range_bounds(&self, tri_bounds: &[Aabb], begin: u32, count: u32) -> Aabb {
        let mut aabb = Aabb::neutral();
        for &face in &self.order[begin as usize..(begin + count) as usize] {
            aabb.grow(&tri_bounds[face as usize]);
        }
        aabb
    }

    fn choose_split(
        &self,
        node: usize,
        centroids: &[Point3<f32>],
        tri_bounds: &[Aabb],
    ) -> Option<Split> {
        let BvhNode {
            aabb,
            tri_begin_or_first_child: begin,
            tri_count: count,
        } = self.nodes[node];
        if count <= MAX_LEAF_TRIS {
            return None;
        }
        let faces = &self.order[begin as usize..(begin + count) as usize];

        let mut best: Option<Split> = None;
        let leaf_cost = node_cost(&aabb, count);
        for axis in 0..3 {
            let (centroid_min, centroid_max) = faces.iter().fold((f32::MAX, f32::MIN), |acc, &f| {
                let c = centroids[f as usize][axis];
                (acc.0.min(c), acc.1.max(c))
            });
            if centroid_max - centroid_min <= f32::EPSILON {
                continue;
            }

            // Populate the bins
            let mut bins = [Bin::default(); NUM_BINS];
            let scale = NUM_BINS as f32 / (centroid_max - centroid_min);
            for &face in faces {
                let c = centroids[face as usize][axis];
                let bin = (((c - centroid_min) * scale).floor() as usize).min(NUM_BINS - 1);
                bins[bin].bounds.grow(&tri_bounds[face as usize]);
                bins[bin].tri_count += 1;
            }

            // Sweep from both sides to get the cost of each of the N-1 planes.
            let mut left_area = [Aabb::neutral(); NUM_BINS - 1];
            let mut right_area = [Aabb::neutral(); NUM_BINS - 1];
            let mut left_count = [0u32; NUM_BINS - 1];
            let mut right_count = [0u32; NUM_BINS - 1];
            let (mut left_box, mut right_box) = (Aabb::neutral(), Aabb::neutral());
            let (mut left_sum, mut right_sum) = (0, 0);
            for i in 0..NUM_BINS - 1 {
                left_sum += bins[i].tri_count;
                left_count[i] = left_sum;
                left_box.grow(&bins[i].bounds);
                left_area[i] = left_box;

                right_sum += bins[NUM_BINS - 1 - i].tri_count;
                right_count[NUM_BINS - 2 - i] = right_sum;
                right_box.grow(&bins[NUM_BINS - 1 - i].bounds);
                right_area[NUM_BINS - 2 - i] = right_box;
            }

            let plane_step = (centroid_max - centroid_min) / NUM_BINS as f32;
            for i in 0..NUM_BINS - 1 {
                let cost = node_cost(&left_area[i], left_count[i])
                    + node_cost(&right_area[i], right_count[i]);
                let better = best.as_ref().is_none_or(|b| cost < b.cost);
                if cost < leaf_cost && better {
                    best = Some(Split {
                        axis,
                        pos: centroid_min + plane_step * (i + 1) as f32,
                        cost,
                    });
                }
            }
        }
        best
    }

    /// Closest hit along `ray` before `t_max`.
    pub fn intersect(&self, ray: &Ray, t_max: f32) -> Option<Hit> {
        let mut closest: Option<Hit> = None;
        let mut t_limit = t_max;
        let mut stack = Vec::with_capacity(MAX_DEPTH);
        stack.push(0u32);

        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];
            if node.aabb.hit(ray, t_limit).is_none() {
                continue;
            }
            if node.tri_count > 0 {
                let begin = node.tri_begin_or_first_child as usize;
                for &face in &self.order[begin..begin + node.tri_count as usize] {
                    let [a, b, c] = &self.triangles[face as usize];
                    if let Some((t, u, v)) = intersect_triangle(ray, a, b, c, t_limit) {
                        t_limit = t;
                        closest = Some(Hit {
                            face,
                            t,
                            bary: barycentric_from_uv(u, v),
                        });
                    }
                }
            } else {
                let first = node.tri_begin_or_first_child;
                stack.push(first);
                stack.push(first + 1);
            }
        }
        closest
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::mesh::Mesh;
    use nalgebra::Vector3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn intersect_all(triangles: &[[Point3<f32>; 3]], ray: &Ray, t_max: f32) -> Option<Hit> {
        let mut closest: Option<Hit> = None;
        let mut t_limit = t_max;
        for (face, [a, b, c]) in triangles.iter().enumerate() {
            if let Some((t, u, v)) = intersect_triangle(ray, a, b, c, t_limit) {
                t_limit = t;
                closest = Some(Hit {
                    face: face as u32,
                    t,
                    bary: barycentric_from_uv(u, v),
                });
            }
        }
        closest
    }

    fn random_direction<R: rand::Rng>(rng: &mut R) -> Vector3<f32> {
        loop {
            let v = Vector3::new(
                rng.random_range(-1.0f32..1.0),
                rng.random_range(-1.0f32..1.0),
                rng.random_range(-1.0f32..1.0),
            );
            let n = v.norm();
            if n > 1e-3 && n <= 1.0 {
                return v / n;
            }
        }
    }

    fn random_soup(rng: &mut StdRng, count: usize) -> Vec<[Point3<f32>; 3]> {
        use rand::Rng;
        (0..count)
            .map(|_| {
                let base = Point3::new(
                    rng.random_range(-5.0f32..5.0),
                    rng.random_range(-5.0f32..5.0),
                    rng.random_range(-5.0f32..5.0),
                );
                [
                    base,
                    base + random_direction(rng) * 0.8,
                    base + random_direction(rng) * 0.8,
                ]
            })
            .collect()
    }

    #[test]
    fn matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let triangles = random_soup(&mut rng, 400);
        let bvh = Bvh::build(&triangles);
        assert!(bvh.nodes.len() > 1);

        let mut hits = 0;
        for _ in 0..500 {
            let ray = Ray::new(Point3::origin(), random_direction(&mut rng));
            let expected = intersect_all(&triangles, &ray, f32::MAX);
            let actual = bvh.intersect(&ray, f32::MAX);
            match (expected, actual) {
                (Some(e), Some(a)) => {
                    assert!((e.t - a.t).abs() < 1e-4);
                    hits += 1;
                }
                (None, None) => {}
                other => panic!("mismatch: {other:?}"),
            }
        }
        assert!(hits > 0);
    }

    #[test]
    fn leaves_cover_every_face_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let triangles = random_soup(&mut rng, 97);
        let bvh = Bvh::build(&triangles);
        let mut seen = vec![0; triangles.len()];
        for node in bvh.nodes.iter().filter(|n| n.tri_count > 0) {
            let begin = node.tri_begin_or_first_child as usize;
            for &face in &bvh.order[begin..begin + node.tri_count as usize] {
                seen[face as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn inside_cube_every_ray_hits() {
        let cube = Mesh::create_test_cube(2.0);
        let bvh = Bvh::build(&cube.triangles);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let ray = Ray::new(Point3::new(0.1, -0.2, 0.3), random_direction(&mut rng));
            let hit = bvh.intersect(&ray, f32::MAX).unwrap();
            let p = ray.at(hit.t);
            let on_face = p.iter().any(|c| (c.abs() - 1.0).abs() < 1e-4);
            assert!(on_face, "{p:?}");
        }
    }
}

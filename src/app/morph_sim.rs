use image::RgbImage;
use log::debug;

use crate::app::cell::{Cell, PERSONAL_SPACE};
use crate::app::calculate::drawing_process::DRAWING_CANVAS_SIZE;
use crate::app::preset::{Preset, UnprocessedPreset};
use crate::app::{SeedColor, SeedPos};

const INITIAL_DST_FORCE: f32 = 0.13;

/// Build seeds, colors and a simulation for a solved preset. Seeds start at
/// grid centers in the `sidelen`-wide arena; the morph begins immediately.
pub fn init_image(sidelen: u32, source: Preset) -> (u32, Vec<SeedPos>, Vec<SeedColor>, Sim) {
    let img = RgbImage::from_vec(
        source.inner.width,
        source.inner.height,
        source.inner.source_img,
    )
    .expect("preset was validated on load");
    let assignments = source.assignments;

    let (seeds, colors, seeds_n) = init_colors(sidelen, img);
    let mut sim = Sim::new(source.inner.name);
    sim.cells = vec![Cell::new(0.0, 0.0, 0.0, 0.0, 0.0); seeds_n];
    sim.set_assignments(&assignments, sidelen);
    for cell in &mut sim.cells {
        cell.set_dst_force(INITIAL_DST_FORCE);
    }
    (seeds_n as u32, seeds, colors, sim)
}

/// Drawing-mode boot: identity permutation over the fixed canvas grid.
pub fn init_canvas(
    sidelen: u32,
    source: &UnprocessedPreset,
) -> (u32, Vec<SeedPos>, Vec<SeedColor>, Sim) {
    let img = RgbImage::from_vec(source.width, source.height, source.source_img.clone())
        .expect("canvas buffer matches its dimensions");
    let assignments =
        (0..(DRAWING_CANVAS_SIZE * DRAWING_CANVAS_SIZE) as usize).collect::<Vec<usize>>();

    let (seeds, colors, seeds_n) = init_colors(sidelen, img);
    let mut sim = Sim::new(source.name.clone());
    sim.cells = vec![Cell::new(0.0, 0.0, 0.0, 0.0, 0.0); seeds_n];
    sim.set_assignments(&assignments, sidelen);
    (seeds_n as u32, seeds, colors, sim)
}

fn init_colors(sidelen: u32, source: RgbImage) -> (Vec<SeedPos>, Vec<SeedColor>, usize) {
    let width = source.width() as usize;
    let height = source.height() as usize;
    assert_eq!(width, height, "simulation input must be square");

    let seeds_n = width * height;
    let pixel_size = sidelen as f32 / width as f32;

    let mut seeds = Vec::with_capacity(seeds_n);
    let mut colors = Vec::with_capacity(seeds_n);
    for y in 0..height {
        for x in 0..width {
            let p = source.get_pixel(x as u32, y as u32);
            seeds.push(SeedPos {
                xy: [
                    (x as f32 + 0.5) * pixel_size,
                    (y as f32 + 0.5) * pixel_size,
                ],
            });
            colors.push(SeedColor {
                rgba: [
                    p[0] as f32 / 255.0,
                    p[1] as f32 / 255.0,
                    p[2] as f32 / 255.0,
                    1.0,
                ],
            });
        }
    }
    (seeds, colors, seeds_n)
}

/// The particle system. Positions live outside (shared with the
/// rasterizer) and are passed in for every step; the bucket buffers are
/// kept across frames to avoid per-step allocation.
pub struct Sim {
    pub(crate) cells: Vec<Cell>,
    name: String,
    reversed: bool,

    bucket_counts: Vec<u32>,
    bucket_starts: Vec<u32>,
    bucket_entries: Vec<u32>,
    cell_buckets: Vec<u32>,
}

impl Sim {
    pub fn new(name: String) -> Self {
        Self {
            cells: Vec::new(),
            name,
            reversed: false,
            bucket_counts: Vec::new(),
            bucket_starts: Vec::new(),
            bucket_entries: Vec::new(),
            cell_buckets: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    pub fn reversed(&self) -> bool {
        self.reversed
    }

    fn switch(&mut self) {
        for cell in &mut self.cells {
            cell.swap_endpoints();
        }
        self.reversed = !self.reversed;
    }

    /// One frame: rebuild the bucket grid, accumulate forces, integrate.
    pub fn step(&mut self, positions: &mut [SeedPos], sidelen: u32) {
        let n = self.cells.len();
        let grid_size = (n as f32).sqrt();
        let grid_dim = grid_size as usize;
        let pixel_size = sidelen as f32 / grid_size;
        let bucket_n = grid_dim * grid_dim;
        let sidelen_f = sidelen as f32;
        let grid_max = grid_size - 1.0;
        let personal_space = pixel_size * PERSONAL_SPACE;

        // bucket of every cell, clamped to the grid
        self.cell_buckets.resize(n, 0);
        for (i, p) in positions.iter().enumerate() {
            let x = (p.xy[0] / pixel_size).floor().clamp(0.0, grid_max) as u32;
            let y = (p.xy[1] / pixel_size).floor().clamp(0.0, grid_max) as u32;
            self.cell_buckets[i] = y * grid_dim as u32 + x;
        }

        // counting sort into flat bucket_entries
        self.bucket_counts.resize(bucket_n, 0);
        self.bucket_counts.fill(0);
        for &b in &self.cell_buckets {
            self.bucket_counts[b as usize] += 1;
        }
        self.bucket_starts.resize(bucket_n + 1, 0);
        self.bucket_starts[0] = 0;
        for i in 0..bucket_n {
            self.bucket_starts[i + 1] = self.bucket_starts[i] + self.bucket_counts[i];
        }
        self.bucket_entries.resize(n, 0);
        self.bucket_counts.fill(0);
        for (i, &b) in self.cell_buckets.iter().enumerate() {
            let b = b as usize;
            let slot = (self.bucket_starts[b] + self.bucket_counts[b]) as usize;
            self.bucket_entries[slot] = i as u32;
            self.bucket_counts[b] += 1;
        }

        // independent per-cell forces
        for (i, cell) in self.cells.iter_mut().enumerate() {
            cell.confine(&positions[i], sidelen_f, pixel_size);
            cell.seek_destination(&positions[i], sidelen_f);
        }

        // neighbor interactions over the 3x3 bucket neighborhood
        for i in 0..n {
            let pos_x = positions[i].xy[0];
            let pos_y = positions[i].xy[1];
            let bucket = self.cell_buckets[i] as usize;
            let col = bucket % grid_dim;
            let row = bucket / grid_dim;
            let my_stroke = self.cells[i].stroke_id();

            let mut vel_sum_x = 0.0;
            let mut vel_sum_y = 0.0;
            let mut weight_sum = 0.0;

            for dy in 0..=2usize {
                for dx in 0..=2usize {
                    if col + dx == 0 || row + dy == 0 || col + dx > grid_dim || row + dy > grid_dim
                    {
                        continue;
                    }
                    let nbucket = (row + dy - 1) * grid_dim + (col + dx - 1);
                    let start = self.bucket_starts[nbucket] as usize;
                    let end = start + self.bucket_counts[nbucket] as usize;
                    for slot in start..end {
                        let other = self.bucket_entries[slot] as usize;
                        if other == i {
                            continue;
                        }
                        let other_x = positions[other].xy[0];
                        let other_y = positions[other].xy[1];
                        let weight =
                            self.cells[i].repel(pos_x, pos_y, other_x, other_y, personal_space);

                        if my_stroke != 0 && my_stroke == self.cells[other].stroke_id() {
                            self.cells[i].cohere(pos_x, pos_y, other_x, other_y, weight);
                        }

                        let (ovx, ovy) = self.cells[other].velocity();
                        vel_sum_x += ovx * weight;
                        vel_sum_y += ovy * weight;
                        weight_sum += weight;
                    }
                }
            }

            if weight_sum > 0.0 {
                self.cells[i].align_velocity(vel_sum_x / weight_sum, vel_sum_y / weight_sum);
            }
        }

        for (i, cell) in self.cells.iter_mut().enumerate() {
            cell.integrate(&mut positions[i]);
        }
    }

    /// Install a new permutation. Cells are keyed by *source* index: the
    /// cell at index `s` keeps its age, stroke and pull strength while its
    /// endpoints are rebuilt from the new assignment.
    pub fn set_assignments(&mut self, assignments: &[usize], sidelen: u32) {
        let width = (self.cells.len() as f32).sqrt() as usize;
        let pixel_size = sidelen as f32 / width as f32;

        for (dst_idx, &src_idx) in assignments.iter().enumerate() {
            let src_x = (src_idx % width) as f32;
            let src_y = (src_idx / width) as f32;
            let dst_x = (dst_idx % width) as f32;
            let dst_y = (dst_idx / width) as f32;
            let prev = self.cells[src_idx];

            let mut cell = Cell::new(
                (src_x + 0.5) * pixel_size,
                (src_y + 0.5) * pixel_size,
                (dst_x + 0.5) * pixel_size,
                (dst_y + 0.5) * pixel_size,
                prev.dst_force(),
            );
            cell.set_age(prev.age());
            cell.set_stroke_id(prev.stroke_id());
            self.cells[src_idx] = cell;
        }
    }

    /// Rewind to the start of the requested direction. Same direction:
    /// restart from the sources. Opposite: jump to the destinations and
    /// flip every cell.
    pub fn prepare_play(&mut self, positions: &mut [SeedPos], reverse: bool) {
        debug!("prepare_play: reverse = {reverse}, was reversed = {}", self.reversed);
        if self.reversed == reverse {
            for (i, cell) in self.cells.iter_mut().enumerate() {
                let (sx, sy) = cell.src();
                positions[i].xy = [sx, sy];
                cell.set_age(0);
            }
        } else {
            for (i, cell) in self.cells.iter().enumerate() {
                let (dx, dy) = cell.dst();
                positions[i].xy = [dx, dy];
            }
            self.switch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn make_test_sim(grid_size: usize, sidelen: u32) -> (Sim, Vec<SeedPos>) {
        let pixel_size = sidelen as f32 / grid_size as f32;
        let n = grid_size * grid_size;
        let mut seeds = Vec::with_capacity(n);
        let mut cells = Vec::with_capacity(n);
        for y in 0..grid_size {
            for x in 0..grid_size {
                seeds.push(SeedPos {
                    xy: [(x as f32 + 0.5) * pixel_size, (y as f32 + 0.5) * pixel_size],
                });
                cells.push(Cell::new(
                    (x as f32 + 0.5) * pixel_size,
                    (y as f32 + 0.5) * pixel_size,
                    (x as f32 + 0.7) * pixel_size,
                    (y as f32 + 0.3) * pixel_size,
                    0.13,
                ));
            }
        }
        let mut sim = Sim::new("test".to_string());
        sim.cells = cells;
        (sim, seeds)
    }

    fn hash_state(seeds: &[SeedPos], cells: &[Cell]) -> u64 {
        let mut hasher = DefaultHasher::new();
        for s in seeds {
            s.xy[0].to_bits().hash(&mut hasher);
            s.xy[1].to_bits().hash(&mut hasher);
        }
        for c in cells {
            let (vx, vy) = c.velocity();
            vx.to_bits().hash(&mut hasher);
            vy.to_bits().hash(&mut hasher);
            c.age().hash(&mut hasher);
        }
        hasher.finish()
    }

    #[test]
    fn step_is_deterministic() {
        let (mut s1, mut p1) = make_test_sim(16, 1024);
        let (mut s2, mut p2) = make_test_sim(16, 1024);
        for _ in 0..50 {
            s1.step(&mut p1, 1024);
            s2.step(&mut p2, 1024);
        }
        assert_eq!(hash_state(&p1, &s1.cells), hash_state(&p2, &s2.cells));
    }

    #[test]
    fn step_preserves_counts() {
        let (mut sim, mut seeds) = make_test_sim(8, 512);
        let n = seeds.len();
        for _ in 0..20 {
            sim.step(&mut seeds, 512);
        }
        assert_eq!(seeds.len(), n);
        assert_eq!(sim.cells.len(), n);
    }

    #[test]
    fn positions_stay_inside_arena() {
        // random permutation sends cells across the arena; containment may
        // be exceeded only by one clamped velocity step
        let side = 32usize;
        let sidelen = 512u32;
        let n = side * side;
        let mut assignments: Vec<usize> = (0..n).collect();
        let mut rng = frand::Rand::with_seed(99);
        for i in (1..n).rev() {
            let j = rng.gen_range(0..(i + 1) as u32) as usize;
            assignments.swap(i, j);
        }

        let (mut sim, mut seeds) = make_test_sim(side, sidelen);
        sim.set_assignments(&assignments, sidelen);
        for _ in 0..120 {
            sim.step(&mut seeds, sidelen);
        }
        for p in &seeds {
            assert!(p.xy[0] >= -6.0 && p.xy[0] <= sidelen as f32 + 6.0);
            assert!(p.xy[1] >= -6.0 && p.xy[1] <= sidelen as f32 + 6.0);
        }
    }

    #[test]
    fn positions_converge_to_destinations() {
        let (mut sim, mut seeds) = make_test_sim(4, 256);
        for _ in 0..500 {
            sim.step(&mut seeds, 256);
        }
        for (i, cell) in sim.cells.iter().enumerate() {
            let (dx, dy) = cell.dst();
            assert!(
                (seeds[i].xy[0] - dx).abs() < 20.0 && (seeds[i].xy[1] - dy).abs() < 20.0,
                "seed {i} should settle near its destination"
            );
        }
    }

    #[test]
    fn prepare_play_restarts_and_flips() {
        let (mut sim, mut seeds) = make_test_sim(4, 256);
        let srcs: Vec<(f32, f32)> = sim.cells.iter().map(|c| c.src()).collect();
        let dsts: Vec<(f32, f32)> = sim.cells.iter().map(|c| c.dst()).collect();

        // same direction: restart from the sources
        for _ in 0..10 {
            sim.step(&mut seeds, 256);
        }
        sim.prepare_play(&mut seeds, false);
        assert!(!sim.reversed());
        for (i, p) in seeds.iter().enumerate() {
            assert_eq!((p.xy[0], p.xy[1]), srcs[i]);
        }
        assert!(sim.cells.iter().all(|c| c.age() == 0));

        // flip: jump to destinations, endpoints swapped
        sim.prepare_play(&mut seeds, true);
        assert!(sim.reversed());
        for (i, p) in seeds.iter().enumerate() {
            assert_eq!((p.xy[0], p.xy[1]), dsts[i]);
        }
        for (i, cell) in sim.cells.iter().enumerate() {
            assert_eq!(cell.src(), dsts[i]);
            assert_eq!(cell.dst(), srcs[i]);
        }

        // flip back: original endpoints restored
        sim.prepare_play(&mut seeds, false);
        for (i, cell) in sim.cells.iter().enumerate() {
            assert_eq!(cell.src(), srcs[i]);
            assert_eq!(cell.dst(), dsts[i]);
        }
    }

    #[test]
    fn set_assignments_is_source_keyed_and_preserves_state() {
        let (mut sim, _) = make_test_sim(2, 128);
        sim.cells[3].set_age(42);
        sim.cells[3].set_stroke_id(7);
        sim.cells[3].set_dst_force(0.5);

        // target 0 takes source 3; the cell at index 3 is rebuilt
        sim.set_assignments(&[3, 1, 2, 0], 128);
        let pixel = 64.0;
        assert_eq!(sim.cells[3].src(), (1.5 * pixel, 1.5 * pixel));
        assert_eq!(sim.cells[3].dst(), (0.5 * pixel, 0.5 * pixel));
        assert_eq!(sim.cells[3].age(), 42);
        assert_eq!(sim.cells[3].stroke_id(), 7);
        assert_eq!(sim.cells[3].dst_force(), 0.5);
    }

    #[test]
    fn cohesion_applies_only_to_matching_nonzero_strokes() {
        let sidelen = 128u32;
        // cluster the seeds inside one personal space so repulsion weights
        // are non-zero and cohesion has something to scale
        let clustered = [[60.0, 60.0], [70.0, 60.0], [60.0, 70.0], [70.0, 70.0]];

        let (mut plain, mut plain_seeds) = make_test_sim(2, sidelen);
        let (mut tagged, mut tagged_seeds) = make_test_sim(2, sidelen);
        for (i, xy) in clustered.iter().enumerate() {
            plain_seeds[i].xy = *xy;
            tagged_seeds[i].xy = *xy;
        }
        for c in tagged.cells_mut() {
            c.set_stroke_id(1);
        }

        plain.step(&mut plain_seeds, sidelen);
        tagged.step(&mut tagged_seeds, sidelen);

        // stroke id 0 everywhere: no cohesion; matching non-zero ids pull
        // the cluster together, so the motion must differ
        let a = plain_seeds.iter().map(|p| p.xy).collect::<Vec<_>>();
        let b = tagged_seeds.iter().map(|p| p.xy).collect::<Vec<_>>();
        assert_ne!(a, b);
    }

    #[test]
    fn init_image_centers_seeds_and_normalizes_colors() {
        let side = 4u32;
        let img: Vec<u8> = (0..side * side)
            .flat_map(|i| [(i * 16) as u8, 0, 255])
            .collect();
        let preset = Preset {
            inner: UnprocessedPreset {
                name: "p".to_string(),
                width: side,
                height: side,
                source_img: img,
            },
            assignments: (0..(side * side) as usize).collect(),
        };
        let (count, seeds, colors, sim) = init_image(256, preset);
        assert_eq!(count, 16);
        assert_eq!(seeds[0].xy, [32.0, 32.0]);
        assert_eq!(colors[0].rgba, [0.0, 0.0, 1.0, 1.0]);
        assert!(sim.cells().iter().all(|c| c.dst_force() == 0.13));
        assert_eq!(sim.name(), "p");
    }
}

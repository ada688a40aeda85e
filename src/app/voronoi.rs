use crate::app::{SeedColor, SeedPos};

/// CPU nearest-seed rasterizer. Seeds are bucketed once per frame with the
/// same counting-sort layout the simulation grid uses; each output pixel
/// scans a 5x5 bucket window. Ties break toward the smallest seed index.
pub struct VoronoiRenderer {
    bucket_counts: Vec<u32>,
    bucket_starts: Vec<u32>,
    bucket_entries: Vec<u32>,
}

impl VoronoiRenderer {
    pub fn new() -> Self {
        Self {
            bucket_counts: Vec::new(),
            bucket_starts: Vec::new(),
            bucket_entries: Vec::new(),
        }
    }

    /// Render an RGBA8 `sidelen` x `sidelen` image into `out`.
    pub fn render(
        &mut self,
        positions: &[SeedPos],
        colors: &[SeedColor],
        sidelen: u32,
        out: &mut Vec<u8>,
    ) {
        let n = positions.len();
        let side = sidelen as usize;
        out.clear();
        out.resize(side * side * 4, 0);
        if n == 0 {
            return;
        }

        let cell = (((sidelen as f64 * sidelen as f64) / n as f64).sqrt().ceil() as u32).max(1);
        let grid_w = sidelen.div_ceil(cell) as usize;
        let grid_max = (grid_w - 1) as f32;
        let bucket_n = grid_w * grid_w;

        self.bucket_counts.resize(bucket_n, 0);
        self.bucket_counts.fill(0);
        let bucket_of = |p: &SeedPos| -> usize {
            let bx = (p.xy[0] / cell as f32).floor().clamp(0.0, grid_max) as usize;
            let by = (p.xy[1] / cell as f32).floor().clamp(0.0, grid_max) as usize;
            by * grid_w + bx
        };
        for p in positions {
            self.bucket_counts[bucket_of(p)] += 1;
        }
        self.bucket_starts.resize(bucket_n + 1, 0);
        self.bucket_starts[0] = 0;
        for i in 0..bucket_n {
            self.bucket_starts[i + 1] = self.bucket_starts[i] + self.bucket_counts[i];
        }
        self.bucket_entries.resize(n, 0);
        self.bucket_counts.fill(0);
        for (i, p) in positions.iter().enumerate() {
            let b = bucket_of(p);
            let slot = (self.bucket_starts[b] + self.bucket_counts[b]) as usize;
            self.bucket_entries[slot] = i as u32;
            self.bucket_counts[b] += 1;
        }

        for y in 0..side {
            for x in 0..side {
                let px = x as f32 + 0.5;
                let py = y as f32 + 0.5;
                let bx = (x as u32 / cell) as usize;
                let by = (y as u32 / cell) as usize;

                let mut best = usize::MAX;
                let mut best_d2 = f32::INFINITY;
                for nby in by.saturating_sub(2)..=(by + 2).min(grid_w - 1) {
                    for nbx in bx.saturating_sub(2)..=(bx + 2).min(grid_w - 1) {
                        let b = nby * grid_w + nbx;
                        let start = self.bucket_starts[b] as usize;
                        let end = start + self.bucket_counts[b] as usize;
                        for slot in start..end {
                            let i = self.bucket_entries[slot] as usize;
                            let dx = positions[i].xy[0] - px;
                            let dy = positions[i].xy[1] - py;
                            let d2 = dx * dx + dy * dy;
                            if d2 < best_d2 || (d2 == best_d2 && i < best) {
                                best_d2 = d2;
                                best = i;
                            }
                        }
                    }
                }

                // sparse window: fall back to scanning every seed
                if best == usize::MAX {
                    best = nearest_brute(positions, px, py);
                }

                write_rgba(out, (y * side + x) * 4, &colors[best]);
            }
        }
    }
}

impl Default for VoronoiRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn nearest_brute(positions: &[SeedPos], px: f32, py: f32) -> usize {
    let mut best = 0;
    let mut best_d2 = f32::INFINITY;
    for (i, p) in positions.iter().enumerate() {
        let dx = p.xy[0] - px;
        let dy = p.xy[1] - py;
        let d2 = dx * dx + dy * dy;
        if d2 < best_d2 {
            best_d2 = d2;
            best = i;
        }
    }
    best
}

fn write_rgba(out: &mut [u8], base: usize, color: &SeedColor) {
    // rounding keeps u8 -> f32 -> u8 color trips exact
    out[base] = (color.rgba[0] * 255.0).round() as u8;
    out[base + 1] = (color.rgba[1] * 255.0).round() as u8;
    out[base + 2] = (color.rgba[2] * 255.0).round() as u8;
    out[base + 3] = (color.rgba[3] * 255.0).round() as u8;
}

/// Reference renderer: every pixel scans every seed. Kept for parity tests
/// and as the semantics the grid variant must reproduce.
pub fn render_brute(positions: &[SeedPos], colors: &[SeedColor], sidelen: u32) -> Vec<u8> {
    let side = sidelen as usize;
    let mut out = vec![0; side * side * 4];
    if positions.is_empty() {
        return out;
    }
    for y in 0..side {
        for x in 0..side {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            let best = nearest_brute(positions, px, py);
            write_rgba(&mut out, (y * side + x) * 4, &colors[best]);
        }
    }
    out
}

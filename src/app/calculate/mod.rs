pub mod drawing_process;
pub mod util;

use std::error::Error;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use image::RgbImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::preset::{Preset, UnprocessedPreset};
use util::{Algorithm, GenerationSettings, seed_from_id};

/// Cost of filling a target position with the source pixel that currently
/// sits at `apos`. The spatial term is squared *after* weighting, which
/// makes spatial mismatch dominate at coarse scales.
#[inline(always)]
fn heuristic(
    apos: (u16, u16),
    bpos: (u16, u16),
    a: (u8, u8, u8),
    b: (u8, u8, u8),
    color_weight: f64,
    spatial_weight: f64,
) -> f64 {
    let spatial =
        (apos.0 as f64 - bpos.0 as f64).powi(2) + (apos.1 as f64 - bpos.1 as f64).powi(2);
    let color = (a.0 as f64 - b.0 as f64).powi(2)
        + (a.1 as f64 - b.1 as f64).powi(2)
        + (a.2 as f64 - b.2 as f64).powi(2);
    color * color_weight + (spatial * spatial_weight).powi(2)
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMsg {
    Progress {
        value: f32,
    },
    UpdatePreview {
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
    /// Drawing solver only.
    UpdateAssignments {
        assignments: Vec<u32>,
    },
    Done {
        preset: Preset,
    },
    Error {
        message: String,
    },
    Cancelled,
}

impl ProgressMsg {
    pub fn typ(&self) -> &'static str {
        match self {
            ProgressMsg::Progress { .. } => "progress",
            ProgressMsg::UpdatePreview { .. } => "update_preview",
            ProgressMsg::UpdateAssignments { .. } => "update_assignments",
            ProgressMsg::Done { .. } => "done",
            ProgressMsg::Error { .. } => "error",
            ProgressMsg::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReq {
    Process {
        source: UnprocessedPreset,
        settings: GenerationSettings,
    },
    Cancel,
}

pub trait ProgressSink {
    fn send(&mut self, msg: ProgressMsg);
}

impl<F: FnMut(ProgressMsg)> ProgressSink for F {
    fn send(&mut self, msg: ProgressMsg) {
        self(msg)
    }
}

/// Project a permutation onto the source palette: target position `t` gets
/// the color of source position `assignments[t]`.
pub fn project_assignments(
    source_pixels: &[(u8, u8, u8)],
    assignments: &[usize],
    sidelen: u32,
) -> Vec<u8> {
    let mut img = vec![0; (sidelen * sidelen * 3) as usize];
    for (target_idx, source_idx) in assignments.iter().enumerate() {
        let (r, g, b) = source_pixels[*source_idx];
        let base = target_idx * 3;
        img[base] = r;
        img[base + 1] = g;
        img[base + 2] = b;
    }
    img
}

/// Inverse permutation: if `assignments[t] = s` then `inverse[s] = t`.
pub fn invert_assignments(assignments: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0usize; assignments.len()];
    for (t, &s) in assignments.iter().enumerate() {
        inverse[s] = t;
    }
    inverse
}

fn decode_source(unprocessed: &UnprocessedPreset) -> Result<RgbImage, Box<dyn Error>> {
    RgbImage::from_vec(
        unprocessed.width,
        unprocessed.height,
        unprocessed.source_img.clone(),
    )
    .ok_or_else(|| "source buffer does not match its dimensions".into())
}

fn send_preview<S: ProgressSink>(
    tx: &mut S,
    source_pixels: &[(u8, u8, u8)],
    assignments: &[usize],
    sidelen: u32,
) {
    let data = project_assignments(source_pixels, assignments, sidelen);
    tx.send(ProgressMsg::UpdatePreview {
        width: sidelen,
        height: sidelen,
        data,
    });
}

fn done_preset(name: String, sidelen: u32, source_pixels: &[(u8, u8, u8)]) -> UnprocessedPreset {
    UnprocessedPreset {
        name,
        width: sidelen,
        height: sidelen,
        source_img: source_pixels
            .iter()
            .flat_map(|&(r, g, b)| [r, g, b])
            .collect(),
    }
}

/// One slot per target position: which source pixel currently occupies it
/// and the cached heuristic of that placement.
#[derive(Clone, Copy)]
struct Placed {
    src_x: u16,
    src_y: u16,
    rgb: (u8, u8, u8),
    h: f64,
}

impl Placed {
    fn new(src_x: u16, src_y: u16, rgb: (u8, u8, u8), h: f64) -> Self {
        Self { src_x, src_y, rgb, h }
    }

    fn rescore(&mut self, new_h: f64) {
        self.h = new_h;
    }

    #[inline(always)]
    fn cost_at(
        &self,
        target_pos: (u16, u16),
        target_col: (u8, u8, u8),
        weight: f64,
        proximity_importance: f64,
    ) -> f64 {
        heuristic(
            (self.src_x, self.src_y),
            target_pos,
            self.rgb,
            target_col,
            weight,
            proximity_importance,
        )
    }
}

const SWAPS_PER_GENERATION_PER_PIXEL: usize = 128;

/// Randomized local search: pairwise swap trials inside a shrinking search
/// radius, accepted only when the summed heuristic strictly decreases.
pub fn process_genetic<S: ProgressSink>(
    unprocessed: UnprocessedPreset,
    settings: GenerationSettings,
    tx: &mut S,
    cancel: Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    let source_img = decode_source(&unprocessed)?;
    let (source_pixels, target_pixels, weights) = util::get_images(source_img, &settings)?;
    let side = settings.sidelen as usize;
    let n = source_pixels.len();
    let w_s = settings.proximity_importance as f64;
    info!("genetic solver: {side}x{side}, {n} pixels");

    let mut slots = source_pixels
        .iter()
        .enumerate()
        .map(|(i, &rgb)| {
            let x = (i % side) as u16;
            let y = (i / side) as u16;
            let mut p = Placed::new(x, y, rgb, 0.0);
            let h = p.cost_at((x, y), target_pixels[i], weights[i], w_s);
            p.rescore(h);
            p
        })
        .collect::<Vec<_>>();

    let mut rng = frand::Rand::with_seed(seed_from_id(&settings.id.to_string()));
    let swaps_per_generation = SWAPS_PER_GENERATION_PER_PIXEL * n;

    let mut max_dist = settings.sidelen;
    loop {
        let mut swaps_made = 0usize;
        for _ in 0..swaps_per_generation {
            let apos = rng.gen_range(0..n as u32) as usize;
            let ax = (apos % side) as i16;
            let ay = (apos / side) as i16;
            let bx = (ax + rng.gen_range(-(max_dist as i16)..(max_dist as i16 + 1)))
                .clamp(0, side as i16 - 1) as u16;
            let by = (ay + rng.gen_range(-(max_dist as i16)..(max_dist as i16 + 1)))
                .clamp(0, side as i16 - 1) as u16;
            let bpos = by as usize * side + bx as usize;

            let a_on_b_h =
                slots[apos].cost_at((bx, by), target_pixels[bpos], weights[bpos], w_s);
            let b_on_a_h = slots[bpos].cost_at(
                (ax as u16, ay as u16),
                target_pixels[apos],
                weights[apos],
                w_s,
            );

            let improvement_a = slots[apos].h - b_on_a_h;
            let improvement_b = slots[bpos].h - a_on_b_h;
            if improvement_a + improvement_b > 0.0 {
                slots.swap(apos, bpos);
                slots[apos].rescore(b_on_a_h);
                slots[bpos].rescore(a_on_b_h);
                swaps_made += 1;
            }
        }

        if cancel.load(Ordering::Relaxed) {
            info!("genetic solver cancelled");
            tx.send(ProgressMsg::Cancelled);
            return Ok(());
        }

        let assignments = slots
            .iter()
            .map(|p| p.src_y as usize * side + p.src_x as usize)
            .collect::<Vec<_>>();
        debug!("generation done: max_dist = {max_dist}, swaps = {swaps_made}");

        if max_dist < 4 && swaps_made < 10 {
            info!("genetic solver converged");
            tx.send(ProgressMsg::Done {
                preset: Preset {
                    inner: done_preset(unprocessed.name, settings.sidelen, &source_pixels),
                    assignments,
                },
            });
            return Ok(());
        }

        send_preview(tx, &source_pixels, &assignments, settings.sidelen);
        tx.send(ProgressMsg::Progress {
            value: 1.0 - max_dist as f32 / settings.sidelen as f32,
        });

        max_dist = ((max_dist as f32 * 0.99).max(2.0)) as u32;
    }
}

/// Deterministic greedy matcher, documented stand-in for a full Hungarian
/// solver. O(N²); feasible up to roughly 256 a side.
pub fn process_optimal<S: ProgressSink>(
    unprocessed: UnprocessedPreset,
    settings: GenerationSettings,
    tx: &mut S,
    cancel: Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    let source_img = decode_source(&unprocessed)?;
    let (source_pixels, target_pixels, weights) = util::get_images(source_img, &settings)?;
    let side = settings.sidelen as usize;
    let n = source_pixels.len();
    let w_s = settings.proximity_importance as f64;
    info!("optimal (greedy) solver: {side}x{side}, {n} pixels");

    let mut assignments = vec![0usize; n];
    let mut consumed = vec![false; n];
    let mut consumed_count = 0usize;

    for target_idx in 0..n {
        if target_idx % 100 == 0 {
            if cancel.load(Ordering::Relaxed) {
                info!("optimal solver cancelled");
                tx.send(ProgressMsg::Cancelled);
                return Ok(());
            }
            tx.send(ProgressMsg::Progress {
                value: target_idx as f32 / n as f32,
            });
            send_preview(tx, &source_pixels, &assignments, settings.sidelen);
        }

        let t_pos = ((target_idx % side) as u16, (target_idx / side) as u16);
        let t_col = target_pixels[target_idx];
        let weight = weights[target_idx];

        let mut best_source = usize::MAX;
        let mut best_cost = f64::INFINITY;
        for (src_idx, &rgb) in source_pixels.iter().enumerate() {
            if consumed[src_idx] {
                continue;
            }
            let s_pos = ((src_idx % side) as u16, (src_idx / side) as u16);
            let cost = heuristic(s_pos, t_pos, rgb, t_col, weight, w_s);
            if cost < best_cost {
                best_cost = cost;
                best_source = src_idx;
            }
        }

        assignments[target_idx] = best_source;
        consumed[best_source] = true;
        consumed_count += 1;
    }

    if consumed_count != n {
        tx.send(ProgressMsg::Error {
            message: format!("greedy matcher consumed {consumed_count} of {n} sources"),
        });
        return Ok(());
    }

    tx.send(ProgressMsg::Done {
        preset: Preset {
            inner: done_preset(unprocessed.name, settings.sidelen, &source_pixels),
            assignments,
        },
    });
    Ok(())
}

/// Auction assignment: targets bid for sources with an ε increment,
/// Gauss-Seidel style (one bidder per round keeps price cycles stable).
pub fn process_auction<S: ProgressSink>(
    unprocessed: UnprocessedPreset,
    settings: GenerationSettings,
    tx: &mut S,
    cancel: Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    let source_img = decode_source(&unprocessed)?;
    let (source_pixels, target_pixels, weights) = util::get_images(source_img, &settings)?;
    let side = settings.sidelen as usize;
    let n = source_pixels.len();
    let w_s = settings.proximity_importance as f64;
    info!("auction solver: {side}x{side}, {n} pixels");

    let value_of = |target_idx: usize, source_idx: usize| -> f64 {
        let t_pos = ((target_idx % side) as u16, (target_idx / side) as u16);
        let s_pos = ((source_idx % side) as u16, (source_idx / side) as u16);
        -heuristic(
            s_pos,
            t_pos,
            source_pixels[source_idx],
            target_pixels[target_idx],
            weights[target_idx],
            w_s,
        )
    };

    let mut prices = vec![0.0f64; n];
    let mut target_to_source: Vec<Option<usize>> = vec![None; n];
    let mut source_to_target: Vec<Option<usize>> = vec![None; n];

    let epsilon = 1.0 / (n as f64 + 1.0);
    let max_iterations = n * 20;
    let max_stale = 100;
    let mut stale_count = 0;
    let mut last_unassigned_count = n;
    let mut iteration = 0;

    while iteration < max_iterations {
        let unassigned: Vec<usize> = (0..n).filter(|&i| target_to_source[i].is_none()).collect();
        if unassigned.is_empty() {
            break;
        }

        if unassigned.len() >= last_unassigned_count {
            stale_count += 1;
            if stale_count >= max_stale {
                // Price war cycle: pair the leftovers directly.
                warn!(
                    "auction stuck at {} unassigned, finishing greedily",
                    unassigned.len()
                );
                let free_sources: Vec<usize> =
                    (0..n).filter(|&i| source_to_target[i].is_none()).collect();
                for (&t, &s) in unassigned.iter().zip(free_sources.iter()) {
                    target_to_source[t] = Some(s);
                    source_to_target[s] = Some(t);
                }
                break;
            }
        } else {
            stale_count = 0;
            last_unassigned_count = unassigned.len();
        }

        if cancel.load(Ordering::Relaxed) {
            info!("auction solver cancelled");
            tx.send(ProgressMsg::Cancelled);
            return Ok(());
        }

        let target_idx = unassigned[iteration % unassigned.len()];

        let mut best_source = 0;
        let mut best_value = f64::NEG_INFINITY;
        let mut second_best_value = f64::NEG_INFINITY;
        for source_idx in 0..n {
            let value = value_of(target_idx, source_idx) - prices[source_idx];
            if value > best_value {
                second_best_value = best_value;
                best_value = value;
                best_source = source_idx;
            } else if value > second_best_value {
                second_best_value = value;
            }
        }
        if second_best_value == f64::NEG_INFINITY {
            second_best_value = best_value - epsilon;
        }

        let bid_increment = best_value - second_best_value + epsilon;
        if let Some(old_target) = source_to_target[best_source] {
            target_to_source[old_target] = None;
        }
        target_to_source[target_idx] = Some(best_source);
        source_to_target[best_source] = Some(target_idx);
        prices[best_source] += bid_increment;

        iteration += 1;

        if iteration % 200 == 0 {
            let assigned = n - unassigned.len();
            tx.send(ProgressMsg::Progress {
                value: assigned as f32 / n as f32,
            });
            let partial: Vec<usize> = target_to_source
                .iter()
                .enumerate()
                .map(|(i, opt)| opt.unwrap_or(i))
                .collect();
            send_preview(tx, &source_pixels, &partial, settings.sidelen);
        }
    }

    // Iteration cap hit: pair whatever is still free, keeping the bijection.
    let mut free_sources = (0..n).filter(|&i| source_to_target[i].is_none());
    let assignments: Vec<usize> = target_to_source
        .iter()
        .map(|opt| match opt {
            Some(s) => *s,
            None => free_sources.next().expect("source pool exhausted"),
        })
        .collect();

    tx.send(ProgressMsg::Done {
        preset: Preset {
            inner: done_preset(unprocessed.name, settings.sidelen, &source_pixels),
            assignments,
        },
    });
    Ok(())
}

const HYBRID_COARSE_SIDELEN: u32 = 64;
const HYBRID_REFINEMENT_PASSES: usize = 20;

/// Greedy pass at a coarse resolution, block-upsampled, then refined with
/// local swap passes.
pub fn process_hybrid<S: ProgressSink>(
    unprocessed: UnprocessedPreset,
    settings: GenerationSettings,
    tx: &mut S,
    cancel: Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    let coarse_sidelen = HYBRID_COARSE_SIDELEN.min(settings.sidelen);
    let scale_factor = (settings.sidelen / coarse_sidelen) as usize;

    let mut coarse_settings = settings.clone();
    coarse_settings.sidelen = coarse_sidelen;

    let mut coarse_result: Option<Vec<usize>> = None;
    {
        let mut coarse_sink = |msg: ProgressMsg| match msg {
            ProgressMsg::Progress { value } => {
                tx.send(ProgressMsg::Progress { value: value * 0.5 })
            }
            ProgressMsg::Done { preset } => coarse_result = Some(preset.assignments),
            ProgressMsg::UpdatePreview { .. } => {}
            other => tx.send(other),
        };
        process_optimal(
            unprocessed.clone(),
            coarse_settings,
            &mut coarse_sink,
            cancel.clone(),
        )?;
    }
    let coarse_assignments = match coarse_result {
        Some(a) => a,
        // Cancelled or errored during the coarse pass; the sink already
        // forwarded the terminal message.
        None => return Ok(()),
    };

    let source_img = decode_source(&unprocessed)?;
    let (source_pixels, target_pixels, weights) = util::get_images(source_img, &settings)?;
    let side = settings.sidelen as usize;
    let n = source_pixels.len();
    let w_s = settings.proximity_importance as f64;

    // Block-upsample the coarse permutation onto the fine grid.
    let mut assignments: Vec<usize> = (0..n).collect();
    let coarse = coarse_sidelen as usize;
    for (coarse_target, &coarse_source) in coarse_assignments.iter().enumerate() {
        let (ctx, cty) = (coarse_target % coarse, coarse_target / coarse);
        let (csx, csy) = (coarse_source % coarse, coarse_source / coarse);
        for dy in 0..scale_factor {
            for dx in 0..scale_factor {
                let fine_target = (cty * scale_factor + dy) * side + ctx * scale_factor + dx;
                let fine_source = (csy * scale_factor + dy) * side + csx * scale_factor + dx;
                if fine_target < n && fine_source < n {
                    assignments[fine_target] = fine_source;
                }
            }
        }
    }

    tx.send(ProgressMsg::Progress { value: 0.5 });

    let mut slots: Vec<Placed> = assignments
        .iter()
        .enumerate()
        .map(|(target_idx, &source_idx)| {
            let rgb = source_pixels[source_idx];
            let sx = (source_idx % side) as u16;
            let sy = (source_idx / side) as u16;
            let t_pos = ((target_idx % side) as u16, (target_idx / side) as u16);
            let h = heuristic(
                (sx, sy),
                t_pos,
                rgb,
                target_pixels[target_idx],
                weights[target_idx],
                w_s,
            );
            Placed::new(sx, sy, rgb, h)
        })
        .collect();

    let mut rng = frand::Rand::with_seed(seed_from_id(&settings.id.to_string()));
    let swaps_per_pass = n * 8;

    for pass in 0..HYBRID_REFINEMENT_PASSES {
        if cancel.load(Ordering::Relaxed) {
            info!("hybrid solver cancelled");
            tx.send(ProgressMsg::Cancelled);
            return Ok(());
        }

        let remaining =
            (HYBRID_REFINEMENT_PASSES - pass) as f32 / HYBRID_REFINEMENT_PASSES as f32;
        let max_dist = ((remaining * settings.sidelen as f32 / 4.0).max(2.0)) as u32;

        for _ in 0..swaps_per_pass {
            let apos = rng.gen_range(0..n as u32) as usize;
            let ax = (apos % side) as i16;
            let ay = (apos / side) as i16;
            let bx = (ax + rng.gen_range(-(max_dist as i16)..(max_dist as i16 + 1)))
                .clamp(0, side as i16 - 1) as u16;
            let by = (ay + rng.gen_range(-(max_dist as i16)..(max_dist as i16 + 1)))
                .clamp(0, side as i16 - 1) as u16;
            let bpos = by as usize * side + bx as usize;

            let a_on_b_h =
                slots[apos].cost_at((bx, by), target_pixels[bpos], weights[bpos], w_s);
            let b_on_a_h = slots[bpos].cost_at(
                (ax as u16, ay as u16),
                target_pixels[apos],
                weights[apos],
                w_s,
            );

            if (slots[apos].h - b_on_a_h) + (slots[bpos].h - a_on_b_h) > 0.0 {
                slots.swap(apos, bpos);
                slots[apos].rescore(b_on_a_h);
                slots[bpos].rescore(a_on_b_h);
            }
        }

        tx.send(ProgressMsg::Progress {
            value: 0.5 + (pass as f32 / HYBRID_REFINEMENT_PASSES as f32) * 0.5,
        });
        let current: Vec<usize> = slots
            .iter()
            .map(|p| p.src_y as usize * side + p.src_x as usize)
            .collect();
        send_preview(tx, &source_pixels, &current, settings.sidelen);
    }

    let final_assignments: Vec<usize> = slots
        .iter()
        .map(|p| p.src_y as usize * side + p.src_x as usize)
        .collect();

    tx.send(ProgressMsg::Done {
        preset: Preset {
            inner: done_preset(unprocessed.name, settings.sidelen, &source_pixels),
            assignments: final_assignments,
        },
    });
    Ok(())
}

pub fn process<S: ProgressSink>(
    unprocessed: UnprocessedPreset,
    settings: GenerationSettings,
    tx: &mut S,
    cancel: Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    match settings.algorithm {
        Algorithm::Genetic => process_genetic(unprocessed, settings, tx, cancel),
        Algorithm::Optimal => process_optimal(unprocessed, settings, tx, cancel),
        Algorithm::Auction => process_auction(unprocessed, settings, tx, cancel),
        Algorithm::Hybrid => process_hybrid(unprocessed, settings, tx, cancel),
    }
}

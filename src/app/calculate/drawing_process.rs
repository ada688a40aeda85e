use std::error::Error;
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU32, Ordering},
};

use log::info;

use super::{Placed, ProgressMsg, ProgressSink};
use crate::app::SeedColor;
use crate::app::calculate::util::{GenerationSettings, seed_from_id};
use crate::app::preset::UnprocessedPreset;

pub const DRAWING_CANVAS_SIZE: u32 = 64;

/// Large negative bonus for placements that extend an existing stroke
/// region; dwarfs any color/spatial cost so strokes stay contiguous.
pub const STROKE_REWARD: f64 = -1e10;

const SWAPS_PER_GENERATION_PER_PIXEL: usize = 128;
const GENERATIONS_PER_YIELD: u32 = 10;

/// Per-position brush state written by the host while the user strokes.
#[derive(Clone, Copy)]
pub struct PixelData {
    pub stroke_id: u32,
    pub last_edited: u32,
}

impl PixelData {
    pub fn init_canvas(frame: u32) -> Vec<PixelData> {
        vec![
            PixelData {
                stroke_id: 0,
                last_edited: frame,
            };
            (DRAWING_CANVAS_SIZE * DRAWING_CANVAS_SIZE) as usize
        ]
    }
}

/// Search radius for a pixel that was last edited `age` ticks ago: a fresh
/// edit searches a quarter of the canvas, an untouched pixel converges to
/// a small neighborhood.
fn max_search_dist(sidelen: u32, age: u32) -> i16 {
    ((sidelen as f64 / 4.0) * 0.99f64.powf(age as f64 / 30.0)).round() as i16
}

/// STROKE_REWARD if any 4-neighbor of `pos` belongs to stroke `stroke`.
/// Stroke id 0 means "no stroke" and never matches.
fn stroke_reward(pixel_data: &[PixelData], side: usize, pos: usize, stroke: u32) -> f64 {
    if stroke == 0 {
        return 0.0;
    }
    let x = pos % side;
    let y = pos / side;
    let hit = (x > 0 && pixel_data[pos - 1].stroke_id == stroke)
        || (x + 1 < side && pixel_data[pos + 1].stroke_id == stroke)
        || (y > 0 && pixel_data[pos - side].stroke_id == stroke)
        || (y + 1 < side && pixel_data[pos + side].stroke_id == stroke);
    if hit { STROKE_REWARD } else { 0.0 }
}

fn snapshot_target(colors: &RwLock<Vec<SeedColor>>) -> Vec<(u8, u8, u8)> {
    colors
        .read()
        .unwrap()
        .iter()
        .map(|c| {
            (
                (c.rgba[0] * 255.0) as u8,
                (c.rgba[1] * 255.0) as u8,
                (c.rgba[2] * 255.0) as u8,
            )
        })
        .collect()
}

/// Continuous localized re-assignment while the user paints. Runs the
/// genetic swap loop against the live canvas colors, bounding each trial by
/// the edit age of both endpoints, and never terminates on its own: the
/// host cancels it by bumping `current_id`.
///
/// `frame_clock` is the host's frame counter, the same clock that stamps
/// `PixelData::last_edited`; edit ages are only meaningful as differences
/// on that one clock.
#[allow(clippy::too_many_arguments)]
pub fn drawing_process_genetic<S: ProgressSink>(
    source: UnprocessedPreset,
    settings: GenerationSettings,
    tx: &mut S,
    colors: Arc<RwLock<Vec<SeedColor>>>,
    pixel_data: Arc<RwLock<Vec<PixelData>>>,
    frame_clock: Arc<AtomicU32>,
    my_id: u32,
    current_id: Arc<AtomicU32>,
) -> Result<(), Box<dyn Error>> {
    let source_img = image::RgbImage::from_vec(source.width, source.height, source.source_img)
        .ok_or("canvas buffer does not match its dimensions")?;
    let (source_pixels, _, _) = super::util::get_images(source_img, &settings)?;
    let side = settings.sidelen as usize;
    let n = source_pixels.len();
    let w_s = settings.proximity_importance as f64;
    info!("drawing solver started: {side}x{side}, id {my_id}");

    let mut target_pixels = snapshot_target(&colors);
    let mut pd = pixel_data.read().unwrap().clone();
    if target_pixels.len() != n || pd.len() != n {
        return Err("canvas state does not match the solver sidelen".into());
    }

    let rescore_all = |slots: &mut [Placed], target: &[(u8, u8, u8)], pd: &[PixelData]| {
        for (i, slot) in slots.iter_mut().enumerate() {
            let pos = ((i % side) as u16, (i / side) as u16);
            let h = slot.cost_at(pos, target[i], 255.0, w_s) + stroke_reward(pd, side, i, pd[i].stroke_id);
            slot.rescore(h);
        }
    };

    let mut slots: Vec<Placed> = source_pixels
        .iter()
        .enumerate()
        .map(|(i, &rgb)| Placed::new((i % side) as u16, (i / side) as u16, rgb, 0.0))
        .collect();
    rescore_all(&mut slots, &target_pixels, &pd);

    let mut rng = frand::Rand::with_seed(seed_from_id(&settings.id.to_string()));
    let swaps_per_generation = SWAPS_PER_GENERATION_PER_PIXEL * n;
    let mut generation = 0u32;

    loop {
        // host frame clock, sampled once per generation
        let tick = frame_clock.load(Ordering::Relaxed);
        for _ in 0..swaps_per_generation {
            let apos = rng.gen_range(0..n as u32) as usize;
            let ax = (apos % side) as i16;
            let ay = (apos / side) as i16;
            let age_a = tick.saturating_sub(pd[apos].last_edited);
            let reach_a = max_search_dist(settings.sidelen, age_a).max(1);
            let bx = (ax + rng.gen_range(-reach_a..reach_a + 1)).clamp(0, side as i16 - 1);
            let by = (ay + rng.gen_range(-reach_a..reach_a + 1)).clamp(0, side as i16 - 1);
            let bpos = by as usize * side + bx as usize;

            // Asymmetric bound: a freshly-edited pixel may pull in a stable
            // one, but the pair is rejected when it exceeds what the
            // destination pixel's own age allows.
            let age_b = tick.saturating_sub(pd[bpos].last_edited);
            let reach_b = max_search_dist(settings.sidelen, age_b);
            if (bx - ax).abs() > reach_b || (by - ay).abs() > reach_b {
                continue;
            }

            let a_on_b_h = slots[apos].cost_at(
                (bx as u16, by as u16),
                target_pixels[bpos],
                255.0,
                w_s,
            ) + stroke_reward(&pd, side, bpos, pd[apos].stroke_id);
            let b_on_a_h = slots[bpos].cost_at(
                (ax as u16, ay as u16),
                target_pixels[apos],
                255.0,
                w_s,
            ) + stroke_reward(&pd, side, apos, pd[bpos].stroke_id);

            if (slots[apos].h - b_on_a_h) + (slots[bpos].h - a_on_b_h) > 0.0 {
                slots.swap(apos, bpos);
                slots[apos].rescore(b_on_a_h);
                slots[bpos].rescore(a_on_b_h);
            }
        }

        let assignments: Vec<u32> = slots
            .iter()
            .map(|p| p.src_y as u32 * side as u32 + p.src_x as u32)
            .collect();
        tx.send(ProgressMsg::UpdateAssignments { assignments });

        generation += 1;

        if generation % GENERATIONS_PER_YIELD == 0 {
            if current_id.load(Ordering::SeqCst) != my_id {
                info!("drawing solver {my_id} superseded, exiting");
                tx.send(ProgressMsg::Cancelled);
                return Ok(());
            }
            // Pick up brush edits delivered since the last yield.
            target_pixels = snapshot_target(&colors);
            pd = pixel_data.read().unwrap().clone();
            rescore_all(&mut slots, &target_pixels, &pd);
        }
    }
}

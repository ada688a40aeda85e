pub mod calculate;
pub mod cell;
pub mod gui;
pub mod morph_sim;
pub mod preset;
pub mod recorder;
pub mod voronoi;

use std::error::Error;
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, AtomicU32, Ordering},
    mpsc,
};
use std::thread::{self, JoinHandle};

use log::{info, warn};
use uuid::Uuid;

use calculate::drawing_process::{self, DRAWING_CANVAS_SIZE, PixelData};
use calculate::util::GenerationSettings;
use calculate::{ProgressMsg, WorkerReq};
use gui::{GuiMode, GuiState};
use morph_sim::Sim;
use preset::{Preset, UnprocessedPreset};
use recorder::{FrameRecorder, FrameSink};
use voronoi::VoronoiRenderer;

pub const DEFAULT_RESOLUTION: u32 = 1024;
pub(crate) const DRAWING_ALPHA: f32 = 0.5;

/// Current world position of one cell, shared between the simulation and
/// the rasterizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedPos {
    pub xy: [f32; 2],
}

/// Normalized RGBA of one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedColor {
    pub rgba: [f32; 4],
}

/// Distance from `(px, py)` to the segment `(x0, y0)..(x1, y1)`.
pub(crate) fn point_to_line_dist(px: f32, py: f32, x0: f32, y0: f32, x1: f32, y1: f32) -> f32 {
    let dx = x1 - x0;
    let dy = y1 - y0;
    if dx == 0.0 && dy == 0.0 {
        (px - x0).hypot(py - y0)
    } else {
        let t = ((px - x0) * dx + (py - y0) * dy) / (dx * dx + dy * dy);
        if t < 0.0 {
            (px - x0).hypot(py - y0)
        } else if t > 1.0 {
            (px - x1).hypot(py - y1)
        } else {
            (px - (x0 + t * dx)).hypot(py - (y0 + t * dy))
        }
    }
}

struct SolverSession {
    id: u64,
    cancel: Arc<AtomicBool>,
    // dropping the handle detaches the worker; it exits at its next
    // cancellation check
    _handle: JoinHandle<()>,
}

/// Headless orchestrator: owns the presets, the live simulation, the
/// positions/colors the rasterizer reads, and at most one solver session.
pub struct MorphApp {
    size: (u32, u32),
    seed_count: u32,
    presets: Vec<Preset>,

    seeds: Vec<SeedPos>,
    colors: Arc<RwLock<Vec<SeedColor>>>,
    pixeldata: Arc<RwLock<Vec<PixelData>>>,
    sim: Sim,

    renderer: VoronoiRenderer,
    frame: Vec<u8>,
    recorder: FrameRecorder,

    pub gui: GuiState,
    // shared with the drawing solver: edit ages are differences on this clock
    frame_count: Arc<AtomicU32>,
    stroke_count: u32,

    progress_tx: mpsc::Sender<(u64, ProgressMsg)>,
    progress_rx: mpsc::Receiver<(u64, ProgressMsg)>,
    session: Option<SolverSession>,
    session_counter: u64,
    current_drawing_id: Arc<AtomicU32>,
}

impl MorphApp {
    pub fn new(presets: Vec<Preset>) -> Result<Self, Box<dyn Error>> {
        Self::with_resolution(presets, DEFAULT_RESOLUTION)
    }

    pub fn with_resolution(presets: Vec<Preset>, resolution: u32) -> Result<Self, Box<dyn Error>> {
        if presets.is_empty() {
            return Err("at least one preset is required".into());
        }
        for preset in &presets {
            preset.validate()?;
        }
        let (progress_tx, progress_rx) = mpsc::channel();

        let mut app = Self {
            size: (resolution, resolution),
            seed_count: 0,
            presets,
            seeds: Vec::new(),
            colors: Arc::new(RwLock::new(Vec::new())),
            pixeldata: Arc::new(RwLock::new(PixelData::init_canvas(0))),
            sim: Sim::new(String::new()),
            renderer: VoronoiRenderer::new(),
            frame: Vec::new(),
            recorder: FrameRecorder::new(),
            gui: GuiState::new(0),
            frame_count: Arc::new(AtomicU32::new(0)),
            stroke_count: 0,
            progress_tx,
            progress_rx,
            session: None,
            session_counter: 0,
            current_drawing_id: Arc::new(AtomicU32::new(0)),
        };
        app.load_preset(0);
        Ok(app)
    }

    fn apply_sim_init(
        &mut self,
        seed_count: u32,
        seeds: Vec<SeedPos>,
        colors: Vec<SeedColor>,
        sim: Sim,
    ) {
        self.seed_count = seed_count;
        self.seeds = seeds;
        self.sim = sim;
        *self.colors.write().unwrap() = colors;
        *self.pixeldata.write().unwrap() =
            PixelData::init_canvas(self.frame_count.load(Ordering::Relaxed));
    }

    pub fn load_preset(&mut self, index: usize) {
        let index = index.min(self.presets.len() - 1);
        let (count, seeds, colors, sim) =
            morph_sim::init_image(self.size.0, self.presets[index].clone());
        self.apply_sim_init(count, seeds, colors, sim);
        self.gui.current_preset = index;
        self.gui.reverse = false;
        self.sim.prepare_play(&mut self.seeds, false);
    }

    /// Rewind the morph, flipping direction when requested.
    pub fn toggle_play(&mut self, reverse: bool) {
        self.sim.prepare_play(&mut self.seeds, reverse);
        self.gui.reverse = reverse;
        self.gui.animate = true;
    }

    pub fn submit(&mut self, req: WorkerReq) -> Result<(), Box<dyn Error>> {
        match req {
            WorkerReq::Process { source, settings } => self.start_transform(source, settings),
            WorkerReq::Cancel => {
                self.cancel_session();
                Ok(())
            }
        }
    }

    /// Launch an optimizer session on a worker thread. Any running session
    /// is cancelled first; there is never more than one.
    pub fn start_transform(
        &mut self,
        source: UnprocessedPreset,
        settings: GenerationSettings,
    ) -> Result<(), Box<dyn Error>> {
        settings.validate()?;
        self.cancel_session();
        self.session_counter += 1;
        let sid = self.session_counter;
        let cancel = Arc::new(AtomicBool::new(false));
        info!(
            "starting {:?} session {sid} for '{}'",
            settings.algorithm, source.name
        );

        let tx = self.progress_tx.clone();
        let err_tx = self.progress_tx.clone();
        let worker_cancel = cancel.clone();
        let handle = thread::spawn(move || {
            let mut sink = move |msg: ProgressMsg| {
                tx.send((sid, msg)).ok();
            };
            if let Err(err) = calculate::process(source, settings, &mut sink, worker_cancel) {
                err_tx
                    .send((
                        sid,
                        ProgressMsg::Error {
                            message: err.to_string(),
                        },
                    ))
                    .ok();
            }
        });
        self.session = Some(SolverSession {
            id: sid,
            cancel,
            _handle: handle,
        });
        Ok(())
    }

    /// Cooperative cancellation of whatever session is live: transform
    /// workers watch the flag, the drawing solver watches the id.
    pub fn cancel_session(&mut self) {
        self.current_drawing_id.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.session.take() {
            session.cancel.store(true, Ordering::Relaxed);
            info!("cancelled session {}", session.id);
        }
    }

    pub fn session_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_mode(&mut self, mode: GuiMode) {
        if self.gui.mode == mode {
            return;
        }
        self.cancel_session();
        self.gui.mode = mode;
        match mode {
            GuiMode::Draw => self.enter_drawing_mode(),
            GuiMode::Transform => {
                self.load_preset(self.gui.current_preset);
                self.gui.animate = true;
            }
        }
    }

    /// Boot a blank canvas and launch the continuous drawing solver over
    /// the identity permutation.
    fn enter_drawing_mode(&mut self) {
        let side = DRAWING_CANVAS_SIZE;
        let n = (side * side) as usize;
        let source = UnprocessedPreset {
            name: "canvas".to_string(),
            width: side,
            height: side,
            source_img: vec![255; n * 3],
        };
        let (count, seeds, colors, sim) = morph_sim::init_canvas(self.size.0, &source);
        self.apply_sim_init(count, seeds, colors, sim);
        self.gui.animate = true;

        let my_id = self.current_drawing_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.session_counter += 1;
        let sid = self.session_counter;

        let mut settings = GenerationSettings::default(Uuid::new_v4(), "canvas".to_string());
        settings.sidelen = side;

        let tx = self.progress_tx.clone();
        let err_tx = self.progress_tx.clone();
        let colors = Arc::clone(&self.colors);
        let pixeldata = Arc::clone(&self.pixeldata);
        let frame_clock = Arc::clone(&self.frame_count);
        let current_id = Arc::clone(&self.current_drawing_id);
        let cancel = Arc::new(AtomicBool::new(false));

        let handle = thread::spawn(move || {
            let mut sink = move |msg: ProgressMsg| {
                tx.send((sid, msg)).ok();
            };
            if let Err(err) = drawing_process::drawing_process_genetic(
                source, settings, &mut sink, colors, pixeldata, frame_clock, my_id, current_id,
            ) {
                err_tx
                    .send((
                        sid,
                        ProgressMsg::Error {
                            message: err.to_string(),
                        },
                    ))
                    .ok();
            }
        });
        self.session = Some(SolverSession {
            id: sid,
            cancel,
            _handle: handle,
        });
    }

    /// Apply pending worker messages in arrival order, dropping anything
    /// from a retired session. Returns what was applied so a host UI can
    /// surface progress.
    pub fn pump_messages(&mut self) -> Vec<ProgressMsg> {
        let mut out = Vec::new();
        while let Ok((sid, msg)) = self.progress_rx.try_recv() {
            if self.session.as_ref().map(|s| s.id) != Some(sid) {
                continue;
            }
            match &msg {
                ProgressMsg::Done { preset } => {
                    info!("session {sid} finished: '{}'", preset.inner.name);
                    self.presets.push(preset.clone());
                    self.session = None;
                    self.load_preset(self.presets.len() - 1);
                    self.gui.animate = true;
                }
                ProgressMsg::UpdateAssignments { assignments } => {
                    if self.gui.mode == GuiMode::Draw {
                        let assignments: Vec<usize> =
                            assignments.iter().map(|&v| v as usize).collect();
                        self.sim.set_assignments(&assignments, self.size.0);
                    }
                }
                ProgressMsg::Cancelled => {
                    self.session = None;
                }
                ProgressMsg::Error { message } => {
                    warn!("session {sid} failed: {message}");
                    self.session = None;
                }
                _ => {}
            }
            out.push(msg);
        }
        out
    }

    /// Deposit brush paint along the segment from the previous pointer
    /// position, tagging every touched cell with the live stroke.
    pub fn paint(&mut self, mousepos: (f32, f32)) {
        if self.gui.mode != GuiMode::Draw {
            return;
        }
        let stroke_id = match self.gui.last_mouse_pos {
            Some(_) => self.stroke_count,
            None => {
                self.stroke_count += 1;
                self.stroke_count
            }
        };
        let from = self.gui.last_mouse_pos.unwrap_or(mousepos);
        let color = self.gui.drawing_color;
        let eraser = color == [0.0, 0.0, 0.0, DRAWING_ALPHA];
        let thickness = if eraser { 30.0 } else { 50.0 };
        let transition = 10.0;

        let now = self.frame_count.load(Ordering::Relaxed);
        let mut colors = self.colors.write().unwrap();
        let mut pixeldata = self.pixeldata.write().unwrap();
        for (i, seedpos) in self.seeds.iter().enumerate() {
            let dist = point_to_line_dist(
                seedpos.xy[0],
                seedpos.xy[1],
                from.0,
                from.1,
                mousepos.0,
                mousepos.1,
            );
            if dist < thickness + transition {
                let alpha =
                    ((thickness + transition - dist) / transition).clamp(0.0, 1.0) * color[3];
                let blend = |c1: f32, c2: f32, a: f32| (1.0 - a) * c1 + a * c2;
                colors[i].rgba[0] = blend(colors[i].rgba[0], color[0], alpha);
                colors[i].rgba[1] = blend(colors[i].rgba[1], color[1], alpha);
                colors[i].rgba[2] = blend(colors[i].rgba[2], color[2], alpha);

                let cell = &mut self.sim.cells_mut()[i];
                cell.set_age(0);
                cell.set_dst_force(0.05 + (stroke_id as f32 * 0.004).sqrt());
                cell.set_stroke_id(stroke_id);
                pixeldata[i] = PixelData {
                    stroke_id,
                    last_edited: now,
                };
            }
        }
        drop(colors);
        drop(pixeldata);
        self.gui.last_mouse_pos = Some(mousepos);
    }

    pub fn end_stroke(&mut self) {
        self.gui.last_mouse_pos = None;
    }

    /// One animation tick: step the simulation, rasterize, feed the
    /// recorder while it is live.
    pub fn advance_frame(&mut self) {
        if self.gui.animate {
            self.sim.step(&mut self.seeds, self.size.0);
        }
        {
            let colors = self.colors.read().unwrap();
            self.renderer
                .render(&self.seeds, &colors, self.size.0, &mut self.frame);
        }
        if self.recorder.is_recording() {
            self.recorder
                .capture_frame(&self.frame, self.size.0, self.size.1);
        }
        self.frame_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_recording(&mut self) {
        self.recorder.start();
    }

    pub fn stop_recording(&mut self) -> Vec<Vec<u8>> {
        self.recorder.stop();
        self.recorder.take_frames()
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn seed_count(&self) -> u32 {
        self.seed_count
    }

    pub fn seeds(&self) -> &[SeedPos] {
        &self.seeds
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    pub fn colors(&self) -> Arc<RwLock<Vec<SeedColor>>> {
        Arc::clone(&self.colors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_preset(side: u32) -> Preset {
        let n = (side * side) as usize;
        Preset {
            inner: UnprocessedPreset {
                name: "gradient".to_string(),
                width: side,
                height: side,
                source_img: (0..n)
                    .flat_map(|i| {
                        [
                            ((i * 7) % 256) as u8,
                            ((i * 13) % 256) as u8,
                            ((i * 29) % 256) as u8,
                        ]
                    })
                    .collect(),
            },
            assignments: (0..n).rev().collect(),
        }
    }

    #[test]
    fn point_to_segment_distance() {
        // degenerate segment
        assert_eq!(point_to_line_dist(3.0, 4.0, 0.0, 0.0, 0.0, 0.0), 5.0);
        // projection on the segment
        assert_eq!(point_to_line_dist(5.0, 3.0, 0.0, 0.0, 10.0, 0.0), 3.0);
        // beyond either end
        assert_eq!(point_to_line_dist(-3.0, 4.0, 0.0, 0.0, 10.0, 0.0), 5.0);
        assert_eq!(point_to_line_dist(13.0, 4.0, 0.0, 0.0, 10.0, 0.0), 5.0);
    }

    #[test]
    fn app_boots_and_renders() {
        let mut app = MorphApp::with_resolution(vec![gradient_preset(8)], 64).unwrap();
        assert_eq!(app.seed_count(), 64);
        for _ in 0..3 {
            app.advance_frame();
        }
        assert_eq!(app.frame().len(), 64 * 64 * 4);
        assert!(app.frame().iter().any(|&b| b != 0));
    }

    #[test]
    fn empty_preset_list_is_rejected() {
        assert!(MorphApp::new(Vec::new()).is_err());
    }

    #[test]
    fn toggle_play_restores_endpoints() {
        let mut app = MorphApp::with_resolution(vec![gradient_preset(4)], 64).unwrap();
        let srcs: Vec<_> = app.sim().cells().iter().map(|c| c.src()).collect();
        let dsts: Vec<_> = app.sim().cells().iter().map(|c| c.dst()).collect();

        app.toggle_play(true);
        assert!(app.gui.reverse);
        app.toggle_play(false);
        for (i, cell) in app.sim().cells().iter().enumerate() {
            assert_eq!(cell.src(), srcs[i]);
            assert_eq!(cell.dst(), dsts[i]);
        }
    }

    #[test]
    fn recording_captures_frames() {
        let mut app = MorphApp::with_resolution(vec![gradient_preset(4)], 32).unwrap();
        app.start_recording();
        app.advance_frame();
        app.advance_frame();
        let frames = app.stop_recording();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 32 * 32 * 4);
    }

    #[test]
    fn painting_tags_cells_and_colors() {
        let mut app = MorphApp::with_resolution(vec![gradient_preset(4)], 256).unwrap();
        app.set_mode(GuiMode::Draw);
        assert_eq!(app.seed_count(), DRAWING_CANVAS_SIZE * DRAWING_CANVAS_SIZE);

        app.paint((100.0, 100.0));
        app.paint((120.0, 100.0));
        app.end_stroke();

        let tagged = app
            .sim()
            .cells()
            .iter()
            .filter(|c| c.stroke_id() != 0)
            .count();
        assert!(tagged > 0, "brush must tag cells with the stroke id");

        let colors = app.colors();
        let touched = colors
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.rgba != [1.0, 1.0, 1.0, 1.0])
            .count();
        assert!(touched > 0, "brush must deposit color");

        // a second stroke gets a fresh id
        app.paint((200.0, 200.0));
        let max_stroke = app
            .sim()
            .cells()
            .iter()
            .map(|c| c.stroke_id())
            .max()
            .unwrap();
        assert_eq!(max_stroke, 2);

        // leaving draw mode retires the solver and restores the preset
        app.set_mode(GuiMode::Transform);
        assert_eq!(app.seed_count(), 16);
    }

    #[test]
    fn stale_messages_are_discarded() {
        let mut app = MorphApp::with_resolution(vec![gradient_preset(4)], 32).unwrap();
        // message tagged with a session id that is not live
        app.progress_tx.send((99, ProgressMsg::Cancelled)).unwrap();
        let applied = app.pump_messages();
        assert!(applied.is_empty());
    }
}

use crate::app::DRAWING_ALPHA;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuiMode {
    Transform,
    Draw,
}

/// The slice of UI state the core reads.
pub struct GuiState {
    pub current_preset: usize,
    pub animate: bool,
    pub reverse: bool,
    pub mode: GuiMode,
    pub drawing_color: [f32; 4],
    pub last_mouse_pos: Option<(f32, f32)>,
}

impl GuiState {
    pub fn new(current_preset: usize) -> Self {
        Self {
            current_preset,
            animate: true,
            reverse: false,
            mode: GuiMode::Transform,
            drawing_color: [0.9, 0.2, 0.2, DRAWING_ALPHA],
            last_mouse_pos: None,
        }
    }
}

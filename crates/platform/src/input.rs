//! Keyboard and mouse state between frames.

use std::collections::HashSet;

use winit::event::{ElementState, KeyEvent};
use winit::keyboard::PhysicalKey;

pub use winit::keyboard::KeyCode;

/// Mouse button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Other(u16),
}

impl From<winit::event::MouseButton> for MouseButton {
    fn from(button: winit::event::MouseButton) -> Self {
        match button {
            winit::event::MouseButton::Left => MouseButton::Left,
            winit::event::MouseButton::Right => MouseButton::Right,
            winit::event::MouseButton::Middle => MouseButton::Middle,
            winit::event::MouseButton::Back => MouseButton::Other(3),
            winit::event::MouseButton::Forward => MouseButton::Other(4),
            winit::event::MouseButton::Other(id) => MouseButton::Other(id),
        }
    }
}

/// A key transition extracted from a winit keyboard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransition {
    Down(KeyCode),
    Up(KeyCode),
}

impl KeyTransition {
    /// Translates a keyboard event. Auto-repeats and keys without a
    /// physical code yield `None`.
    pub fn from_event(event: &KeyEvent) -> Option<Self> {
        if event.repeat {
            return None;
        }
        let PhysicalKey::Code(code) = event.physical_key else {
            return None;
        };
        Some(match event.state {
            ElementState::Pressed => Self::Down(code),
            ElementState::Released => Self::Up(code),
        })
    }
}

/// Held keys and buttons plus the mouse motion gathered since the last
/// frame.
#[derive(Debug, Default)]
pub struct InputState {
    held_keys: HashSet<KeyCode>,
    pressed_this_frame: HashSet<KeyCode>,
    held_buttons: HashSet<MouseButton>,
    cursor: (f32, f32),
    /// Relative motion; several events may arrive per frame.
    motion: (f32, f32),
    scroll: f32,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the per-frame state. Call after the frame consumed it.
    pub fn end_frame(&mut self) {
        self.pressed_this_frame.clear();
        self.motion = (0.0, 0.0);
        self.scroll = 0.0;
    }

    /// Applies a key transition. Returns false if it changed nothing,
    /// such as a release for a key pressed before the window had focus.
    pub fn apply_key(&mut self, transition: KeyTransition) -> bool {
        match transition {
            KeyTransition::Down(key) => {
                let changed = self.held_keys.insert(key);
                if changed {
                    self.pressed_this_frame.insert(key);
                }
                changed
            }
            KeyTransition::Up(key) => self.held_keys.remove(&key),
        }
    }

    pub fn on_button(&mut self, button: MouseButton, pressed: bool) {
        if pressed {
            self.held_buttons.insert(button);
        } else {
            self.held_buttons.remove(&button);
        }
    }

    pub fn on_cursor_moved(&mut self, x: f32, y: f32) {
        self.cursor = (x, y);
    }

    /// Accumulates raw relative motion.
    pub fn on_motion(&mut self, dx: f32, dy: f32) {
        self.motion.0 += dx;
        self.motion.1 += dy;
    }

    pub fn on_scroll(&mut self, lines: f32) {
        self.scroll += lines;
    }

    /// Releases everything, e.g. when the window loses focus. Returns the
    /// keys that were held.
    pub fn release_all(&mut self) -> Vec<KeyCode> {
        self.held_buttons.clear();
        self.pressed_this_frame.clear();
        self.held_keys.drain().collect()
    }

    pub fn is_key_held(&self, key: KeyCode) -> bool {
        self.held_keys.contains(&key)
    }

    pub fn is_key_just_pressed(&self, key: KeyCode) -> bool {
        self.pressed_this_frame.contains(&key)
    }

    pub fn is_button_held(&self, button: MouseButton) -> bool {
        self.held_buttons.contains(&button)
    }

    pub fn cursor(&self) -> (f32, f32) {
        self.cursor
    }

    pub fn motion(&self) -> (f32, f32) {
        self.motion
    }

    pub fn scroll(&self) -> f32 {
        self.scroll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_down_up() {
        let mut input = InputState::new();
        assert!(input.apply_key(KeyTransition::Down(KeyCode::KeyW)));
        assert!(input.is_key_held(KeyCode::KeyW));
        assert!(input.is_key_just_pressed(KeyCode::KeyW));

        // A second press without release is not a new transition.
        assert!(!input.apply_key(KeyTransition::Down(KeyCode::KeyW)));

        input.end_frame();
        assert!(input.is_key_held(KeyCode::KeyW));
        assert!(!input.is_key_just_pressed(KeyCode::KeyW));

        assert!(input.apply_key(KeyTransition::Up(KeyCode::KeyW)));
        assert!(!input.is_key_held(KeyCode::KeyW));
    }

    #[test]
    fn test_release_of_unheld_key_is_ignored() {
        let mut input = InputState::new();
        assert!(!input.apply_key(KeyTransition::Up(KeyCode::Escape)));
    }

    #[test]
    fn test_motion_accumulates_until_end_frame() {
        let mut input = InputState::new();
        input.on_motion(2.0, -1.0);
        input.on_motion(3.0, 4.0);
        input.on_scroll(1.0);
        assert_eq!(input.motion(), (5.0, 3.0));
        assert_eq!(input.scroll(), 1.0);

        input.end_frame();
        assert_eq!(input.motion(), (0.0, 0.0));
        assert_eq!(input.scroll(), 0.0);
    }

    #[test]
    fn test_release_all_reports_held_keys() {
        let mut input = InputState::new();
        input.apply_key(KeyTransition::Down(KeyCode::KeyA));
        input.apply_key(KeyTransition::Down(KeyCode::KeyD));
        input.on_button(MouseButton::Right, true);

        let released = input.release_all();
        assert_eq!(released.len(), 2);
        assert!(released.contains(&KeyCode::KeyA));
        assert!(!input.is_key_held(KeyCode::KeyA));
        assert!(!input.is_button_held(MouseButton::Right));
    }

    #[test]
    fn test_mouse_button_conversion() {
        assert_eq!(MouseButton::from(winit::event::MouseButton::Middle), MouseButton::Middle);
        assert_eq!(MouseButton::from(winit::event::MouseButton::Other(7)), MouseButton::Other(7));
    }
}
